//! The [`Scalar`] trait for writing AD-generic dynamics and objectives.
//!
//! A dynamics step written as `fn step<T: Scalar<F>>(...)` is evaluated by the
//! engines with three instantiations: plain `F` to advance the state,
//! [`Dual<F>`] for Jacobian-vector products (forward mode), and
//! [`Reverse<F>`] for vector-Jacobian products and dependency analysis
//! (reverse mode, detachment checks).

use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::dual::Dual;
use crate::float::Float;
use crate::reverse::Reverse;
use crate::tape::TapeThreadLocal;

/// Numeric type a dynamics step or outer objective can be evaluated with.
///
/// Arithmetic with the base float `F` on the right-hand side is always
/// available (`x * lr`), so generic code rarely needs [`Scalar::from_f`].
pub trait Scalar<F: Float>:
    Copy
    + Debug
    + Default
    + PartialOrd
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<F, Output = Self>
    + Sub<F, Output = Self>
    + Mul<F, Output = Self>
    + Div<F, Output = Self>
{
    /// Lift a plain float to this scalar (constant, zero derivative).
    fn from_f(val: F) -> Self;

    /// Extract the primal value.
    fn value(&self) -> F;

    #[inline]
    fn zero() -> Self {
        Self::from_f(F::zero())
    }

    #[inline]
    fn one() -> Self {
        Self::from_f(F::one())
    }

    /// Lift an `f64` literal.
    #[inline]
    fn lit(val: f64) -> Self {
        Self::from_f(F::lit(val))
    }

    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn sqrt(self) -> Self;
    fn powi(self, n: i32) -> Self;
    fn recip(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn tanh(self) -> Self;
    fn abs(self) -> Self;

    /// Logistic sigmoid, `1 / (1 + e^{-x})`.
    #[inline]
    fn sigmoid(self) -> Self {
        ((-self).exp() + F::one()).recip()
    }
}

/// Base floats usable by both engines: traced on the thread-local tape and
/// usable directly as plain scalars.
pub trait Real: TapeThreadLocal + Scalar<Self> {}

impl Real for f32 {}
impl Real for f64 {}

macro_rules! impl_scalar_for_float {
    ($f:ty) => {
        impl Scalar<$f> for $f {
            #[inline]
            fn from_f(val: $f) -> Self {
                val
            }

            #[inline]
            fn value(&self) -> $f {
                *self
            }

            #[inline]
            fn exp(self) -> Self {
                <$f>::exp(self)
            }

            #[inline]
            fn ln(self) -> Self {
                <$f>::ln(self)
            }

            #[inline]
            fn sqrt(self) -> Self {
                <$f>::sqrt(self)
            }

            #[inline]
            fn powi(self, n: i32) -> Self {
                <$f>::powi(self, n)
            }

            #[inline]
            fn recip(self) -> Self {
                <$f>::recip(self)
            }

            #[inline]
            fn sin(self) -> Self {
                <$f>::sin(self)
            }

            #[inline]
            fn cos(self) -> Self {
                <$f>::cos(self)
            }

            #[inline]
            fn tanh(self) -> Self {
                <$f>::tanh(self)
            }

            #[inline]
            fn abs(self) -> Self {
                <$f>::abs(self)
            }
        }
    };
}

impl_scalar_for_float!(f32);
impl_scalar_for_float!(f64);

impl<F: Float> Scalar<F> for Dual<F> {
    #[inline]
    fn from_f(val: F) -> Self {
        Dual::constant(val)
    }

    #[inline]
    fn value(&self) -> F {
        self.re
    }

    #[inline]
    fn exp(self) -> Self {
        Dual::exp(self)
    }

    #[inline]
    fn ln(self) -> Self {
        Dual::ln(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        Dual::sqrt(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        Dual::powi(self, n)
    }

    #[inline]
    fn recip(self) -> Self {
        Dual::recip(self)
    }

    #[inline]
    fn sin(self) -> Self {
        Dual::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        Dual::cos(self)
    }

    #[inline]
    fn tanh(self) -> Self {
        Dual::tanh(self)
    }

    #[inline]
    fn abs(self) -> Self {
        Dual::abs(self)
    }
}

impl<F: TapeThreadLocal> Scalar<F> for Reverse<F> {
    #[inline]
    fn from_f(val: F) -> Self {
        Reverse::constant(val)
    }

    #[inline]
    fn value(&self) -> F {
        self.value
    }

    #[inline]
    fn exp(self) -> Self {
        Reverse::exp(self)
    }

    #[inline]
    fn ln(self) -> Self {
        Reverse::ln(self)
    }

    #[inline]
    fn sqrt(self) -> Self {
        Reverse::sqrt(self)
    }

    #[inline]
    fn powi(self, n: i32) -> Self {
        Reverse::powi(self, n)
    }

    #[inline]
    fn recip(self) -> Self {
        Reverse::recip(self)
    }

    #[inline]
    fn sin(self) -> Self {
        Reverse::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        Reverse::cos(self)
    }

    #[inline]
    fn tanh(self) -> Self {
        Reverse::tanh(self)
    }

    #[inline]
    fn abs(self) -> Self {
        Reverse::abs(self)
    }
}
