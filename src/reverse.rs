use std::fmt::{self, Display};

use crate::tape::{self, TapeThreadLocal, CONSTANT};
use crate::Float;

/// Reverse-mode AD variable.
///
/// A value and a tape index. `Copy` because the tape lives in a thread-local,
/// not inside this struct. Arithmetic on non-constant values requires an
/// active tape (see [`crate::trace::ReverseTrace::record`]).
#[derive(Clone, Copy, Debug)]
pub struct Reverse<F: Float> {
    pub(crate) value: F,
    pub(crate) index: u32,
}

impl<F: Float> Reverse<F> {
    /// Create a constant (not tracked on tape).
    #[inline]
    pub fn constant(value: F) -> Self {
        Reverse {
            value,
            index: CONSTANT,
        }
    }

    /// Create a reverse variable from a tape allocation.
    #[inline]
    pub fn from_tape(value: F, index: u32) -> Self {
        Reverse { value, index }
    }

    /// Tape index, or [`CONSTANT`].
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Primal value.
    #[inline]
    pub fn value(&self) -> F {
        self.value
    }

    /// Whether this value is recorded on a tape.
    #[inline]
    pub fn is_constant(&self) -> bool {
        self.index == CONSTANT
    }
}

impl<F: TapeThreadLocal> Reverse<F> {
    #[inline]
    fn chain(self, value: F, deriv: F) -> Self {
        if self.index == CONSTANT {
            return Reverse::constant(value);
        }
        let index = tape::with_active_tape(|t| t.push_unary(self.index, deriv));
        Reverse { value, index }
    }

    #[inline]
    pub fn exp(self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }

    #[inline]
    pub fn ln(self) -> Self {
        self.chain(self.value.ln(), F::one() / self.value)
    }

    #[inline]
    pub fn sqrt(self) -> Self {
        let s = self.value.sqrt();
        self.chain(s, F::one() / (s + s))
    }

    #[inline]
    pub fn powi(self, n: i32) -> Self {
        let deriv = F::lit(f64::from(n)) * self.value.powi(n - 1);
        self.chain(self.value.powi(n), deriv)
    }

    #[inline]
    pub fn recip(self) -> Self {
        let inv = F::one() / self.value;
        self.chain(inv, -inv * inv)
    }

    #[inline]
    pub fn sin(self) -> Self {
        self.chain(self.value.sin(), self.value.cos())
    }

    #[inline]
    pub fn cos(self) -> Self {
        self.chain(self.value.cos(), -self.value.sin())
    }

    #[inline]
    pub fn tanh(self) -> Self {
        let t = self.value.tanh();
        self.chain(t, F::one() - t * t)
    }

    #[inline]
    pub fn abs(self) -> Self {
        self.chain(self.value.abs(), self.value.signum())
    }
}

impl<F: Float> Display for Reverse<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<F: Float> Default for Reverse<F> {
    fn default() -> Self {
        Reverse::constant(F::zero())
    }
}
