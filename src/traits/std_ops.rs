use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use crate::dual::Dual;
use crate::float::Float;
use crate::reverse::Reverse;
use crate::tape::{self, TapeThreadLocal, CONSTANT};

// ──────────────────────────────────────────────
//  Dual<F> operators
// ──────────────────────────────────────────────

impl<F: Float> Add for Dual<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Dual {
            re: self.re + rhs.re,
            eps: self.eps + rhs.eps,
        }
    }
}

impl<F: Float> Sub for Dual<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Dual {
            re: self.re - rhs.re,
            eps: self.eps - rhs.eps,
        }
    }
}

impl<F: Float> Mul for Dual<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Dual {
            re: self.re * rhs.re,
            eps: self.re * rhs.eps + self.eps * rhs.re,
        }
    }
}

impl<F: Float> Div for Dual<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let inv = F::one() / rhs.re;
        Dual {
            re: self.re * inv,
            eps: (self.eps * rhs.re - self.re * rhs.eps) * inv * inv,
        }
    }
}

impl<F: Float> Neg for Dual<F> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Dual {
            re: -self.re,
            eps: -self.eps,
        }
    }
}

impl<F: Float> Add<F> for Dual<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: F) -> Self {
        Dual {
            re: self.re + rhs,
            eps: self.eps,
        }
    }
}

impl<F: Float> Sub<F> for Dual<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: F) -> Self {
        Dual {
            re: self.re - rhs,
            eps: self.eps,
        }
    }
}

impl<F: Float> Mul<F> for Dual<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: F) -> Self {
        Dual {
            re: self.re * rhs,
            eps: self.eps * rhs,
        }
    }
}

impl<F: Float> Div<F> for Dual<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: F) -> Self {
        let inv = F::one() / rhs;
        Dual {
            re: self.re * inv,
            eps: self.eps * inv,
        }
    }
}

impl<F: Float> AddAssign for Dual<F> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<F: Float> SubAssign for Dual<F> {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<F: Float> MulAssign for Dual<F> {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<F: Float> DivAssign for Dual<F> {
    #[inline]
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}

// Primitive float on the left: generated for f32 and f64.
macro_rules! impl_float_dual_ops {
    ($f:ty) => {
        impl Add<Dual<$f>> for $f {
            type Output = Dual<$f>;
            #[inline]
            fn add(self, rhs: Dual<$f>) -> Dual<$f> {
                rhs + self
            }
        }

        impl Sub<Dual<$f>> for $f {
            type Output = Dual<$f>;
            #[inline]
            fn sub(self, rhs: Dual<$f>) -> Dual<$f> {
                Dual {
                    re: self - rhs.re,
                    eps: -rhs.eps,
                }
            }
        }

        impl Mul<Dual<$f>> for $f {
            type Output = Dual<$f>;
            #[inline]
            fn mul(self, rhs: Dual<$f>) -> Dual<$f> {
                rhs * self
            }
        }

        impl Div<Dual<$f>> for $f {
            type Output = Dual<$f>;
            #[inline]
            fn div(self, rhs: Dual<$f>) -> Dual<$f> {
                let inv = 1.0 / rhs.re;
                Dual {
                    re: self * inv,
                    eps: -self * rhs.eps * inv * inv,
                }
            }
        }
    };
}

impl_float_dual_ops!(f32);
impl_float_dual_ops!(f64);

impl<F: Float> PartialEq for Dual<F> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.re == other.re
    }
}

impl<F: Float> PartialOrd for Dual<F> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.re.partial_cmp(&other.re)
    }
}

// ──────────────────────────────────────────────
//  Reverse<F> operators
// ──────────────────────────────────────────────

// Constant-only expressions never touch the tape, so objectives and steps that
// ignore some inputs stay cheap and need no active tape for those parts.
#[inline]
fn record_binary<F: TapeThreadLocal>(
    value: F,
    lhs: Reverse<F>,
    lhs_mult: F,
    rhs: Reverse<F>,
    rhs_mult: F,
) -> Reverse<F> {
    if lhs.index == CONSTANT && rhs.index == CONSTANT {
        return Reverse::constant(value);
    }
    let index = tape::with_active_tape(|t| t.push_binary(lhs.index, lhs_mult, rhs.index, rhs_mult));
    Reverse { value, index }
}

#[inline]
fn record_unary<F: TapeThreadLocal>(value: F, operand: Reverse<F>, mult: F) -> Reverse<F> {
    if operand.index == CONSTANT {
        return Reverse::constant(value);
    }
    let index = tape::with_active_tape(|t| t.push_unary(operand.index, mult));
    Reverse { value, index }
}

impl<F: TapeThreadLocal> Add for Reverse<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        record_binary(self.value + rhs.value, self, F::one(), rhs, F::one())
    }
}

impl<F: TapeThreadLocal> Sub for Reverse<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        record_binary(self.value - rhs.value, self, F::one(), rhs, -F::one())
    }
}

impl<F: TapeThreadLocal> Mul for Reverse<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        record_binary(self.value * rhs.value, self, rhs.value, rhs, self.value)
    }
}

impl<F: TapeThreadLocal> Div for Reverse<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        let inv = F::one() / rhs.value;
        let value = self.value * inv;
        record_binary(value, self, inv, rhs, -value * inv)
    }
}

impl<F: TapeThreadLocal> Neg for Reverse<F> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        record_unary(-self.value, self, -F::one())
    }
}

impl<F: TapeThreadLocal> Add<F> for Reverse<F> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: F) -> Self {
        record_unary(self.value + rhs, self, F::one())
    }
}

impl<F: TapeThreadLocal> Sub<F> for Reverse<F> {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: F) -> Self {
        record_unary(self.value - rhs, self, F::one())
    }
}

impl<F: TapeThreadLocal> Mul<F> for Reverse<F> {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: F) -> Self {
        record_unary(self.value * rhs, self, rhs)
    }
}

impl<F: TapeThreadLocal> Div<F> for Reverse<F> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: F) -> Self {
        let inv = F::one() / rhs;
        record_unary(self.value * inv, self, inv)
    }
}

impl<F: TapeThreadLocal> AddAssign for Reverse<F> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl<F: TapeThreadLocal> SubAssign for Reverse<F> {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl<F: TapeThreadLocal> MulAssign for Reverse<F> {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl<F: TapeThreadLocal> DivAssign for Reverse<F> {
    #[inline]
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}

macro_rules! impl_float_reverse_ops {
    ($f:ty) => {
        impl Add<Reverse<$f>> for $f {
            type Output = Reverse<$f>;
            #[inline]
            fn add(self, rhs: Reverse<$f>) -> Reverse<$f> {
                rhs + self
            }
        }

        impl Sub<Reverse<$f>> for $f {
            type Output = Reverse<$f>;
            #[inline]
            fn sub(self, rhs: Reverse<$f>) -> Reverse<$f> {
                record_unary(self - rhs.value, rhs, -1.0)
            }
        }

        impl Mul<Reverse<$f>> for $f {
            type Output = Reverse<$f>;
            #[inline]
            fn mul(self, rhs: Reverse<$f>) -> Reverse<$f> {
                rhs * self
            }
        }

        impl Div<Reverse<$f>> for $f {
            type Output = Reverse<$f>;
            #[inline]
            fn div(self, rhs: Reverse<$f>) -> Reverse<$f> {
                let inv: $f = 1.0 / rhs.value;
                record_unary(self * inv, rhs, -self * inv * inv)
            }
        }
    };
}

impl_float_reverse_ops!(f32);
impl_float_reverse_ops!(f64);

impl<F: Float> PartialEq for Reverse<F> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<F: Float> PartialOrd for Reverse<F> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(&other.value)
    }
}
