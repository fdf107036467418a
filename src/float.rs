use std::fmt::{Debug, Display};

use num_traits::{Float as NumFloat, FloatConst, FromPrimitive};

/// Marker trait for base floating-point types (`f32`, `f64`).
///
/// Bundles the numeric traits the engines need for state, hyperparameter and
/// hypergradient values. Only primitive float types implement this; the AD
/// wrapper types do not.
pub trait Float:
    NumFloat + FloatConst + FromPrimitive + Copy + Send + Sync + Default + Debug + Display + 'static
{
    /// Convert an `f64` literal. Values the type cannot represent become NaN.
    #[inline]
    fn lit(v: f64) -> Self {
        <Self as FromPrimitive>::from_f64(v).unwrap_or_else(<Self as NumFloat>::nan)
    }
}

impl Float for f32 {}
impl Float for f64 {}

/// Number of scalar elements in a tensor of the given shape (`1` for rank 0).
#[inline]
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}
