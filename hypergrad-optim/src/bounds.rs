use std::collections::BTreeMap;

use hypergrad::{HyperId, Hyperparameters, Result};
use num_traits::Float;

/// Per-hyperparameter box constraints, enforced by projection after every
/// update.
#[derive(Debug, Clone, Default)]
pub struct Bounds<F> {
    ranges: BTreeMap<HyperId, (F, F)>,
}

impl<F: Float> Bounds<F> {
    pub fn new() -> Self {
        Bounds {
            ranges: BTreeMap::new(),
        }
    }

    /// Constrain every element of `id` to `[lower, upper]`.
    pub fn set(&mut self, id: HyperId, lower: F, upper: F) -> &mut Self {
        assert!(lower <= upper, "lower bound must not exceed upper bound");
        self.ranges.insert(id, (lower, upper));
        self
    }

    /// Constrain `id` to `[lower, +inf)`.
    pub fn at_least(&mut self, id: HyperId, lower: F) -> &mut Self {
        self.set(id, lower, F::infinity())
    }

    pub fn get(&self, id: HyperId) -> Option<(F, F)> {
        self.ranges.get(&id).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Clamp `value` into the box of `id`, if it has one.
    pub fn project_value(&self, id: HyperId, value: &mut [F]) {
        if let Some(&(lo, hi)) = self.ranges.get(&id) {
            for x in value.iter_mut() {
                *x = x.max(lo).min(hi);
            }
        }
    }

    /// Project every constrained hyperparameter in `hypers`.
    pub fn project(&self, hypers: &mut Hyperparameters<F>) -> Result<()>
    where
        F: hypergrad::Float,
    {
        for (&id, &(lo, hi)) in &self.ranges {
            for x in hypers.value_mut(id)?.iter_mut() {
                *x = x.max(lo).min(hi);
            }
        }
        Ok(())
    }
}
