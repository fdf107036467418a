//! Per-hyperparameter hypergradient contributions.
//!
//! Every registration owns one slot per hyperparameter it differentiates; the
//! engines write into their slots and [`HypergradientAccumulator::retrieve`]
//! combines the slots of one hyperparameter into a single gradient.
//!
//! Engines hold the accumulator through a [`SharedAccumulator`] handle, so
//! several live engines can write into one accumulator:
//!
//! ```
//! use hypergrad::{AdjointEngine, HypergradientAccumulator, SensitivityEngine};
//!
//! let shared = HypergradientAccumulator::<f64>::shared();
//! let reverse = AdjointEngine::<f64>::new().with_accumulator(shared.clone());
//! let forward = SensitivityEngine::<f64>::new().with_accumulator(shared.clone());
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::float::Float;
use crate::hyper::{HyperId, Hyperparameters};

/// Location of one contribution slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub hyper: HyperId,
    pub index: usize,
}

/// How several contributions to the same hyperparameter are combined.
pub enum Aggregation<F> {
    /// Elementwise mean.
    Mean,
    /// Elementwise sum.
    Sum,
    /// Any reduction over the list of contributions.
    Custom(Box<dyn Fn(&[Vec<F>]) -> Vec<F>>),
}

impl<F> Default for Aggregation<F> {
    fn default() -> Self {
        Aggregation::Mean
    }
}

impl<F> fmt::Debug for Aggregation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Mean => write!(f, "Mean"),
            Aggregation::Sum => write!(f, "Sum"),
            Aggregation::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl<F: Float> Aggregation<F> {
    /// Combine `contributions`. A single contribution is returned as-is.
    pub fn apply(&self, contributions: &[Vec<F>]) -> Vec<F> {
        if contributions.len() == 1 {
            return contributions[0].clone();
        }
        match self {
            Aggregation::Mean => {
                let mut out = elementwise_sum(contributions);
                let n = F::lit(contributions.len() as f64);
                for v in &mut out {
                    *v = *v / n;
                }
                out
            }
            Aggregation::Sum => elementwise_sum(contributions),
            Aggregation::Custom(reduce) => reduce(contributions),
        }
    }
}

fn elementwise_sum<F: Float>(contributions: &[Vec<F>]) -> Vec<F> {
    let len = contributions.first().map_or(0, Vec::len);
    let mut out = vec![F::zero(); len];
    for c in contributions {
        assert_eq!(c.len(), len, "contributions must have the same length");
        for (o, &v) in out.iter_mut().zip(c.iter()) {
            *o = *o + v;
        }
    }
    out
}

/// Post-processing that clamps every element to `[lo, hi]`.
pub fn clip_by_value<F: Float>(lo: F, hi: F) -> impl Fn(Vec<F>) -> Vec<F> {
    move |g| g.into_iter().map(|v| v.max(lo).min(hi)).collect()
}

/// Post-processing that rescales the gradient to Euclidean norm at most
/// `max_norm`.
pub fn clip_by_norm<F: Float>(max_norm: F) -> impl Fn(Vec<F>) -> Vec<F> {
    move |g| {
        let norm = g.iter().fold(F::zero(), |acc, &v| acc + v * v).sqrt();
        if norm <= max_norm || norm == F::zero() {
            g
        } else {
            let scale = max_norm / norm;
            g.into_iter().map(|v| v * scale).collect()
        }
    }
}

/// Handle to an accumulator shared between engines on one thread.
pub type SharedAccumulator<F> = Rc<RefCell<HypergradientAccumulator<F>>>;

/// Hypergradient contributions keyed by hyperparameter.
#[derive(Clone, Debug, Default)]
pub struct HypergradientAccumulator<F> {
    entries: BTreeMap<HyperId, Vec<Vec<F>>>,
}

impl<F: Float> HypergradientAccumulator<F> {
    pub fn new() -> Self {
        HypergradientAccumulator {
            entries: BTreeMap::new(),
        }
    }

    /// A fresh accumulator behind a [`SharedAccumulator`] handle.
    pub fn shared() -> SharedAccumulator<F> {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Open a zeroed slot of `len` elements for `hyper`.
    pub fn register(&mut self, hyper: HyperId, len: usize) -> SlotId {
        let slots = self.entries.entry(hyper).or_default();
        slots.push(vec![F::zero(); len]);
        SlotId {
            hyper,
            index: slots.len() - 1,
        }
    }

    /// Append an externally computed contribution for `hyper`.
    pub fn add_contribution(&mut self, hyper: HyperId, contribution: Vec<F>) -> SlotId {
        tracing::trace!(hyper = %hyper, len = contribution.len(), "external contribution");
        let slots = self.entries.entry(hyper).or_default();
        slots.push(contribution);
        SlotId {
            hyper,
            index: slots.len() - 1,
        }
    }

    pub fn slot(&self, id: SlotId) -> Option<&[F]> {
        self.entries
            .get(&id.hyper)
            .and_then(|slots| slots.get(id.index))
            .map(Vec::as_slice)
    }

    /// Panics on a slot this accumulator never handed out.
    pub(crate) fn slot_mut(&mut self, id: SlotId) -> &mut [F] {
        self.entries
            .get_mut(&id.hyper)
            .and_then(|slots| slots.get_mut(id.index))
            .map(Vec::as_mut_slice)
            .unwrap_or_else(|| panic!("slot {:?} is not registered", id))
    }

    pub(crate) fn zero(&mut self, id: SlotId) {
        for v in self.slot_mut(id) {
            *v = F::zero();
        }
    }

    /// Overwrite a slot.
    pub(crate) fn store(&mut self, id: SlotId, values: &[F]) {
        self.slot_mut(id).copy_from_slice(values);
    }

    /// Add `values` elementwise into a slot.
    pub(crate) fn accumulate(&mut self, id: SlotId, values: &[F]) {
        let slot = self.slot_mut(id);
        assert_eq!(slot.len(), values.len(), "contribution length must match slot");
        for (s, &v) in slot.iter_mut().zip(values.iter()) {
            *s = *s + v;
        }
    }

    /// Every contribution held for `hyper`, in slot order.
    pub fn contributions(&self, hyper: HyperId) -> &[Vec<F>] {
        self.entries.get(&hyper).map_or(&[][..], Vec::as_slice)
    }

    pub fn contains(&self, hyper: HyperId) -> bool {
        self.entries.get(&hyper).is_some_and(|s| !s.is_empty())
    }

    /// Hyperparameters with at least one slot.
    pub fn hypers(&self) -> Vec<HyperId> {
        self.entries
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(&h, _)| h)
            .collect()
    }

    /// Zero every slot, keeping the layout.
    pub fn reset(&mut self) {
        for slots in self.entries.values_mut() {
            for slot in slots {
                for v in slot.iter_mut() {
                    *v = F::zero();
                }
            }
        }
    }

    /// Drop every slot.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// One gradient per listed hyperparameter, paired with its handle.
    ///
    /// Contributions are combined with `aggregation` (a single contribution
    /// is used as-is), then passed through `post_process` if given.
    pub fn retrieve(
        &self,
        hypers: &Hyperparameters<F>,
        hyper_list: &[HyperId],
        aggregation: &Aggregation<F>,
        post_process: Option<&dyn Fn(Vec<F>) -> Vec<F>>,
    ) -> Result<Vec<(Vec<F>, HyperId)>> {
        hyper_list
            .iter()
            .map(|&h| {
                let contributions = self.contributions(h);
                if contributions.is_empty() {
                    return Err(Error::MissingHypergradient {
                        name: hypers.name(h),
                    });
                }
                let combined = aggregation.apply(contributions);
                let grad = match post_process {
                    Some(post) => post(combined),
                    None => combined,
                };
                Ok((grad, h))
            })
            .collect()
    }
}
