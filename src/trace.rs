//! Recording helpers over grouped inputs.
//!
//! The engines differentiate with respect to *groups*: one group per state
//! component and one per hyperparameter. [`ReverseTrace`] registers each group
//! as a contiguous run of tape variables, records a closure, and then answers
//! two questions per group: the weighted pullback (`wᵀ·J` restricted to the
//! group) and whether the group is reachable from the outputs at all. An
//! unreachable group yields `None`, the "no dependency" answer that drives
//! detachment checks.

use std::ops::Range;

use crate::dual::Dual;
use crate::float::Float;
use crate::reverse::Reverse;
use crate::tape::{Tape, TapeGuard, TapeThreadLocal};

/// A tape plus the index ranges of the input groups registered on it.
pub struct ReverseTrace<F: TapeThreadLocal> {
    tape: Tape<F>,
    groups: Vec<Range<usize>>,
}

impl<F: TapeThreadLocal> Default for ReverseTrace<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: TapeThreadLocal> ReverseTrace<F> {
    pub fn new() -> Self {
        ReverseTrace {
            tape: Tape::with_capacity(64),
            groups: Vec::new(),
        }
    }

    /// Register `values` as a new input group and return its variables.
    pub fn variables(&mut self, values: &[F]) -> Vec<Reverse<F>> {
        let start = self.tape.num_variables();
        let vars = values
            .iter()
            .map(|&val| {
                let (idx, v) = self.tape.new_variable(val);
                Reverse::from_tape(v, idx)
            })
            .collect();
        self.groups.push(start..self.tape.num_variables());
        vars
    }

    /// Number of registered groups.
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Run `f` with this trace's tape active.
    pub fn record<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let _guard = TapeGuard::new(&mut self.tape);
        f()
    }

    /// Weighted pullback `Σ_k w_k · ∂out_k/∂group`, per group.
    ///
    /// A group no output depends on is reported as `None`, even when the
    /// numerical pullback would be zero.
    pub fn pullback(&self, outputs: &[Reverse<F>], weights: &[F]) -> Vec<Option<Vec<F>>> {
        assert_eq!(
            outputs.len(),
            weights.len(),
            "output length must match weight vector length"
        );
        let seeds: Vec<(u32, F)> = outputs
            .iter()
            .zip(weights.iter())
            .map(|(r, &w)| (r.index, w))
            .collect();
        let adjoints = self.tape.reverse_seeded(&seeds);
        let reached = self.reached(outputs);

        self.groups
            .iter()
            .map(|range| {
                if reached[range.clone()].iter().any(|&r| r) {
                    Some(adjoints[range.clone()].to_vec())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Per group: whether any of `outputs` depends on it.
    pub fn dependencies(&self, outputs: &[Reverse<F>]) -> Vec<bool> {
        let reached = self.reached(outputs);
        self.groups
            .iter()
            .map(|range| reached[range.clone()].iter().any(|&r| r))
            .collect()
    }

    fn reached(&self, outputs: &[Reverse<F>]) -> Vec<bool> {
        let roots: Vec<u32> = outputs.iter().map(|r| r.index).collect();
        self.tape.reachable(&roots)
    }
}

/// Lift values to reverse constants (no tape entries).
pub fn reverse_constants<F: Float>(values: &[F]) -> Vec<Reverse<F>> {
    values.iter().map(|&v| Reverse::constant(v)).collect()
}

/// Pair values with tangents.
pub fn tangents<F: Float>(values: &[F], dots: &[F]) -> Vec<Dual<F>> {
    assert_eq!(values.len(), dots.len(), "values and tangents must have the same length");
    values
        .iter()
        .zip(dots.iter())
        .map(|(&v, &d)| Dual::new(v, d))
        .collect()
}

/// Lift values to dual constants (zero tangent).
pub fn dual_constants<F: Float>(values: &[F]) -> Vec<Dual<F>> {
    values.iter().map(|&v| Dual::constant(v)).collect()
}
