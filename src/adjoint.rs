//! Reverse-mode hypergradients.
//!
//! The forward pass stores every state in the [`History`]. The backward pass
//! starts from `alpha = ∂O/∂s` at the final state (the hypergradient slot
//! starts at the direct term `∂O/∂h`) and replays the stored steps in
//! decreasing order, each one a single weighted pullback through the step:
//!
//! ```text
//! L      = Σ_i alpha_i · step_i(s_t, h)
//! slot  += ∂L/∂h
//! alpha  = ∂L/∂s
//! ```
//!
//! When the replay reaches the initial snapshot the initial state's
//! dependence on `h` is added as well. Truncated runs stop earlier and skip
//! that term.

use std::cell::{Ref, RefMut};

use crate::accumulator::{HypergradientAccumulator, SharedAccumulator, SlotId};
use crate::driver::{
    attached_positions, forward_loop, resolve_hypers, Callback, DetachedPolicy, Feed,
    ForwardPass, HyperGradient, Phase, RunOptions, RunReport, StepView,
};
use crate::dynamics::{zeros_like, Dynamics, OuterObjective, State};
use crate::error::{Error, Result};
use crate::history::{History, Snapshot};
use crate::hyper::{HyperId, Hyperparameters};
use crate::problem::{absent_as_zero, Problem, Unrolled};
use crate::scalar::Real;

/// Configuration for [`AdjointEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdjointConfig {
    /// Handling of detached hyperparameters (default: `Error`).
    pub detached: DetachedPolicy,
}

impl Default for AdjointConfig {
    fn default() -> Self {
        AdjointConfig {
            detached: DetachedPolicy::Error,
        }
    }
}

struct Registration<F: Real, B> {
    problem: Box<dyn Unrolled<F, B>>,
    hypers: Vec<HyperId>,
    slots: Vec<SlotId>,
}

/// Reverse-mode engine.
///
/// Handles hyperparameters of any shape. Memory grows with the number of
/// stored steps.
pub struct AdjointEngine<F: Real, B = ()> {
    config: AdjointConfig,
    registrations: Vec<Registration<F, B>>,
    states: Vec<State<F>>,
    /// Adjoint arena, one buffer set per registration.
    alphas: Vec<State<F>>,
    history: History<F>,
    accumulator: SharedAccumulator<F>,
    init_batch: Option<B>,
}

impl<F: Real, B: Clone> Default for AdjointEngine<F, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Real, B: Clone> AdjointEngine<F, B> {
    pub const NAME: &'static str = "ReverseHG";

    pub fn new() -> Self {
        Self::with_config(AdjointConfig::default())
    }

    pub fn with_config(config: AdjointConfig) -> Self {
        AdjointEngine {
            config,
            registrations: Vec::new(),
            states: Vec::new(),
            alphas: Vec::new(),
            history: History::new(),
            accumulator: HypergradientAccumulator::shared(),
            init_batch: None,
        }
    }

    /// Write hypergradients into `accumulator`, possibly shared with other
    /// engines, instead of a fresh one.
    ///
    /// # Panics
    ///
    /// Panics if dynamics are already registered.
    pub fn with_accumulator(mut self, accumulator: SharedAccumulator<F>) -> Self {
        assert!(
            self.registrations.is_empty(),
            "with_accumulator must be called before registering dynamics"
        );
        self.accumulator = accumulator;
        self
    }

    pub fn config(&self) -> &AdjointConfig {
        &self.config
    }

    pub fn num_registrations(&self) -> usize {
        self.registrations.len()
    }

    /// Hyperparameters differentiated by registration `reg`.
    pub fn registered_hypers(&self, reg: usize) -> Option<&[HyperId]> {
        self.registrations.get(reg).map(|r| r.hypers.as_slice())
    }

    /// Adjoint variables of registration `reg`, one buffer per state
    /// component.
    pub fn adjoints(&self, reg: usize) -> Option<&[Vec<F>]> {
        self.alphas.get(reg).map(Vec::as_slice)
    }

    /// Current state of every registration.
    pub fn states(&self) -> &[State<F>] {
        &self.states
    }

    pub fn history(&self) -> &History<F> {
        &self.history
    }

    /// Mutable access for outer code that adds its own contributions.
    pub fn accumulator_mut(&self) -> RefMut<'_, HypergradientAccumulator<F>> {
        self.accumulator.borrow_mut()
    }

    /// Another handle to the accumulator this engine writes into.
    pub fn shared_accumulator(&self) -> SharedAccumulator<F> {
        self.accumulator.clone()
    }

    /// Rebuild every initial state, zero the adjoints and this engine's
    /// hypergradient slots, and empty the history.
    pub fn reset(&mut self, hypers: &Hyperparameters<F>, init_batch: Option<&B>) {
        self.history.clear();
        self.init_batch = init_batch.cloned();
        let mut accumulator = self.accumulator.borrow_mut();
        for (r, reg) in self.registrations.iter_mut().enumerate() {
            if let Some(batch) = init_batch {
                reg.problem.feed_initial(batch);
            }
            self.states[r] = reg.problem.initial_state(hypers);
            self.alphas[r] = zeros_like(reg.problem.shapes());
            for &slot in &reg.slots {
                accumulator.zero(slot);
            }
        }
        tracing::debug!(engine = Self::NAME, "reset");
    }

    fn validate(&self, hypers: &Hyperparameters<F>) -> Result<()> {
        if self.registrations.is_empty() {
            return Err(Error::NothingRegistered);
        }
        for reg in &self.registrations {
            for &h in &reg.hypers {
                hypers.get(h)?;
            }
        }
        Ok(())
    }

    fn backward(
        &mut self,
        hypers: &Hyperparameters<F>,
        inner_feed: Option<&Feed<'_, B>>,
        outer_batch: Option<&B>,
        truncate: Option<usize>,
        on_backward: &mut Option<Callback<'_, F>>,
    ) -> usize {
        let AdjointEngine {
            registrations,
            states,
            alphas,
            history,
            accumulator,
            init_batch,
            ..
        } = self;

        for (r, reg) in registrations.iter_mut().enumerate() {
            if let Some(batch) = outer_batch {
                reg.problem.feed_objective(batch);
            }
            let pb = reg.problem.objective_pullback(&states[r], hypers, &reg.hypers);
            alphas[r] = absent_as_zero(pb.state, reg.problem.shapes());
            for (&slot, direct) in reg.slots.iter().zip(pb.hypers) {
                match direct {
                    Some(g) => accumulator.borrow_mut().store(slot, &g),
                    None => accumulator.borrow_mut().zero(slot),
                }
            }
        }
        tracing::debug!(engine = AdjointEngine::<F, B>::NAME, "backward pass");

        let snapshots = history.snapshots();
        let last = snapshots.len() - 1;
        let first = last - truncate.map_or(last, |k| k.min(last));
        let mut replayed = 0;

        for idx in (first..last).rev() {
            let step = snapshots[idx + 1].step;
            if let (Some(feed), Some(t)) = (inner_feed, step) {
                let batch = feed.at(t);
                for reg in registrations.iter_mut() {
                    reg.problem.feed_dynamics(&batch);
                }
            }

            let pre = &snapshots[idx];
            for (r, reg) in registrations.iter().enumerate() {
                let pb = reg
                    .problem
                    .step_pullback(&pre.states[r], hypers, &reg.hypers, &alphas[r]);
                for (&slot, grad) in reg.slots.iter().zip(pb.hypers) {
                    if let Some(g) = grad {
                        accumulator.borrow_mut().accumulate(slot, &g);
                    }
                }
                alphas[r] = absent_as_zero(pb.state, reg.problem.shapes());
            }
            replayed += 1;
            tracing::trace!(step = ?step, "backward step");

            if let Some(cb) = on_backward.as_mut() {
                cb(&StepView {
                    step,
                    phase: Phase::Backward,
                    states: &pre.states,
                    sensitivities: &[],
                    accumulator: &accumulator.borrow(),
                });
            }
        }

        if first == 0 && snapshots[0].step.is_none() {
            if let Some(batch) = init_batch.as_ref() {
                for reg in registrations.iter_mut() {
                    reg.problem.feed_initial(batch);
                }
            }
            for (r, reg) in registrations.iter().enumerate() {
                let grads = reg.problem.initial_pullback(hypers, &reg.hypers, &alphas[r]);
                for (&slot, grad) in reg.slots.iter().zip(grads) {
                    if let Some(g) = grad {
                        accumulator.borrow_mut().accumulate(slot, &g);
                    }
                }
            }
        } else {
            tracing::debug!(replayed, "truncated replay, initial state term omitted");
        }
        replayed
    }
}

impl<F: Real, B: Clone> ForwardPass<F, B> for AdjointEngine<F, B> {
    fn forward_step(&mut self, hypers: &Hyperparameters<F>, t: usize, batch: Option<&B>) {
        for (r, reg) in self.registrations.iter_mut().enumerate() {
            if let Some(batch) = batch {
                reg.problem.feed_dynamics(batch);
            }
            let next = reg.problem.advance(&self.states[r], hypers);
            self.states[r] = next;
        }
        self.history.push(Snapshot {
            step: Some(t),
            states: self.states.clone(),
        });
    }

    fn view_states(&self) -> &[State<F>] {
        &self.states
    }

    fn view_accumulator(&self) -> Ref<'_, HypergradientAccumulator<F>> {
        self.accumulator.borrow()
    }
}

impl<F: Real, B: Clone> HyperGradient<F, B> for AdjointEngine<F, B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn need_scalar_hyperparameters(&self) -> bool {
        false
    }

    fn compute_gradients<D, O>(
        &mut self,
        hypers: &Hyperparameters<F>,
        objective: O,
        dynamics: D,
        hyper_list: Option<&[HyperId]>,
    ) -> Result<Vec<HyperId>>
    where
        D: Dynamics<F, B> + 'static,
        O: OuterObjective<F, B> + 'static,
    {
        let list = resolve_hypers(hypers, hyper_list)?;
        let problem: Box<dyn Unrolled<F, B>> = Box::new(Problem::new::<F, B>(dynamics, objective));

        let state = problem.initial_state(hypers);
        let structure = problem.analyze(&state, hypers, &list);
        let keep = attached_positions(Self::NAME, hypers, &list, &structure, self.config.detached)?;
        let kept: Vec<HyperId> = keep.iter().map(|&j| list[j]).collect();

        let slots = kept
            .iter()
            .map(|&h| self.accumulator.borrow_mut().register(h, hypers.raw(h).len()))
            .collect();
        self.alphas.push(zeros_like(problem.shapes()));
        self.states.push(state);
        self.registrations.push(Registration {
            problem,
            hypers: kept.clone(),
            slots,
        });
        // Snapshots no longer cover every registration.
        self.history.clear();

        tracing::debug!(
            engine = Self::NAME,
            registration = self.registrations.len() - 1,
            hypers = kept.len(),
            "dynamics registered"
        );
        Ok(kept)
    }

    fn run(
        &mut self,
        hypers: &Hyperparameters<F>,
        options: RunOptions<'_, F, B>,
    ) -> Result<RunReport> {
        self.validate(hypers)?;
        let counter = options.counter();
        let RunOptions {
            steps,
            inner_feed,
            outer_feed,
            init_feed,
            online,
            truncate,
            mut on_forward,
            mut on_backward,
            ..
        } = options;

        if !online || self.history.is_empty() {
            let init = init_feed.as_ref().map(|f| f.at(counter).into_owned());
            self.reset(hypers, init.as_ref());
        }
        if self.history.is_empty() {
            self.history.push(Snapshot {
                step: None,
                states: self.states.clone(),
            });
        }

        let forward_steps = forward_loop(self, hypers, steps, inner_feed.as_ref(), &mut on_forward);
        let outer = outer_feed.as_ref().map(|f| f.at(counter));
        let backward_steps = self.backward(
            hypers,
            inner_feed.as_ref(),
            outer.as_deref(),
            truncate,
            &mut on_backward,
        );

        let report = RunReport {
            forward_steps,
            backward_steps,
            history_len: self.history.len(),
        };
        tracing::info!(
            engine = Self::NAME,
            forward_steps,
            backward_steps,
            history_len = report.history_len,
            "run complete"
        );
        Ok(report)
    }

    fn accumulator(&self) -> Ref<'_, HypergradientAccumulator<F>> {
        self.accumulator.borrow()
    }
}
