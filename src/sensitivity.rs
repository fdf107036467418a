//! Forward-mode hypergradients.
//!
//! For every scalar hyperparameter `h` the engine carries the sensitivity
//! `z_{i,h} = ∂s_i/∂h` of each state component alongside the state. One step
//! updates all sensitivities with a dual pass through the dynamics at the
//! pre-step state, seeded with `(z, ∂h = 1)`, and then advances the state:
//!
//! ```text
//! z_i <- A_i·z + B_i
//! s   <- step(s, h)
//! ```
//!
//! A component whose output reads neither the state nor `h` keeps its old
//! sensitivity. Which inputs a step reads can change with the state, so that
//! is decided by a dependency trace at every pre-step state.
//!
//! After each step the hypergradient `Σ_i ∂O/∂s_i · z_i + ∂O/∂h` is read off a
//! dual pass through the objective. No history is kept, so memory does not
//! grow with the number of steps, but every hyperparameter costs one extra
//! pass per step and only rank-0 hyperparameters are supported.

use std::cell::{Ref, RefMut};

use crate::accumulator::{HypergradientAccumulator, SharedAccumulator, SlotId};
use crate::driver::{
    attached_positions, forward_loop, resolve_hypers, DetachedPolicy, ForwardPass,
    HyperGradient, RunOptions, RunReport,
};
use crate::dynamics::{zeros_like, Dynamics, OuterObjective, State};
use crate::error::{Error, Result};
use crate::hyper::{HyperId, Hyperparameters};
use crate::problem::{Problem, Structure, Unrolled};
use crate::scalar::Real;

/// How per-step hypergradient evaluations are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Accumulation {
    /// Keep only the most recent evaluation: the gradient of the objective at
    /// the final state.
    #[default]
    Latest,
    /// Add every evaluation: the gradient of `Σ_t O(s_t)`.
    Sum,
}

/// Configuration for [`SensitivityEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensitivityConfig {
    /// Handling of detached hyperparameters (default: `Prune`).
    pub detached: DetachedPolicy,
    /// Combination of per-step evaluations (default: `Latest`).
    pub accumulation: Accumulation,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        SensitivityConfig {
            detached: DetachedPolicy::Prune,
            accumulation: Accumulation::Latest,
        }
    }
}

struct Registration<F: Real, B> {
    problem: Box<dyn Unrolled<F, B>>,
    hypers: Vec<HyperId>,
    slots: Vec<SlotId>,
    structure: Structure,
}

/// Forward-mode engine.
pub struct SensitivityEngine<F: Real, B = ()> {
    config: SensitivityConfig,
    registrations: Vec<Registration<F, B>>,
    states: Vec<State<F>>,
    /// Sensitivity arena: `[registration][hyperparameter]`.
    sensitivities: Vec<Vec<State<F>>>,
    accumulator: SharedAccumulator<F>,
    needs_reset: bool,
}

impl<F: Real, B: Clone> Default for SensitivityEngine<F, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Real, B: Clone> SensitivityEngine<F, B> {
    pub const NAME: &'static str = "ForwardHG";

    pub fn new() -> Self {
        Self::with_config(SensitivityConfig::default())
    }

    pub fn with_config(config: SensitivityConfig) -> Self {
        SensitivityEngine {
            config,
            registrations: Vec::new(),
            states: Vec::new(),
            sensitivities: Vec::new(),
            accumulator: HypergradientAccumulator::shared(),
            needs_reset: true,
        }
    }

    /// Write hypergradients into `accumulator`, possibly shared with other
    /// engines, instead of a fresh one.
    ///
    /// # Panics
    ///
    /// Panics if dynamics are already registered: their slots live in the
    /// current accumulator.
    pub fn with_accumulator(mut self, accumulator: SharedAccumulator<F>) -> Self {
        assert!(
            self.registrations.is_empty(),
            "with_accumulator must be called before registering dynamics"
        );
        self.accumulator = accumulator;
        self
    }

    pub fn config(&self) -> &SensitivityConfig {
        &self.config
    }

    pub fn num_registrations(&self) -> usize {
        self.registrations.len()
    }

    pub fn registered_hypers(&self, reg: usize) -> Option<&[HyperId]> {
        self.registrations.get(reg).map(|r| r.hypers.as_slice())
    }

    /// Sensitivities `∂s_i/∂h` of registration `reg`, one buffer per state
    /// component. `None` if `h` is not differentiated by that registration.
    pub fn sensitivities(&self, reg: usize, h: HyperId) -> Option<&[Vec<F>]> {
        let registration = self.registrations.get(reg)?;
        let j = registration.hypers.iter().position(|&x| x == h)?;
        Some(&self.sensitivities[reg][j])
    }

    pub fn states(&self) -> &[State<F>] {
        &self.states
    }

    /// Mutable access for outer code that adds its own contributions.
    pub fn accumulator_mut(&self) -> RefMut<'_, HypergradientAccumulator<F>> {
        self.accumulator.borrow_mut()
    }

    /// Another handle to the accumulator this engine writes into.
    pub fn shared_accumulator(&self) -> SharedAccumulator<F> {
        self.accumulator.clone()
    }

    /// Rebuild every initial state and its sensitivities, zero this engine's
    /// hypergradient slots, and evaluate the hypergradient at the initial
    /// state.
    pub fn reset(&mut self, hypers: &Hyperparameters<F>, init_batch: Option<&B>) {
        {
            let mut accumulator = self.accumulator.borrow_mut();
            for (r, reg) in self.registrations.iter_mut().enumerate() {
                if let Some(batch) = init_batch {
                    reg.problem.feed_initial(batch);
                }
                self.states[r] = reg.problem.initial_state(hypers);
                self.sensitivities[r] = initial_sensitivities(reg, hypers);
                for &slot in &reg.slots {
                    accumulator.zero(slot);
                }
            }
        }
        self.contribute(hypers);
        self.needs_reset = false;
        tracing::debug!(engine = Self::NAME, "reset");
    }

    /// Evaluate the hypergradient of every registration at the current state.
    fn contribute(&mut self, hypers: &Hyperparameters<F>) {
        let mut accumulator = self.accumulator.borrow_mut();
        for (r, reg) in self.registrations.iter().enumerate() {
            for (j, (&h, &slot)) in reg.hypers.iter().zip(reg.slots.iter()).enumerate() {
                let g = reg
                    .problem
                    .objective_tangent(&self.states[r], &self.sensitivities[r][j], hypers, h);
                match self.config.accumulation {
                    Accumulation::Latest => accumulator.store(slot, &[g]),
                    Accumulation::Sum => accumulator.accumulate(slot, &[g]),
                }
            }
        }
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
}

fn initial_sensitivities<F: Real, B>(
    reg: &Registration<F, B>,
    hypers: &Hyperparameters<F>,
) -> Vec<State<F>> {
    reg.hypers
        .iter()
        .enumerate()
        .map(|(j, &h)| {
            if reg.structure.initial_hyper[j] {
                reg.problem.initial_tangent(hypers, h)
            } else {
                zeros_like(reg.problem.shapes())
            }
        })
        .collect()
}

impl<F: Real, B: Clone> ForwardPass<F, B> for SensitivityEngine<F, B> {
    fn forward_step(&mut self, hypers: &Hyperparameters<F>, _t: usize, batch: Option<&B>) {
        for (r, reg) in self.registrations.iter_mut().enumerate() {
            if let Some(batch) = batch {
                reg.problem.feed_dynamics(batch);
            }
            let state = &self.states[r];
            let deps = reg.problem.step_dependencies(state, hypers, &reg.hypers);
            for (j, &h) in reg.hypers.iter().enumerate() {
                let z = &mut self.sensitivities[r][j];
                let updated = reg.problem.step_tangent(state, z, hypers, h);
                for (i, (zi, new)) in z.iter_mut().zip(updated).enumerate() {
                    if deps.touches(j, i) {
                        *zi = new;
                    }
                }
            }
            let next = reg.problem.advance(state, hypers);
            self.states[r] = next;
        }
        self.contribute(hypers);
    }

    fn view_states(&self) -> &[State<F>] {
        &self.states
    }

    fn view_sensitivities(&self) -> &[Vec<State<F>>] {
        &self.sensitivities
    }

    fn view_accumulator(&self) -> Ref<'_, HypergradientAccumulator<F>> {
        self.accumulator.borrow()
    }
}

impl<F: Real, B: Clone> HyperGradient<F, B> for SensitivityEngine<F, B> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn need_scalar_hyperparameters(&self) -> bool {
        true
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
        for &h in &list {
            let hyper = hypers.get(h)?;
            if hyper.rank() != 0 {
                return Err(Error::NonScalarHyperparameter {
                    name: hyper.name().to_string(),
                    rank: hyper.rank(),
                });
            }
        }

        let problem: Box<dyn Unrolled<F, B>> = Box::new(Problem::new::<F, B>(dynamics, objective));
        let state = problem.initial_state(hypers);
        let mut structure = problem.analyze(&state, hypers, &list);
        let keep = attached_positions(Self::NAME, hypers, &list, &structure, self.config.detached)?;
        structure.retain(&keep);
        let kept: Vec<HyperId> = keep.iter().map(|&j| list[j]).collect();

        let slots = kept
            .iter()
            .map(|&h| self.accumulator.borrow_mut().register(h, 1))
            .collect();
        let reg = Registration {
            problem,
            hypers: kept.clone(),
            slots,
            structure,
        };
        self.sensitivities.push(initial_sensitivities(&reg, hypers));
        self.states.push(state);
        self.registrations.push(reg);
        self.needs_reset = true;

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
            ..
        } = options;
        if truncate.is_some() {
            tracing::debug!(engine = Self::NAME, "truncation applies to reverse mode only, ignored");
        }

        if let Some(feed) = outer_feed.as_ref() {
            let batch = feed.at(counter);
            for reg in self.registrations.iter_mut() {
                reg.problem.feed_objective(&batch);
            }
        }
        if !online || self.needs_reset {
            let init = init_feed.as_ref().map(|f| f.at(counter).into_owned());
            self.reset(hypers, init.as_ref());
        }

        let forward_steps = forward_loop(self, hypers, steps, inner_feed.as_ref(), &mut on_forward);
        tracing::info!(engine = Self::NAME, forward_steps, "run complete");
        Ok(RunReport {
            forward_steps,
            backward_steps: 0,
            history_len: 0,
        })
    }

    fn accumulator(&self) -> Ref<'_, HypergradientAccumulator<F>> {
        self.accumulator.borrow()
    }
}
