//! Run configuration and the interface shared by both engines.
//!
//! A run is described by [`RunOptions`]: how many inner steps to take
//! ([`StepSource`]), which external input each phase receives ([`Feed`]),
//! whether to continue from the previous run (online mode), and optional
//! callbacks observing every forward and backward step.

use std::borrow::Cow;
use std::cell::Ref;
use std::fmt;

use crate::accumulator::{Aggregation, HypergradientAccumulator};
use crate::dynamics::{Dynamics, OuterObjective, State};
use crate::error::{Error, Result};
use crate::float::Float;
use crate::hyper::{HyperId, Hyperparameters};
use crate::problem::Structure;
use crate::scalar::Real;

/// What `compute_gradients` does with a hyperparameter that has no gradient
/// path through the dynamics, the initial state or the objective.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DetachedPolicy {
    /// Fail with [`Error::Detached`].
    Error,
    /// Log a warning and leave it out of the registration.
    Prune,
}

/// Number of inner steps of a run.
pub enum StepSource<'a, F> {
    /// Steps `0..n`.
    Steps(usize),
    /// Whatever indices the iterator yields, in order.
    Iter(Box<dyn Iterator<Item = usize> + 'a>),
    /// Steps `0..max_steps`, stopping early as soon as `stop(t, states)` holds
    /// before step `t`.
    Until {
        max_steps: usize,
        stop: Box<dyn FnMut(usize, &[State<F>]) -> bool + 'a>,
    },
}

impl<'a, F> StepSource<'a, F> {
    pub fn iter<I>(indices: I) -> Self
    where
        I: IntoIterator<Item = usize>,
        I::IntoIter: 'a,
    {
        StepSource::Iter(Box::new(indices.into_iter()))
    }

    pub fn until(max_steps: usize, stop: impl FnMut(usize, &[State<F>]) -> bool + 'a) -> Self {
        StepSource::Until {
            max_steps,
            stop: Box::new(stop),
        }
    }
}

impl<F> From<usize> for StepSource<'_, F> {
    fn from(n: usize) -> Self {
        StepSource::Steps(n)
    }
}

impl<F> fmt::Debug for StepSource<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepSource::Steps(n) => write!(f, "Steps({})", n),
            StepSource::Iter(_) => write!(f, "Iter(..)"),
            StepSource::Until { max_steps, .. } => write!(f, "Until {{ max_steps: {} }}", max_steps),
        }
    }
}

/// External input for one phase of a run.
pub enum Feed<'a, B> {
    /// The same batch at every index.
    Fixed(B),
    /// A batch computed from the index.
    PerStep(Box<dyn Fn(usize) -> B + 'a>),
}

impl<'a, B: Clone> Feed<'a, B> {
    pub fn per_step(f: impl Fn(usize) -> B + 'a) -> Self {
        Feed::PerStep(Box::new(f))
    }

    /// Batch for `index`.
    pub fn at(&self, index: usize) -> Cow<'_, B> {
        match self {
            Feed::Fixed(batch) => Cow::Borrowed(batch),
            Feed::PerStep(f) => Cow::Owned(f(index)),
        }
    }
}

impl<B: fmt::Debug> fmt::Debug for Feed<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feed::Fixed(batch) => f.debug_tuple("Fixed").field(batch).finish(),
            Feed::PerStep(_) => write!(f, "PerStep(..)"),
        }
    }
}

/// Which pass a [`StepView`] was taken in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Backward,
}

/// What a callback sees after one step.
pub struct StepView<'v, F> {
    /// Inner step index (`None` for the initial state).
    pub step: Option<usize>,
    pub phase: Phase,
    /// One state per registration. In the backward pass these are the replayed
    /// pre-step states.
    pub states: &'v [State<F>],
    /// Forward mode only: the sensitivities `∂s_i/∂h` after the step, indexed
    /// `[registration][hyperparameter]` in the order of
    /// `registered_hypers(registration)`. Empty in reverse mode.
    pub sensitivities: &'v [Vec<State<F>>],
    pub accumulator: &'v HypergradientAccumulator<F>,
}

/// Callback invoked with a [`StepView`].
pub type Callback<'a, F> = Box<dyn FnMut(&StepView<'_, F>) + 'a>;

/// Everything a single `run` needs besides the hyperparameters.
pub struct RunOptions<'a, F, B = ()> {
    pub steps: StepSource<'a, F>,
    /// Fed to the dynamics before each inner step, with the step index.
    pub inner_feed: Option<Feed<'a, B>>,
    /// Fed to the objectives, with the step counter.
    pub outer_feed: Option<Feed<'a, B>>,
    /// Fed to the dynamics before the initial state is built, with the step
    /// counter.
    pub init_feed: Option<Feed<'a, B>>,
    /// Outer global step; `None` counts as `0`.
    pub step_counter: Option<usize>,
    /// Continue from the previous run instead of resetting.
    pub online: bool,
    /// Reverse mode only: replay at most this many steps.
    pub truncate: Option<usize>,
    pub on_forward: Option<Callback<'a, F>>,
    pub on_backward: Option<Callback<'a, F>>,
}

impl<'a, F, B> RunOptions<'a, F, B> {
    pub fn new(steps: impl Into<StepSource<'a, F>>) -> Self {
        RunOptions {
            steps: steps.into(),
            inner_feed: None,
            outer_feed: None,
            init_feed: None,
            step_counter: None,
            online: false,
            truncate: None,
            on_forward: None,
            on_backward: None,
        }
    }

    pub fn inner_feed(mut self, feed: Feed<'a, B>) -> Self {
        self.inner_feed = Some(feed);
        self
    }

    pub fn outer_feed(mut self, feed: Feed<'a, B>) -> Self {
        self.outer_feed = Some(feed);
        self
    }

    pub fn init_feed(mut self, feed: Feed<'a, B>) -> Self {
        self.init_feed = Some(feed);
        self
    }

    pub fn step_counter(mut self, counter: usize) -> Self {
        self.step_counter = Some(counter);
        self
    }

    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn truncate(mut self, steps: usize) -> Self {
        self.truncate = Some(steps);
        self
    }

    pub fn on_forward(mut self, f: impl FnMut(&StepView<'_, F>) + 'a) -> Self {
        self.on_forward = Some(Box::new(f));
        self
    }

    pub fn on_backward(mut self, f: impl FnMut(&StepView<'_, F>) + 'a) -> Self {
        self.on_backward = Some(Box::new(f));
        self
    }

    /// Index handed to the init and outer feeds.
    pub(crate) fn counter(&self) -> usize {
        self.step_counter.unwrap_or(0)
    }
}

/// Summary of a completed run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunReport {
    pub forward_steps: usize,
    pub backward_steps: usize,
    /// Snapshots held after the run (always `0` in forward mode).
    pub history_len: usize,
}

/// Interface shared by the reverse and forward engines.
pub trait HyperGradient<F: Real, B: Clone = ()> {
    /// Short engine name.
    fn name(&self) -> &'static str;

    /// Whether only rank-0 hyperparameters can be differentiated.
    fn need_scalar_hyperparameters(&self) -> bool;

    /// Register one dynamics/objective pair and the hyperparameters to
    /// differentiate (`None`: every hyperparameter in `hypers`).
    ///
    /// Returns the hyperparameters actually differentiated, which can be
    /// fewer than requested when detached ones are pruned.
    fn compute_gradients<D, O>(
        &mut self,
        hypers: &Hyperparameters<F>,
        objective: O,
        dynamics: D,
        hyper_list: Option<&[HyperId]>,
    ) -> Result<Vec<HyperId>>
    where
        D: Dynamics<F, B> + 'static,
        O: OuterObjective<F, B> + 'static;

    /// Run the inner dynamics and compute hypergradients into the
    /// accumulator.
    fn run(&mut self, hypers: &Hyperparameters<F>, options: RunOptions<'_, F, B>)
        -> Result<RunReport>;

    /// Borrow the accumulator this engine writes into. Panics if the shared
    /// accumulator is mutably borrowed elsewhere.
    fn accumulator(&self) -> Ref<'_, HypergradientAccumulator<F>>;

    /// Hypergradients paired with their hyperparameters (`None`: every
    /// hyperparameter with a contribution).
    fn hgrads_hvars(
        &self,
        hypers: &Hyperparameters<F>,
        hyper_list: Option<&[HyperId]>,
        aggregation: Option<Aggregation<F>>,
        post_process: Option<&dyn Fn(Vec<F>) -> Vec<F>>,
    ) -> Result<Vec<(Vec<F>, HyperId)>> {
        let acc = self.accumulator();
        let list = match hyper_list {
            Some(list) => list.to_vec(),
            None => acc.hypers(),
        };
        acc.retrieve(hypers, &list, &aggregation.unwrap_or_default(), post_process)
    }
}

/// Validate `list` against `hypers` and drop repeats (`None`: every
/// hyperparameter).
pub(crate) fn resolve_hypers<F: Float>(
    hypers: &Hyperparameters<F>,
    list: Option<&[HyperId]>,
) -> Result<Vec<HyperId>> {
    let Some(list) = list else {
        return Ok(hypers.ids());
    };
    let mut out = Vec::with_capacity(list.len());
    for &h in list {
        hypers.get(h)?;
        if !out.contains(&h) {
            out.push(h);
        }
    }
    Ok(out)
}

/// Positions in `list` that stay registered under `policy`.
pub(crate) fn attached_positions<F: Float>(
    engine: &str,
    hypers: &Hyperparameters<F>,
    list: &[HyperId],
    structure: &Structure,
    policy: DetachedPolicy,
) -> Result<Vec<usize>> {
    let mut keep = Vec::with_capacity(list.len());
    for (j, &h) in list.iter().enumerate() {
        if structure.attached(j) {
            keep.push(j);
            continue;
        }
        match policy {
            DetachedPolicy::Error => {
                return Err(Error::Detached {
                    name: hypers.name(h),
                })
            }
            DetachedPolicy::Prune => tracing::warn!(
                engine,
                hyper = %hypers.name(h),
                "hyperparameter is detached from this dynamics, pruning it"
            ),
        }
    }
    Ok(keep)
}

/// The forward half of a run, common to both engines.
pub(crate) trait ForwardPass<F: Float, B> {
    fn forward_step(&mut self, hypers: &Hyperparameters<F>, t: usize, batch: Option<&B>);

    fn view_states(&self) -> &[State<F>];

    fn view_sensitivities(&self) -> &[Vec<State<F>>] {
        &[]
    }

    fn view_accumulator(&self) -> Ref<'_, HypergradientAccumulator<F>>;
}

/// Drive `engine` through `steps`, feeding and reporting each one. Returns the
/// number of steps taken.
pub(crate) fn forward_loop<'a, F, B, E>(
    engine: &mut E,
    hypers: &Hyperparameters<F>,
    steps: StepSource<'a, F>,
    feed: Option<&Feed<'a, B>>,
    on_forward: &mut Option<Callback<'a, F>>,
) -> usize
where
    F: Float,
    B: Clone,
    E: ForwardPass<F, B>,
{
    let mut taken = 0;
    let mut advance = |engine: &mut E, t: usize| {
        let batch = feed.map(|f| f.at(t));
        engine.forward_step(hypers, t, batch.as_deref());
        tracing::trace!(step = t, "forward step");
        if let Some(cb) = on_forward.as_mut() {
            let accumulator = engine.view_accumulator();
            cb(&StepView {
                step: Some(t),
                phase: Phase::Forward,
                states: engine.view_states(),
                sensitivities: engine.view_sensitivities(),
                accumulator: &accumulator,
            });
        }
        taken += 1;
    };

    match steps {
        StepSource::Steps(n) => {
            for t in 0..n {
                advance(&mut *engine, t);
            }
        }
        StepSource::Iter(indices) => {
            for t in indices {
                advance(&mut *engine, t);
            }
        }
        StepSource::Until {
            max_steps,
            mut stop,
        } => {
            for t in 0..max_steps {
                if stop(t, engine.view_states()) {
                    tracing::debug!(step = t, "stop condition met");
                    break;
                }
                advance(&mut *engine, t);
            }
        }
    }
    taken
}
