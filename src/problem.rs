//! One registration: a dynamics instance paired with its outer objective.
//!
//! [`Unrolled`] erases the concrete dynamics/objective types so an engine can
//! keep an insertion-ordered list of registrations. Each method instantiates
//! the user's generic code with the scalar type the question needs.

use num_traits::{One, Zero};

use crate::dual::Dual;
use crate::dynamics::{check_state, Dynamics, OuterObjective, State};
use crate::float::numel;
use crate::hyper::{HyperId, HyperValues, Hyperparameters};
use crate::reverse::Reverse;
use crate::scalar::Real;
use crate::trace::{dual_constants, reverse_constants, tangents, ReverseTrace};

/// Derivatives split by input group; `None` marks "no dependency".
#[derive(Clone, Debug)]
pub(crate) struct Pullback<F> {
    pub state: Vec<Option<Vec<F>>>,
    pub hypers: Vec<Option<Vec<F>>>,
}

/// Inputs read by each output component of one step, at one pre-step state.
/// Dynamics can branch on values, so this holds for that state only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct StepDependencies {
    /// `[component]`: reads any state component.
    pub state: Vec<bool>,
    /// `[hyper][component]`
    pub hypers: Vec<Vec<bool>>,
}

impl StepDependencies {
    /// Whether output component `i` reads the state or hyperparameter `j`.
    pub fn touches(&self, j: usize, i: usize) -> bool {
        self.state[i] || self.hypers[j][i]
    }
}

/// Structural dependencies of one registration at its initial state, for a
/// fixed hyperparameter list. Indexing: `[component]` or `[hyper][component]`.
#[derive(Clone, Debug)]
pub(crate) struct Structure {
    pub step: StepDependencies,
    pub initial_hyper: Vec<bool>,
    pub objective_hyper: Vec<bool>,
}

impl Structure {
    /// Whether hyperparameter `j` has any gradient path.
    pub fn attached(&self, j: usize) -> bool {
        self.step.hypers[j].iter().any(|&d| d) || self.initial_hyper[j] || self.objective_hyper[j]
    }

    /// Keep only the hyperparameters at positions `keep`.
    pub fn retain(&mut self, keep: &[usize]) {
        self.step.hypers = keep.iter().map(|&j| self.step.hypers[j].clone()).collect();
        self.initial_hyper = keep.iter().map(|&j| self.initial_hyper[j]).collect();
        self.objective_hyper = keep.iter().map(|&j| self.objective_hyper[j]).collect();
    }
}

/// Replace absent groups by zeros of the matching component shape.
pub(crate) fn absent_as_zero<F: Real>(groups: Vec<Option<Vec<F>>>, shapes: &[Vec<usize>]) -> State<F> {
    groups
        .into_iter()
        .zip(shapes.iter())
        .map(|(g, shape)| g.unwrap_or_else(|| vec![<F as Zero>::zero(); numel(shape)]))
        .collect()
}

pub(crate) trait Unrolled<F: Real, B> {
    fn shapes(&self) -> &[Vec<usize>];

    fn feed_dynamics(&mut self, batch: &B);

    fn feed_initial(&mut self, batch: &B);

    fn feed_objective(&mut self, batch: &B);

    fn initial_state(&self, hypers: &Hyperparameters<F>) -> State<F>;

    fn advance(&self, state: &[Vec<F>], hypers: &Hyperparameters<F>) -> State<F>;

    fn objective_value(&self, state: &[Vec<F>], hypers: &Hyperparameters<F>) -> F;

    fn analyze(&self, state: &[Vec<F>], hypers: &Hyperparameters<F>, wrt: &[HyperId])
        -> Structure;

    fn step_dependencies(
        &self,
        state: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
    ) -> StepDependencies;

    /// `∂O/∂s` and the direct term `∂O/∂h`.
    fn objective_pullback(
        &self,
        state: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
    ) -> Pullback<F>;

    /// `∂L/∂s` and `∂L/∂h` for `L = Σ_i alpha_i · step_i(s, h)`.
    fn step_pullback(
        &self,
        state: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
        alpha: &[Vec<F>],
    ) -> Pullback<F>;

    /// `∂L0/∂h` for `L0 = Σ_i alpha_i · initial_state_i(h)`.
    fn initial_pullback(
        &self,
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
        alpha: &[Vec<F>],
    ) -> Vec<Option<Vec<F>>>;

    /// `A·z + B` for a unit tangent on the scalar hyperparameter `wrt`.
    fn step_tangent(
        &self,
        state: &[Vec<F>],
        z: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: HyperId,
    ) -> State<F>;

    /// `∂ initial_state / ∂h` for the scalar hyperparameter `wrt`.
    fn initial_tangent(&self, hypers: &Hyperparameters<F>, wrt: HyperId) -> State<F>;

    /// `Σ_i ∂O/∂s_i · z_i + ∂O/∂h`.
    fn objective_tangent(
        &self,
        state: &[Vec<F>],
        z: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: HyperId,
    ) -> F;
}

pub(crate) struct Problem<D, O> {
    dynamics: D,
    objective: O,
    shapes: Vec<Vec<usize>>,
}

impl<D, O> Problem<D, O> {
    pub fn new<F: Real, B>(dynamics: D, objective: O) -> Self
    where
        D: Dynamics<F, B>,
        O: OuterObjective<F, B>,
    {
        let shapes = dynamics.state_shapes();
        Problem {
            dynamics,
            objective,
            shapes,
        }
    }
}

/// Hyperparameters in `wrt` become input groups (in `wrt` order); the rest are
/// constants.
fn lift_reverse<F: Real>(
    trace: &mut ReverseTrace<F>,
    hypers: &Hyperparameters<F>,
    wrt: &[HyperId],
) -> HyperValues<Reverse<F>> {
    let mut traced: Vec<Option<Vec<Reverse<F>>>> = (0..hypers.len()).map(|_| None).collect();
    for &h in wrt {
        traced[h.index()] = Some(trace.variables(hypers.raw(h)));
    }
    hypers.lift(|id, v| {
        traced[id.index()]
            .take()
            .unwrap_or_else(|| reverse_constants(v))
    })
}

fn lift_dual<F: Real>(hypers: &Hyperparameters<F>, wrt: HyperId) -> HyperValues<Dual<F>> {
    hypers.lift(|id, v| {
        if id == wrt {
            v.iter().map(|&x| Dual::variable(x)).collect()
        } else {
            dual_constants(v)
        }
    })
}

fn tangent_state<F: Real>(state: &[Vec<F>], z: &[Vec<F>]) -> State<Dual<F>> {
    state
        .iter()
        .zip(z.iter())
        .map(|(s, dz)| tangents(s, dz))
        .collect()
}

fn eps_of<F: Real>(state: State<Dual<F>>) -> State<F> {
    state
        .into_iter()
        .map(|c| c.into_iter().map(|d| d.eps).collect())
        .collect()
}

impl<F, B, D, O> Unrolled<F, B> for Problem<D, O>
where
    F: Real,
    D: Dynamics<F, B>,
    O: OuterObjective<F, B>,
{
    fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    fn feed_dynamics(&mut self, batch: &B) {
        self.dynamics.feed(batch);
    }

    fn feed_initial(&mut self, batch: &B) {
        self.dynamics.feed_init(batch);
    }

    fn feed_objective(&mut self, batch: &B) {
        self.objective.feed(batch);
    }

    fn initial_state(&self, hypers: &Hyperparameters<F>) -> State<F> {
        let init = self.dynamics.initial_state(&hypers.values());
        check_state(&self.shapes, &init, "Dynamics::initial_state");
        init
    }

    fn advance(&self, state: &[Vec<F>], hypers: &Hyperparameters<F>) -> State<F> {
        let next = self.dynamics.step(state, &hypers.values());
        check_state(&self.shapes, &next, "Dynamics::step");
        next
    }

    fn objective_value(&self, state: &[Vec<F>], hypers: &Hyperparameters<F>) -> F {
        self.objective.eval(state, &hypers.values())
    }

    fn analyze(
        &self,
        state: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
    ) -> Structure {
        let step = self.step_dependencies(state, hypers, wrt);

        let mut trace = ReverseTrace::new();
        let s: State<Reverse<F>> = state.iter().map(|c| trace.variables(c)).collect();
        let hv = lift_reverse(&mut trace, hypers, wrt);
        let obj = trace.record(|| self.objective.eval(&s[..], &hv));
        let objective_hyper = trace.dependencies(&[obj])[state.len()..].to_vec();

        let mut init_trace = ReverseTrace::new();
        let hv0 = lift_reverse(&mut init_trace, hypers, wrt);
        let init = init_trace.record(|| self.dynamics.initial_state(&hv0));
        check_state(&self.shapes, &init, "Dynamics::initial_state");
        let init_flat: Vec<Reverse<F>> = init.concat();
        let initial_hyper = init_trace.dependencies(&init_flat);

        Structure {
            step,
            initial_hyper,
            objective_hyper,
        }
    }

    fn step_dependencies(
        &self,
        state: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
    ) -> StepDependencies {
        let n = state.len();

        let mut trace = ReverseTrace::new();
        let s: State<Reverse<F>> = state.iter().map(|c| trace.variables(c)).collect();
        let hv = lift_reverse(&mut trace, hypers, wrt);
        let next = trace.record(|| self.dynamics.step(&s[..], &hv));
        check_state(&self.shapes, &next, "Dynamics::step");

        let mut reads_state = Vec::with_capacity(n);
        let mut reads_hyper = vec![vec![false; n]; wrt.len()];
        for (i, component) in next.iter().enumerate() {
            let deps = trace.dependencies(component);
            reads_state.push(deps[..n].iter().any(|&d| d));
            for (j, row) in reads_hyper.iter_mut().enumerate() {
                row[i] = deps[n + j];
            }
        }
        StepDependencies {
            state: reads_state,
            hypers: reads_hyper,
        }
    }

    fn objective_pullback(
        &self,
        state: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
    ) -> Pullback<F> {
        let mut trace = ReverseTrace::new();
        let s: State<Reverse<F>> = state.iter().map(|c| trace.variables(c)).collect();
        let hv = lift_reverse(&mut trace, hypers, wrt);
        let obj = trace.record(|| self.objective.eval(&s[..], &hv));

        let mut groups = trace.pullback(&[obj], &[<F as One>::one()]);
        let hyper_groups = groups.split_off(state.len());
        Pullback {
            state: groups,
            hypers: hyper_groups,
        }
    }

    fn step_pullback(
        &self,
        state: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
        alpha: &[Vec<F>],
    ) -> Pullback<F> {
        let mut trace = ReverseTrace::new();
        let s: State<Reverse<F>> = state.iter().map(|c| trace.variables(c)).collect();
        let hv = lift_reverse(&mut trace, hypers, wrt);
        let next = trace.record(|| self.dynamics.step(&s[..], &hv));
        check_state(&self.shapes, &next, "Dynamics::step");

        let mut groups = trace.pullback(&next.concat(), &alpha.concat());
        let hyper_groups = groups.split_off(state.len());
        Pullback {
            state: groups,
            hypers: hyper_groups,
        }
    }

    fn initial_pullback(
        &self,
        hypers: &Hyperparameters<F>,
        wrt: &[HyperId],
        alpha: &[Vec<F>],
    ) -> Vec<Option<Vec<F>>> {
        let mut trace = ReverseTrace::new();
        let hv = lift_reverse(&mut trace, hypers, wrt);
        let init = trace.record(|| self.dynamics.initial_state(&hv));
        check_state(&self.shapes, &init, "Dynamics::initial_state");
        trace.pullback(&init.concat(), &alpha.concat())
    }

    fn step_tangent(
        &self,
        state: &[Vec<F>],
        z: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: HyperId,
    ) -> State<F> {
        let s = tangent_state(state, z);
        let next = self.dynamics.step(&s[..], &lift_dual(hypers, wrt));
        check_state(&self.shapes, &next, "Dynamics::step");
        eps_of(next)
    }

    fn initial_tangent(&self, hypers: &Hyperparameters<F>, wrt: HyperId) -> State<F> {
        let init = self.dynamics.initial_state(&lift_dual(hypers, wrt));
        check_state(&self.shapes, &init, "Dynamics::initial_state");
        eps_of(init)
    }

    fn objective_tangent(
        &self,
        state: &[Vec<F>],
        z: &[Vec<F>],
        hypers: &Hyperparameters<F>,
        wrt: HyperId,
    ) -> F {
        let s = tangent_state(state, z);
        self.objective.eval(&s[..], &lift_dual(hypers, wrt)).eps
    }
}
