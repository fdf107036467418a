#![allow(dead_code)]

use hypergrad::{
    Dynamics, HyperGradient, HyperId, HyperValues, Hyperparameters, OuterObjective, RunOptions,
    Scalar, State,
};

// ── Linear recurrence ──────────────────────────────────────────────────────
// s_{t+1} = a·s_t + h, s_0 = 0, O = s_T. dO/dh = Σ_{k<T} a^k.

pub struct Linear {
    pub a: f64,
    pub h: HyperId,
}

impl Dynamics<f64> for Linear {
    fn state_shapes(&self) -> Vec<Vec<usize>> {
        vec![vec![]]
    }

    fn initial_state<T: Scalar<f64>>(&self, _hypers: &HyperValues<T>) -> State<T> {
        vec![vec![T::zero()]]
    }

    fn step<T: Scalar<f64>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> State<T> {
        vec![vec![state[0][0] * self.a + hypers.scalar(self.h)]]
    }
}

pub struct Last;

impl<B> OuterObjective<f64, B> for Last {
    fn eval<T: Scalar<f64>>(&self, state: &[Vec<T>], _hypers: &HyperValues<T>) -> T {
        state[0][0]
    }
}

pub fn geometric_sum(a: f64, terms: usize) -> f64 {
    (0..terms).map(|k| a.powi(k as i32)).sum()
}

// ── Heavy-ball descent on a nonconvex inner loss ───────────────────────────
// Inner gradient:  g_k = c_k (w_k - t_k) + e^{ρ} w_k + 0.1 sin(w_k)
// Step:            v' = μ v + g,  w' = w - η v'
// Start:           w_0 = σ·[1, -0.5], v_0 = 0
// Outer:           ½ Σ (w_k - y_k)² + 0.01 ρ²

#[derive(Clone)]
pub struct HeavyBall {
    pub lr: HyperId,
    pub momentum: HyperId,
    pub log_reg: HyperId,
    pub init_scale: HyperId,
    pub curvature: [f64; 2],
    pub target: [f64; 2],
}

pub const W0: [f64; 2] = [1.0, -0.5];

impl HeavyBall {
    pub fn register(hypers: &mut Hyperparameters<f64>) -> Self {
        HeavyBall {
            lr: hypers.scalar("inner/lr", 0.1).unwrap(),
            momentum: hypers.scalar("inner/momentum", 0.6).unwrap(),
            log_reg: hypers.scalar("outer/log_reg", -1.0).unwrap(),
            init_scale: hypers.scalar("init/scale", 0.8).unwrap(),
            curvature: [2.0, 0.5],
            target: [1.5, -1.0],
        }
    }
}

impl<B> Dynamics<f64, B> for HeavyBall {
    fn state_shapes(&self) -> Vec<Vec<usize>> {
        vec![vec![2], vec![2]]
    }

    fn initial_state<T: Scalar<f64>>(&self, hypers: &HyperValues<T>) -> State<T> {
        let scale = hypers.scalar(self.init_scale);
        vec![
            W0.iter().map(|&w| scale * w).collect(),
            vec![T::zero(); 2],
        ]
    }

    fn step<T: Scalar<f64>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> State<T> {
        let lr = hypers.scalar(self.lr);
        let mu = hypers.scalar(self.momentum);
        let reg = hypers.scalar(self.log_reg).exp();
        let (w, v) = (&state[0], &state[1]);

        let mut w_next = Vec::with_capacity(2);
        let mut v_next = Vec::with_capacity(2);
        for k in 0..2 {
            let g = (w[k] - self.target[k]) * self.curvature[k] + reg * w[k] + w[k].sin() * 0.1;
            let vk = mu * v[k] + g;
            w_next.push(w[k] - lr * vk);
            v_next.push(vk);
        }
        vec![w_next, v_next]
    }
}

pub struct Validation {
    pub log_reg: HyperId,
    pub labels: [f64; 2],
}

impl<B> OuterObjective<f64, B> for Validation {
    fn eval<T: Scalar<f64>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> T {
        let rho = hypers.scalar(self.log_reg);
        let mut loss = rho * rho * 0.01;
        for k in 0..2 {
            let r = state[0][k] - self.labels[k];
            loss = loss + r * r * 0.5;
        }
        loss
    }
}

pub fn validation(bb: &HeavyBall) -> Validation {
    Validation {
        log_reg: bb.log_reg,
        labels: [1.0, -0.8],
    }
}

/// Objective after `steps` inner steps, evaluated with plain floats.
pub fn unrolled<D, O>(dynamics: &D, objective: &O, hypers: &Hyperparameters<f64>, steps: usize) -> f64
where
    D: Dynamics<f64>,
    O: OuterObjective<f64>,
{
    let values = hypers.values();
    let mut state = dynamics.initial_state(&values);
    for _ in 0..steps {
        state = dynamics.step(&state[..], &values);
    }
    objective.eval(&state[..], &values)
}

/// Central finite difference of `f` with respect to element `index` of `id`.
pub fn finite_diff(
    hypers: &Hyperparameters<f64>,
    id: HyperId,
    index: usize,
    f: impl Fn(&Hyperparameters<f64>) -> f64,
) -> f64 {
    let eps = 1e-6;
    let mut plus = hypers.clone();
    plus.value_mut(id).unwrap()[index] += eps;
    let mut minus = hypers.clone();
    minus.value_mut(id).unwrap()[index] -= eps;
    (f(&plus) - f(&minus)) / (2.0 * eps)
}

/// Run `engine` for `steps` steps and return its hypergradients in
/// registration order.
pub fn run_and_collect<E: HyperGradient<f64>>(
    engine: &mut E,
    hypers: &Hyperparameters<f64>,
    list: &[HyperId],
    steps: usize,
) -> Vec<Vec<f64>> {
    engine.run(hypers, RunOptions::new(steps)).unwrap();
    engine
        .hgrads_hvars(hypers, Some(list), None, None)
        .unwrap()
        .into_iter()
        .map(|(g, _)| g)
        .collect()
}
