use hypergrad::{Dynamics, HyperId, HyperValues, Hyperparameters, OuterObjective, Scalar, State};

// ─── Ridge regression by gradient descent ──────────────────────────────────
// Inner loss:  ½ Σ_k c_k (w_k - t_k)² + ½ e^{ρ} Σ_k w_k²
// Step:        w' = w - η ∇
// Outer:       ½ Σ_k (w_k - y_k)²

#[derive(Clone)]
pub struct Ridge {
    pub lr: HyperId,
    pub log_reg: HyperId,
    pub curvature: Vec<f64>,
    pub target: Vec<f64>,
}

impl Ridge {
    pub fn new(hypers: &mut Hyperparameters<f64>, n: usize) -> Self {
        Ridge {
            lr: hypers.scalar("lr", 0.05).unwrap(),
            log_reg: hypers.scalar("log_reg", -2.0).unwrap(),
            curvature: (0..n).map(|k| 1.0 + (k % 5) as f64).collect(),
            target: (0..n).map(|k| (k as f64 * 0.37).sin()).collect(),
        }
    }
}

impl Dynamics<f64> for Ridge {
    fn state_shapes(&self) -> Vec<Vec<usize>> {
        vec![vec![self.target.len()]]
    }

    fn initial_state<T: Scalar<f64>>(&self, _hypers: &HyperValues<T>) -> State<T> {
        vec![vec![T::zero(); self.target.len()]]
    }

    fn step<T: Scalar<f64>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> State<T> {
        let lr = hypers.scalar(self.lr);
        let reg = hypers.scalar(self.log_reg).exp();
        let w = &state[0];
        vec![(0..w.len())
            .map(|k| {
                let g = (w[k] - self.target[k]) * self.curvature[k] + reg * w[k];
                w[k] - lr * g
            })
            .collect()]
    }
}

#[derive(Clone)]
pub struct Validation {
    pub labels: Vec<f64>,
}

impl Validation {
    pub fn new(n: usize) -> Self {
        Validation {
            labels: (0..n).map(|k| (k as f64 * 0.37).cos() * 0.5).collect(),
        }
    }
}

impl OuterObjective<f64> for Validation {
    fn eval<T: Scalar<f64>>(&self, state: &[Vec<T>], _hypers: &HyperValues<T>) -> T {
        state[0]
            .iter()
            .zip(self.labels.iter())
            .fold(T::zero(), |acc, (&w, &y)| {
                let r = w - y;
                acc + r * r * 0.5
            })
    }
}
