use std::collections::BTreeMap;

use hypergrad::HyperId;
use num_traits::Float;

/// An outer-loop update rule applied to one hyperparameter at a time.
///
/// Rules with internal state (momentum, moments) key it by [`HyperId`].
pub trait HyperUpdate<F: Float> {
    /// Update `value` in place given its hypergradient `grad`.
    fn update(&mut self, id: HyperId, value: &mut [F], grad: &[F]);

    /// Forget accumulated state.
    fn reset(&mut self);
}

/// Compute the L2 norm of a vector.
pub fn norm<F: Float>(v: &[F]) -> F {
    let mut s = F::zero();
    for &x in v {
        s = s + x * x;
    }
    s.sqrt()
}

/// Configuration for [`Sgd`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SgdConfig<F> {
    /// Step size (default: 0.01).
    pub lr: F,
    /// Heavy-ball momentum, `0` for plain gradient descent (default: 0).
    pub momentum: F,
}

impl Default for SgdConfig<f64> {
    fn default() -> Self {
        SgdConfig {
            lr: 0.01,
            momentum: 0.0,
        }
    }
}

impl Default for SgdConfig<f32> {
    fn default() -> Self {
        SgdConfig {
            lr: 0.01,
            momentum: 0.0,
        }
    }
}

/// Gradient descent with optional momentum:
/// `v <- momentum·v + g`, `h <- h - lr·v`.
#[derive(Debug, Clone)]
pub struct Sgd<F> {
    pub config: SgdConfig<F>,
    velocity: BTreeMap<HyperId, Vec<F>>,
}

impl<F: Float> Sgd<F> {
    pub fn new(config: SgdConfig<F>) -> Self {
        Sgd {
            config,
            velocity: BTreeMap::new(),
        }
    }
}

impl<F: Float> HyperUpdate<F> for Sgd<F> {
    fn update(&mut self, id: HyperId, value: &mut [F], grad: &[F]) {
        debug_assert_eq!(value.len(), grad.len());
        let SgdConfig { lr, momentum } = self.config;
        if momentum == F::zero() {
            for (x, &g) in value.iter_mut().zip(grad) {
                *x = *x - lr * g;
            }
            return;
        }
        let v = self
            .velocity
            .entry(id)
            .or_insert_with(|| vec![F::zero(); grad.len()]);
        for ((x, vi), &g) in value.iter_mut().zip(v.iter_mut()).zip(grad) {
            *vi = momentum * *vi + g;
            *x = *x - lr * *vi;
        }
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

/// Configuration for [`Adam`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdamConfig<F> {
    /// Step size (default: 0.001).
    pub lr: F,
    /// First moment decay (default: 0.9).
    pub beta1: F,
    /// Second moment decay (default: 0.999).
    pub beta2: F,
    /// Denominator offset (default: 1e-8).
    pub eps: F,
}

impl Default for AdamConfig<f64> {
    fn default() -> Self {
        AdamConfig {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl Default for AdamConfig<f32> {
    fn default() -> Self {
        AdamConfig {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-6,
        }
    }
}

#[derive(Debug, Clone)]
struct Moments<F> {
    m: Vec<F>,
    v: Vec<F>,
    /// Updates applied so far, for bias correction.
    t: i32,
}

/// Adam with bias-corrected moments, one moment pair per hyperparameter.
#[derive(Debug, Clone)]
pub struct Adam<F> {
    pub config: AdamConfig<F>,
    moments: BTreeMap<HyperId, Moments<F>>,
}

impl<F: Float> Adam<F> {
    pub fn new(config: AdamConfig<F>) -> Self {
        Adam {
            config,
            moments: BTreeMap::new(),
        }
    }

    /// Number of updates applied to `id` so far.
    pub fn steps(&self, id: HyperId) -> usize {
        self.moments.get(&id).map_or(0, |m| m.t as usize)
    }
}

impl<F: Float> HyperUpdate<F> for Adam<F> {
    fn update(&mut self, id: HyperId, value: &mut [F], grad: &[F]) {
        debug_assert_eq!(value.len(), grad.len());
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let one = F::one();
        let state = self.moments.entry(id).or_insert_with(|| Moments {
            m: vec![F::zero(); grad.len()],
            v: vec![F::zero(); grad.len()],
            t: 0,
        });
        state.t += 1;
        let bc1_inv = one / (one - beta1.powi(state.t));
        let bc2_inv = one / (one - beta2.powi(state.t));

        for i in 0..value.len() {
            let g = grad[i];
            state.m[i] = beta1 * state.m[i] + (one - beta1) * g;
            state.v[i] = beta2 * state.v[i] + (one - beta2) * g * g;
            let m_hat = state.m[i] * bc1_inv;
            let v_hat = state.v[i] * bc2_inv;
            value[i] = value[i] - lr * m_hat / (v_hat.sqrt() + eps);
        }
    }

    fn reset(&mut self) {
        self.moments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn momentum_accumulates_velocity() {
        let id = hypergrad::Hyperparameters::<f64>::new()
            .scalar("h", 0.0)
            .unwrap();
        let mut sgd = Sgd::new(SgdConfig {
            lr: 0.1,
            momentum: 0.5,
        });
        let mut x = [1.0];
        sgd.update(id, &mut x, &[1.0]);
        assert!((x[0] - 0.9).abs() < 1e-12);
        sgd.update(id, &mut x, &[1.0]);
        // v = 0.5 * 1 + 1 = 1.5
        assert!((x[0] - 0.75).abs() < 1e-12);
    }
}
