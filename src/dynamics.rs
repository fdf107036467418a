//! The contracts engines differentiate through.
//!
//! Both traits are generic over the scalar type so that one implementation can
//! be evaluated with plain floats, [`crate::Dual`] and [`crate::Reverse`].
//!
//! ```
//! use hypergrad::{Dynamics, HyperId, HyperValues, OuterObjective, Scalar, State};
//!
//! /// s_{t+1} = a·s_t + h
//! struct Linear { a: f64, h: HyperId }
//!
//! impl Dynamics<f64> for Linear {
//!     fn state_shapes(&self) -> Vec<Vec<usize>> {
//!         vec![vec![]]
//!     }
//!
//!     fn initial_state<T: Scalar<f64>>(&self, _hypers: &HyperValues<T>) -> State<T> {
//!         vec![vec![T::zero()]]
//!     }
//!
//!     fn step<T: Scalar<f64>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> State<T> {
//!         vec![vec![state[0][0] * self.a + hypers.scalar(self.h)]]
//!     }
//! }
//!
//! /// O = s_T
//! struct Last;
//!
//! impl OuterObjective<f64> for Last {
//!     fn eval<T: Scalar<f64>>(&self, state: &[Vec<T>], _hypers: &HyperValues<T>) -> T {
//!         state[0][0]
//!     }
//! }
//! ```

use crate::float::{numel, Float};
use crate::hyper::HyperValues;
use crate::scalar::Scalar;

/// Values of every state component, flat per component.
pub type State<T> = Vec<Vec<T>>;

/// Inner optimization dynamics `state × hyperparameters → next_state`.
///
/// `B` is the type of external per-step input (a minibatch, say) delivered
/// through [`Dynamics::feed`] before the engine evaluates the dynamics. The
/// batch for the initial state arrives through [`Dynamics::feed_init`].
pub trait Dynamics<F: Float, B = ()> {
    /// Shapes of the state components, in order. Rank-0 components are `[]`.
    fn state_shapes(&self) -> Vec<Vec<usize>>;

    /// Starting state. When this depends on a hyperparameter it acts as the
    /// initial dynamics and contributes to that hyperparameter's gradient.
    fn initial_state<T: Scalar<F>>(&self, hypers: &HyperValues<T>) -> State<T>;

    /// One application of the inner update rule.
    fn step<T: Scalar<F>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> State<T>;

    /// Receive external input for the next evaluations.
    fn feed(&mut self, batch: &B) {
        let _ = batch;
    }

    /// Receive the batch the next [`Dynamics::initial_state`] is built from.
    /// Defaults to [`Dynamics::feed`].
    fn feed_init(&mut self, batch: &B) {
        self.feed(batch);
    }
}

/// Scalar outer objective over the state of one dynamics instance.
pub trait OuterObjective<F: Float, B = ()> {
    fn eval<T: Scalar<F>>(&self, state: &[Vec<T>], hypers: &HyperValues<T>) -> T;

    /// Receive external input (validation data, say) for the next evaluations.
    fn feed(&mut self, batch: &B) {
        let _ = batch;
    }
}

/// Assert that `state` matches `shapes` component by component.
///
/// Panics with a message naming `what` on mismatch: a dynamics that changes
/// its state layout breaks the contract every engine relies on.
pub(crate) fn check_state<T>(shapes: &[Vec<usize>], state: &[Vec<T>], what: &str) {
    assert_eq!(
        state.len(),
        shapes.len(),
        "{} must return {} state components, got {}",
        what,
        shapes.len(),
        state.len()
    );
    for (i, (shape, component)) in shapes.iter().zip(state.iter()).enumerate() {
        assert_eq!(
            component.len(),
            numel(shape),
            "{}: state component {} must have {} elements (shape {:?}), got {}",
            what,
            i,
            numel(shape),
            shape,
            component.len()
        );
    }
}

/// Zero-filled buffers laid out like `shapes`.
pub(crate) fn zeros_like<F: Float>(shapes: &[Vec<usize>]) -> State<F> {
    shapes.iter().map(|s| vec![F::zero(); numel(s)]).collect()
}
