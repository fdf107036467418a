//! Hypergradients of an outer objective through an unrolled inner
//! optimization.
//!
//! Implement [`Dynamics`] (the inner update rule) and [`OuterObjective`]
//! generically over [`Scalar`], register them with an engine through
//! [`HyperGradient::compute_gradients`], call [`HyperGradient::run`], and
//! read the gradients back with [`HyperGradient::hgrads_hvars`].
//!
//! - [`AdjointEngine`]: reverse mode, any hyperparameter shape, memory linear
//!   in the number of steps.
//! - [`SensitivityEngine`]: forward mode, scalar hyperparameters, constant
//!   memory, one extra pass per hyperparameter.

pub mod accumulator;
pub mod adjoint;
pub mod driver;
pub mod dual;
pub mod dynamics;
pub mod error;
pub mod float;
pub mod history;
pub mod hyper;
mod problem;
pub mod reverse;
pub mod scalar;
pub mod sensitivity;
pub mod tape;
pub mod trace;
mod traits;

pub use accumulator::{
    clip_by_norm, clip_by_value, Aggregation, HypergradientAccumulator, SharedAccumulator, SlotId,
};
pub use adjoint::{AdjointConfig, AdjointEngine};
pub use driver::{
    Callback, DetachedPolicy, Feed, HyperGradient, Phase, RunOptions, RunReport, StepSource,
    StepView,
};
pub use dual::Dual;
pub use dynamics::{Dynamics, OuterObjective, State};
pub use error::{Error, Result};
pub use float::Float;
pub use history::{History, Snapshot};
pub use hyper::{HyperId, HyperValues, Hyperparameter, Hyperparameters};
pub use reverse::Reverse;
pub use scalar::{Real, Scalar};
pub use sensitivity::{Accumulation, SensitivityConfig, SensitivityEngine};
pub use trace::ReverseTrace;

/// Type alias for forward-mode dual numbers over `f64`.
pub type Dual64 = Dual<f64>;
/// Type alias for forward-mode dual numbers over `f32`.
pub type Dual32 = Dual<f32>;
/// Type alias for reverse-mode variables over `f64`.
pub type Reverse64 = Reverse<f64>;
/// Type alias for reverse-mode variables over `f32`.
pub type Reverse32 = Reverse<f32>;
