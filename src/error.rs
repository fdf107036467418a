use thiserror::Error;

use crate::hyper::HyperId;

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors surfaced by `compute_gradients`, `run` and
/// `hgrads_hvars`.
///
/// Violations of the `Dynamics` contract itself (a step returning the wrong
/// number of components or elements) are programming errors and panic instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No gradient path from the dynamics, the initial dynamics or the outer
    /// objective to this hyperparameter.
    #[error("hyperparameter `{name}` is detached from this optimization dynamics")]
    Detached { name: String },

    /// Forward mode only handles rank-0 hyperparameters.
    #[error(
        "only scalar hyperparameters are accepted in forward mode: `{name}` has rank {rank}"
    )]
    NonScalarHyperparameter { name: String, rank: usize },

    /// `hgrads_hvars` was asked for a hyperparameter that no engine registered.
    #[error("no hypergradient registered for hyperparameter `{name}`")]
    MissingHypergradient { name: String },

    #[error("unknown hyperparameter {0}")]
    UnknownHyperparameter(HyperId),

    #[error("hyperparameter `{0}` is already defined")]
    DuplicateHyperparameter(String),

    #[error("shape mismatch for `{name}`: expected {expected} values, got {got}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("no dynamics registered: call compute_gradients before run")]
    NothingRegistered,
}
