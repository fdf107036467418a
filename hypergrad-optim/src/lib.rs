//! Outer-loop hyperparameter updates on top of `hypergrad` engines.

pub mod bounds;
pub mod optimizer;
pub mod update;

pub use bounds::Bounds;
pub use optimizer::{HyperOptimizer, HyperStepReport};
pub use update::{norm, Adam, AdamConfig, HyperUpdate, Sgd, SgdConfig};
