//! Hyperparameter registry.
//!
//! Hyperparameters are owned by the caller, read by the engines, and mutated
//! only by an outer update rule. Dynamics and objectives hold [`HyperId`]
//! handles and read the (possibly traced) values through [`HyperValues`].

use std::fmt;

use crate::error::{Error, Result};
use crate::float::{numel, Float};

/// Handle to a hyperparameter in a [`Hyperparameters`] registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HyperId(pub(crate) usize);

impl HyperId {
    /// Position in the registry (registration order).
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for HyperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named tensor hyperparameter, stored flat in row-major order.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hyperparameter<F> {
    name: String,
    shape: Vec<usize>,
    value: Vec<F>,
}

impl<F: Float> Hyperparameter<F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Tensor rank (`0` for scalars).
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn value(&self) -> &[F] {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Insertion-ordered registry of hyperparameters.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hyperparameters<F> {
    entries: Vec<Hyperparameter<F>>,
}

impl<F: Float> Hyperparameters<F> {
    pub fn new() -> Self {
        Hyperparameters {
            entries: Vec::new(),
        }
    }

    /// Register a rank-0 hyperparameter.
    pub fn scalar(&mut self, name: impl Into<String>, value: F) -> Result<HyperId> {
        self.tensor(name, Vec::new(), vec![value])
    }

    /// Register a tensor hyperparameter with the given shape.
    pub fn tensor(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        value: Vec<F>,
    ) -> Result<HyperId> {
        let name = name.into();
        if self.find(&name).is_some() {
            return Err(Error::DuplicateHyperparameter(name));
        }
        let expected = numel(&shape);
        if value.len() != expected {
            return Err(Error::ShapeMismatch {
                name,
                expected,
                got: value.len(),
            });
        }
        self.entries.push(Hyperparameter { name, shape, value });
        Ok(HyperId(self.entries.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: HyperId) -> bool {
        id.0 < self.entries.len()
    }

    /// Every registered hyperparameter, in registration order.
    pub fn ids(&self) -> Vec<HyperId> {
        (0..self.entries.len()).map(HyperId).collect()
    }

    /// Hyperparameters whose name lives under `scope/` (or equals `scope`).
    pub fn in_scope(&self, scope: &str) -> Vec<HyperId> {
        let prefix = format!("{}/", scope.trim_end_matches('/'));
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, h)| h.name == scope || h.name.starts_with(&prefix))
            .map(|(i, _)| HyperId(i))
            .collect()
    }

    pub fn find(&self, name: &str) -> Option<HyperId> {
        self.entries.iter().position(|h| h.name == name).map(HyperId)
    }

    pub fn get(&self, id: HyperId) -> Result<&Hyperparameter<F>> {
        self.entries.get(id.0).ok_or(Error::UnknownHyperparameter(id))
    }

    /// Name for messages; unknown handles render as their index.
    pub fn name(&self, id: HyperId) -> String {
        self.entries
            .get(id.0)
            .map_or_else(|| id.to_string(), |h| h.name.clone())
    }

    pub fn value(&self, id: HyperId) -> Result<&[F]> {
        self.get(id).map(|h| h.value.as_slice())
    }

    pub fn value_mut(&mut self, id: HyperId) -> Result<&mut [F]> {
        self.entries
            .get_mut(id.0)
            .map(|h| h.value.as_mut_slice())
            .ok_or(Error::UnknownHyperparameter(id))
    }

    /// Replace a hyperparameter value; the length must match its shape.
    pub fn set(&mut self, id: HyperId, value: &[F]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id.0)
            .ok_or(Error::UnknownHyperparameter(id))?;
        if entry.value.len() != value.len() {
            return Err(Error::ShapeMismatch {
                name: entry.name.clone(),
                expected: entry.value.len(),
                got: value.len(),
            });
        }
        entry.value.copy_from_slice(value);
        Ok(())
    }

    /// Plain-float view, for evaluating a dynamics or objective directly.
    pub fn values(&self) -> HyperValues<F> {
        self.lift(|_, v| v.to_vec())
    }

    /// Value of a handle already validated against this registry.
    #[inline]
    pub(crate) fn raw(&self, id: HyperId) -> &[F] {
        &self.entries[id.0].value
    }

    /// Build a view of every hyperparameter lifted to `T`.
    pub(crate) fn lift<T>(&self, mut lift: impl FnMut(HyperId, &[F]) -> Vec<T>) -> HyperValues<T> {
        HyperValues {
            values: self
                .entries
                .iter()
                .enumerate()
                .map(|(i, h)| lift(HyperId(i), &h.value))
                .collect(),
        }
    }
}

/// Hyperparameter values as seen by a dynamics step or objective.
///
/// Indexed by [`HyperId`]; values are plain floats, duals or tape variables
/// depending on which evaluation the engine is performing.
#[derive(Clone, Debug)]
pub struct HyperValues<T> {
    values: Vec<Vec<T>>,
}

impl<T: Copy> HyperValues<T> {
    /// Flat value of a hyperparameter. Panics on a handle from another registry.
    #[inline]
    pub fn get(&self, id: HyperId) -> &[T] {
        &self.values[id.0]
    }

    /// First element of a hyperparameter, the value of a scalar.
    #[inline]
    pub fn scalar(&self, id: HyperId) -> T {
        self.values[id.0][0]
    }
}
