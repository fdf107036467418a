//! State snapshots recorded by the reverse-mode engine.

use crate::dynamics::State;

/// States of every registration at one point of the inner run.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Snapshot<F> {
    /// Index of the inner step that produced this snapshot; `None` for the
    /// initial state.
    pub step: Option<usize>,
    /// One state per registration, in registration order.
    pub states: Vec<State<F>>,
}

/// Ordered sequence of snapshots.
///
/// After a fresh run of `T` steps it holds `T + 1` entries: the initial state
/// followed by the state after each step. It is emptied on reset.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct History<F> {
    snapshots: Vec<Snapshot<F>>,
}

impl<F> Default for History<F> {
    fn default() -> Self {
        History {
            snapshots: Vec::new(),
        }
    }
}

impl<F> History<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Snapshot<F>> {
        self.snapshots.get(index)
    }

    pub fn last(&self) -> Option<&Snapshot<F>> {
        self.snapshots.last()
    }

    pub fn snapshots(&self) -> &[Snapshot<F>] {
        &self.snapshots
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Snapshot<F>> {
        self.snapshots.iter()
    }

    pub(crate) fn push(&mut self, snapshot: Snapshot<F>) {
        self.snapshots.push(snapshot);
    }

    pub(crate) fn clear(&mut self) {
        self.snapshots.clear();
    }
}

impl<'a, F> IntoIterator for &'a History<F> {
    type Item = &'a Snapshot<F>;
    type IntoIter = std::slice::Iter<'a, Snapshot<F>>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshots.iter()
    }
}
