//! State graph types.
//!
//! States live in an arena owned by [`StateGraph`] and are referenced by
//! [`StateId`] handles. Two states with the same name are still distinct
//! states; identity is the handle.
//!
//! ```
//! use statelane_core::StateGraph;
//!
//! let mut graph = StateGraph::new();
//! let view = graph.add_state("VIEW");
//! let adding = graph.add_state("ADDING");
//! graph[view].transition("ADD", adding);
//! graph[adding].transition("DONE", view);
//!
//! assert_eq!(graph[view].next(&"ADD"), Some(adding));
//! assert_eq!(graph[view].next(&"DONE"), None);
//! ```

use crate::error::MachineError;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::{Index, IndexMut};

/// Values that can drive a state machine.
pub trait Event: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> Event for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Handle to a state inside a [`StateGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(usize);

impl StateId {
    /// Returns the arena index of this state.
    pub fn index(self) -> usize {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Anything that can yield a state handle.
///
/// Lets callers reference states by handle or lazily through a closure.
pub trait Supplier {
    fn get(&self) -> StateId;
}

impl Supplier for StateId {
    fn get(&self) -> StateId {
        *self
    }
}

impl<F> Supplier for F
where
    F: Fn() -> StateId,
{
    fn get(&self) -> StateId {
        self()
    }
}

/// A node in the graph: a display name plus its outgoing transitions.
#[derive(Debug, Clone)]
pub struct State<E> {
    id: StateId,
    name: String,
    transitions: HashMap<E, StateId>,
}

impl<E: Event> State<E> {
    /// Registers (or replaces) the successor for `event`.
    pub fn transition(&mut self, event: E, next: impl Supplier) -> &mut Self {
        self.transitions.insert(event, next.get());
        self
    }

    /// Looks up the successor for `event`.
    pub fn next(&self, event: &E) -> Option<StateId> {
        self.transitions.get(event).copied()
    }

    /// Returns all events with a registered successor.
    pub fn events(&self) -> impl Iterator<Item = &E> {
        self.transitions.keys()
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<E> fmt::Display for State<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Arena of states with their transitions.
///
/// Mutable only while building; a running machine holds it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct StateGraph<E> {
    states: Vec<State<E>>,
}

impl<E: Event> StateGraph<E> {
    pub fn new() -> Self {
        Self { states: Vec::new() }
    }

    /// Adds a state and returns its handle.
    pub fn add_state(&mut self, name: impl Into<String>) -> StateId {
        let id = StateId(self.states.len());
        self.states.push(State {
            id,
            name: name.into(),
            transitions: HashMap::new(),
        });
        id
    }

    pub fn get(&self, id: StateId) -> Option<&State<E>> {
        self.states.get(id.0)
    }

    pub fn get_mut(&mut self, id: StateId) -> Option<&mut State<E>> {
        self.states.get_mut(id.0)
    }

    /// Returns the first state with the given name.
    pub fn find(&self, name: &str) -> Option<StateId> {
        self.states.iter().find(|s| s.name == name).map(|s| s.id)
    }

    /// Returns the display name of a state, or `"?"` for a foreign handle.
    pub fn name(&self, id: StateId) -> &str {
        self.get(id).map(State::name).unwrap_or("?")
    }

    pub fn contains(&self, id: StateId) -> bool {
        id.0 < self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &State<E>> {
        self.states.iter()
    }

    /// Checks a handle against this graph.
    pub fn check(&self, id: StateId) -> Result<StateId, MachineError> {
        if self.contains(id) {
            Ok(id)
        } else {
            Err(MachineError::UnknownState {
                index: id.0,
                len: self.states.len(),
            })
        }
    }

    /// Verifies every transition target belongs to this graph.
    pub fn validate(&self) -> Result<(), MachineError> {
        for state in &self.states {
            for target in state.transitions.values() {
                self.check(*target)?;
            }
        }
        Ok(())
    }
}

impl<E: Event> Default for StateGraph<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Index<StateId> for StateGraph<E> {
    type Output = State<E>;

    fn index(&self, id: StateId) -> &State<E> {
        &self.states[id.0]
    }
}

impl<E> IndexMut<StateId> for StateGraph<E> {
    fn index_mut(&mut self, id: StateId) -> &mut State<E> {
        &mut self.states[id.0]
    }
}
