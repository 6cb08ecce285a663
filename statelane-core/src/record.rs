//! Transition records broadcast by the lane.

use crate::graph::StateId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which end of a transition a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Emitted once when the machine starts. Not subscribable via triggers.
    Starting,
    /// The old state, about to be left.
    Exiting,
    /// The new state, just arrived.
    Entering,
}

impl Phase {
    /// Returns true for phases that leave the machine in a settled state.
    pub fn is_settled(self) -> bool {
        matches!(self, Phase::Starting | Phase::Entering)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Exiting => "exiting",
            Phase::Entering => "entering",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published transition record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<E> {
    /// Position in the machine's record stream; 0 is the starting record.
    pub seq: u64,
    /// The state being exited or entered.
    pub state: StateId,
    pub phase: Phase,
    /// The event that caused the transition; `None` for [`Phase::Starting`].
    pub event: Option<E>,
}

impl<E> Transition<E> {
    pub(crate) fn starting(state: StateId) -> Self {
        Self {
            seq: 0,
            state,
            phase: Phase::Starting,
            event: None,
        }
    }
}
