//! # statelane-core
//!
//! Reactive state machine engine.
//!
//! This crate provides:
//! - State graphs with handle-based identity
//! - A machine that serializes events through a single processing lane
//! - Transition records fanned out to isolated subscribers
//! - Declarative JSON/YAML machine definitions

pub mod config;
pub mod definition;
pub mod error;
pub mod graph;
pub mod machine;
pub mod record;
pub mod subscription;

pub use config::{LaneKind, MachineConfig};
pub use definition::{MachineDefinition, MachineDefinitionRaw, TransitionRule};
pub use error::{ConfigError, DefinitionError, MachineError, RecvError, TryRecvError};
pub use graph::{Event, State, StateGraph, StateId, Supplier};
pub use machine::{ShutdownMode, StateMachine};
pub use record::{Phase, Transition};
pub use subscription::{Subscription, Trigger};
