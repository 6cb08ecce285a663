//! Declarative machine definitions.
//!
//! Definitions use a JSON (or YAML) DSL:
//!
//! ```json
//! {
//!   "states": ["VIEW", "ADDING", "DELETING"],
//!   "initial": "VIEW",
//!   "transitions": [
//!     {"from": "VIEW", "event": "ADD", "to": "ADDING"},
//!     {"from": "VIEW", "event": "DELETE", "to": "DELETING"},
//!     {"from": ["ADDING", "DELETING"], "event": "DONE", "to": "VIEW"}
//!   ]
//! }
//! ```
//!
//! Events of a definition-built graph are plain strings.

use crate::error::DefinitionError;
use crate::graph::{StateGraph, StateId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A transition rule in a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRule {
    /// Source state(s). Can be a single state or multiple.
    #[serde(deserialize_with = "deserialize_from_states")]
    pub from: Vec<String>,

    /// Event that triggers this transition.
    pub event: String,

    /// Target state.
    pub to: String,
}

fn deserialize_from_states<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct FromStatesVisitor;

    impl<'de> Visitor<'de> for FromStatesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut states = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                states.push(s);
            }
            Ok(states)
        }
    }

    deserializer.deserialize_any(FromStatesVisitor)
}

/// Raw definition as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDefinitionRaw {
    /// Optional machine name, used in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// All states, in graph order.
    pub states: Vec<String>,

    /// Initial state.
    pub initial: String,

    /// Transitions.
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
}

/// Validated machine definition.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    /// Machine name.
    pub name: String,

    /// State names in graph order.
    states: Vec<String>,

    /// Initial state.
    pub initial: String,

    /// Transitions indexed by (from_state, event) -> to_state.
    transitions: HashMap<(String, String), String>,

    /// Original raw definition.
    pub raw: MachineDefinitionRaw,

    /// CRC32C of the canonical JSON form.
    pub checksum: String,
}

impl MachineDefinition {
    /// Parses and validates a definition from a JSON value.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, DefinitionError> {
        let raw: MachineDefinitionRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(raw)
    }

    /// Parses and validates a definition from YAML (or JSON) text.
    pub fn from_yaml_str(text: &str) -> Result<Self, DefinitionError> {
        let raw: MachineDefinitionRaw = serde_yaml::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Loads a definition file. `.json` files are parsed as JSON, anything
    /// else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DefinitionError::Io(path.to_path_buf(), e))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let mut raw: MachineDefinitionRaw = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        if raw.name.is_none() {
            raw.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        Self::from_raw(raw)
    }

    /// Validates a raw definition.
    pub fn from_raw(raw: MachineDefinitionRaw) -> Result<Self, DefinitionError> {
        let mut seen = HashSet::new();
        for state in &raw.states {
            if !seen.insert(state.as_str()) {
                return Err(DefinitionError::invalid(format!(
                    "duplicate state '{}'",
                    state
                )));
            }
        }

        if !seen.contains(raw.initial.as_str()) {
            return Err(DefinitionError::invalid(format!(
                "initial state '{}' not in states list",
                raw.initial
            )));
        }

        let mut transitions = HashMap::new();
        for t in &raw.transitions {
            if !seen.contains(t.to.as_str()) {
                return Err(DefinitionError::invalid(format!(
                    "transition target '{}' not in states list",
                    t.to
                )));
            }
            if t.from.is_empty() {
                return Err(DefinitionError::invalid(format!(
                    "transition on event '{}' has no source state",
                    t.event
                )));
            }

            for from in &t.from {
                if !seen.contains(from.as_str()) {
                    return Err(DefinitionError::invalid(format!(
                        "transition source '{}' not in states list",
                        from
                    )));
                }

                let key = (from.clone(), t.event.clone());
                if transitions.contains_key(&key) {
                    return Err(DefinitionError::invalid(format!(
                        "duplicate transition from '{}' on event '{}'",
                        from, t.event
                    )));
                }
                transitions.insert(key, t.to.clone());
            }
        }

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        Ok(Self {
            name: raw.name.clone().unwrap_or_else(|| "machine".to_string()),
            states: raw.states.clone(),
            initial: raw.initial.clone(),
            transitions,
            raw,
            checksum,
        })
    }

    /// Looks up the target state for a state and event.
    pub fn get_transition(&self, state: &str, event: &str) -> Option<&str> {
        self.transitions
            .get(&(state.to_string(), event.to_string()))
            .map(String::as_str)
    }

    /// Returns all valid events from the given state, sorted.
    pub fn events_from(&self, state: &str) -> Vec<&str> {
        let mut events: Vec<&str> = self
            .transitions
            .keys()
            .filter(|(s, _)| s == state)
            .map(|(_, e)| e.as_str())
            .collect();
        events.sort_unstable();
        events
    }

    /// State names in graph order.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// Number of (state, event) transitions.
    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Builds the state graph and returns it with the initial state handle.
    ///
    /// Handles are assigned in `states` order.
    pub fn build(&self) -> (StateGraph<String>, StateId) {
        let mut graph = StateGraph::new();
        let ids: HashMap<&str, StateId> = self
            .states
            .iter()
            .map(|name| (name.as_str(), graph.add_state(name.clone())))
            .collect();

        for ((from, event), to) in &self.transitions {
            graph[ids[from.as_str()]].transition(event.clone(), ids[to.as_str()]);
        }

        (graph, ids[self.initial.as_str()])
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, DefinitionError> {
        Ok(serde_json::to_value(&self.raw)?)
    }
}
