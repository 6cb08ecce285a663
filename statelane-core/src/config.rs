//! Machine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STATELANE_CONFIG or --config)
//! 3. Environment variables

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the processing lane runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneKind {
    /// A tokio task when a runtime is available, otherwise a thread.
    #[default]
    Auto,
    /// Always a tokio task; construction fails outside a runtime.
    Task,
    /// Always a dedicated OS thread.
    Thread,
}

impl LaneKind {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(LaneKind::Auto),
            "task" => Some(LaneKind::Task),
            "thread" => Some(LaneKind::Thread),
            _ => None,
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Name used in logs and the lane thread name.
    pub name: String,
    /// Queue capacity of each channel subscriber.
    /// A subscriber whose queue fills up misses records and is told how many.
    pub subscriber_capacity: usize,
    /// Where the processing lane runs.
    pub lane: LaneKind,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: "machine".to_string(),
            subscriber_capacity: 1024,
            lane: LaneKind::Auto,
        }
    }
}

impl MachineConfig {
    /// Creates a default configuration with the given machine name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn with_lane(mut self, lane: LaneKind) -> Self {
        self.lane = lane;
        self
    }

    /// Loads configuration from file, then applies environment variable overrides.
    ///
    /// `path` falls back to `STATELANE_CONFIG`. Without a file the defaults
    /// are used, named `name`.
    pub fn load(path: Option<&Path>, name: &str) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("STATELANE_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let config = Self::from_file(&path)?;
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            None => Self::named(name),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: MachineConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("STATELANE_NAME") {
            if !name.is_empty() {
                self.name = name;
            }
        }

        if let Ok(capacity) = std::env::var("STATELANE_SUBSCRIBER_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.subscriber_capacity = n;
            }
        }

        if let Ok(lane) = std::env::var("STATELANE_LANE") {
            match LaneKind::parse(&lane) {
                Some(kind) => self.lane = kind,
                None => tracing::warn!("Ignoring unknown STATELANE_LANE value '{}'", lane),
            }
        }
    }

    /// Validates configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriber_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "subscriber_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
