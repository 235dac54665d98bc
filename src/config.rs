//! Settings for the store's managers, loadable from JSON.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::memory::Restriction;

#[derive(Debug)]
pub enum ConfigError {
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "could not parse config: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Pause between full cleanup cycles.
    pub frequency_ms: u64,
    pub restrictions: Vec<Restriction>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            frequency_ms: 30_000,
            restrictions: Vec::new(),
        }
    }
}

impl MemoryConfig {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndoConfig {
    pub max_undo_count: usize,
}

impl Default for UndoConfig {
    fn default() -> Self {
        UndoConfig { max_undo_count: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Number of ids fetched per remote query window.
    pub window_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig { window_size: 30 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub memory: MemoryConfig,
    pub undo: UndoConfig,
    pub query: QueryConfig,
}

impl StoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.window_size == 0 {
            return Err(ConfigError::Invalid("query.window_size must be positive".into()));
        }
        if self.undo.max_undo_count == 0 {
            return Err(ConfigError::Invalid("undo.max_undo_count must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for restriction in &self.memory.restrictions {
            if !seen.insert(restriction.type_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "memory restriction for {} given twice",
                    restriction.type_name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = StoreConfig::from_json_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.memory.frequency(), Duration::from_secs(30));
        assert_eq!(config.undo.max_undo_count, 1);
        assert_eq!(config.query.window_size, 30);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = StoreConfig::from_json_str(
            r#"{"memory": {"restrictions": [{"type_name": "Todo", "max": 100}]},
                "undo": {"max_undo_count": 20}}"#,
        )
        .unwrap();
        assert_eq!(config.memory.frequency_ms, 30_000);
        assert_eq!(config.memory.restrictions, vec![Restriction::new("Todo", 100)]);
        assert_eq!(config.undo.max_undo_count, 20);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            StoreConfig::from_json_str(r#"{"query": {"window_size": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StoreConfig::from_json_str("not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
