//! Engine Configuration

use serde::{Deserialize, Serialize};

/// Knobs for the propagation loop.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use tessera_core::EngineConfig;
///
/// let config = EngineConfig::from_json(r#"{"max_cascade_events": 50}"#).unwrap();
/// assert_eq!(config.max_cascade_events, 50);
/// assert!(config.dedupe_deliveries);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on events processed by one propagation pass.
    pub max_cascade_events: usize,
    /// Deliver an event to a computation at most once per host.
    pub dedupe_deliveries: bool,
    /// Skip writing a computed value equal to the stored one.
    pub skip_unchanged_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cascade_events: 10_000,
            dedupe_deliveries: true,
            skip_unchanged_writes: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
