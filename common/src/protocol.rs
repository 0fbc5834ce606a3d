//! Stats protocol published over MQTT.
//!
use serde::{Deserialize, Serialize};

/// Topic carrying the running total and the current count.
pub const PERSON_TOPIC: &str = "person";

/// Topic carrying the time a person spent in the frame.
pub const DURATION_TOPIC: &str = "person/duration";

/// Definition of stats messages.
///
/// Every variant serializes to a single-key JSON object, e.g. `{"total":3}`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatsMsg {
    /// Number of people seen since start.
    Total { total: u64 },
    /// Number of people in the current frame.
    Count { count: u64 },
    /// Seconds the last person spent in the frame.
    Duration { duration: u64 },
}

impl StatsMsg {
    pub fn topic(&self) -> &'static str {
        match self {
            StatsMsg::Total { .. } | StatsMsg::Count { .. } => PERSON_TOPIC,
            StatsMsg::Duration { .. } => DURATION_TOPIC,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
