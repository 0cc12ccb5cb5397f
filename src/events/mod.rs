//! State-change notifications.
//!
//! The [`EventHub`] fans events out per [`Category`] to any number of
//! subscribers. Publishing never waits on a subscriber; a subscriber that
//! falls behind is disconnected instead.

pub mod hub;

pub use hub::{EventHub, EventSource, HubStats};

use serde::{Deserialize, Serialize};

/// Event stream a subscriber registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Desired,
    Actual,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Desired, Category::Actual];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desired => "desired",
            Self::Actual => "actual",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Changed,
    Removed,
}

/// A single state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub key: String,
    /// Record version after the change (the removed version for `Removed`).
    pub version: u64,
    /// Record body after the change. `None` for removals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Event {
    pub fn created(key: impl Into<String>, version: u64, payload: serde_json::Value) -> Self {
        Self {
            kind: EventKind::Created,
            key: key.into(),
            version,
            payload: Some(payload),
        }
    }

    pub fn changed(key: impl Into<String>, version: u64, payload: serde_json::Value) -> Self {
        Self {
            kind: EventKind::Changed,
            key: key.into(),
            version,
            payload: Some(payload),
        }
    }

    pub fn removed(key: impl Into<String>, version: u64) -> Self {
        Self {
            kind: EventKind::Removed,
            key: key.into(),
            version,
            payload: None,
        }
    }
}
