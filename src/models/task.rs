//! One-off task records.

use super::validation::ValidationError;
use super::volume_mount::VolumeMount;
use super::{Namespace, Record};
use crate::core::error::BulletinError;
use crate::core::time::unix_nanos;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    /// Completion callback is being delivered.
    Resolving,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Resolving => "RESOLVING",
        };
        f.write_str(s)
    }
}

/// A one-off unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_guid: String,
    pub domain: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Wall-clock nanoseconds of the last state change.
    #[serde(default)]
    pub updated_at: i64,
}

impl Task {
    pub fn new(task_guid: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            task_guid: task_guid.into(),
            domain: domain.into(),
            state: TaskState::Pending,
            callback_url: None,
            failed: false,
            failure_reason: String::new(),
            result: String::new(),
            volume_mounts: Vec::new(),
            updated_at: unix_nanos(),
        }
    }

    /// Move to `state`, stamping the change time.
    pub fn transition(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = unix_nanos();
    }

    /// Whether the last state change is at least `age` old at `now` (nanoseconds).
    pub fn unchanged_for(&self, age: std::time::Duration, now: i64) -> bool {
        now.saturating_sub(self.updated_at) >= age.as_nanos() as i64
    }

    /// Mark the task completed with an outcome.
    pub fn complete(&mut self, failed: bool, failure_reason: impl Into<String>, result: impl Into<String>) {
        self.transition(TaskState::Completed);
        self.failed = failed;
        self.failure_reason = failure_reason.into();
        self.result = result.into();
    }

    /// Body posted to the completion callback.
    pub fn callback_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "task_guid": self.task_guid,
            "domain": self.domain,
            "failed": self.failed,
            "failure_reason": self.failure_reason,
            "result": self.result,
        })
    }
}

impl Record for Task {
    const NAMESPACE: Namespace = Namespace::Task;

    fn key(&self) -> String {
        self.task_guid.clone()
    }

    fn validate(&self) -> Result<(), BulletinError> {
        let mut errors = ValidationError::new();
        errors.check(self.task_guid.is_empty(), "task_guid", "cannot be blank");
        errors.check(self.domain.is_empty(), "domain", "cannot be blank");
        if let Some(url) = &self.callback_url {
            errors.check(
                url::Url::parse(url).is_err(),
                "callback_url",
                "must be an absolute URL",
            );
        }
        errors.check(
            self.failed && self.failure_reason.is_empty(),
            "failure_reason",
            "cannot be blank when failed",
        );
        for (i, mount) in self.volume_mounts.iter().enumerate() {
            errors.nest(&format!("volume_mounts[{}]", i), mount.validation_errors());
        }
        errors.into_result()
    }
}
