//! Long-running process records.

use super::validation::ValidationError;
use super::volume_mount::VolumeMount;
use super::{Namespace, Record};
use crate::core::error::BulletinError;
use serde::{Deserialize, Serialize};

/// Tag identifying one revision of a desired LRP.
///
/// The epoch changes when the desired LRP is recreated; the index increments
/// on every update within an epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationTag {
    pub epoch: String,
    pub index: u32,
}

impl ModificationTag {
    pub fn new(epoch: impl Into<String>, index: u32) -> Self {
        Self {
            epoch: epoch.into(),
            index,
        }
    }

    /// Start a fresh epoch at index zero.
    pub fn fresh() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), 0)
    }

    /// Bump the index within the current epoch.
    pub fn increment(&mut self) {
        self.index = self.index.saturating_add(1);
    }

    /// Whether `other` is a later revision than `self`.
    ///
    /// Tags without an epoch are treated as always superseded.
    pub fn succeeded_by(&self, other: &ModificationTag) -> bool {
        if self.epoch.is_empty() || other.epoch.is_empty() {
            return true;
        }
        self.epoch != other.epoch || self.index < other.index
    }
}

/// Desired state of a long-running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrp {
    pub process_guid: String,
    pub domain: String,
    pub instances: u32,
    pub root_fs: String,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub modification_tag: ModificationTag,
}

impl DesiredLrp {
    pub fn new(
        process_guid: impl Into<String>,
        domain: impl Into<String>,
        instances: u32,
        root_fs: impl Into<String>,
    ) -> Self {
        Self {
            process_guid: process_guid.into(),
            domain: domain.into(),
            instances,
            root_fs: root_fs.into(),
            volume_mounts: Vec::new(),
            modification_tag: ModificationTag::fresh(),
        }
    }
}

impl Record for DesiredLrp {
    const NAMESPACE: Namespace = Namespace::Desired;

    fn key(&self) -> String {
        self.process_guid.clone()
    }

    fn validate(&self) -> Result<(), BulletinError> {
        let mut errors = ValidationError::new();
        errors.check(self.process_guid.is_empty(), "process_guid", "cannot be blank");
        errors.check(self.domain.is_empty(), "domain", "cannot be blank");
        errors.check(self.root_fs.is_empty(), "root_fs", "cannot be blank");
        for (i, mount) in self.volume_mounts.iter().enumerate() {
            errors.nest(&format!("volume_mounts[{}]", i), mount.validation_errors());
        }
        errors.into_result()
    }
}

/// Lifecycle state of an actual LRP instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActualLrpState {
    Unclaimed,
    Claimed,
    Running,
    Crashed,
}

impl std::fmt::Display for ActualLrpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unclaimed => "UNCLAIMED",
            Self::Claimed => "CLAIMED",
            Self::Running => "RUNNING",
            Self::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

/// Observed state of one LRP instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualLrp {
    pub process_guid: String,
    pub index: u32,
    pub domain: String,
    pub state: ActualLrpState,
    #[serde(default)]
    pub cell_id: String,
    /// Revision of the desired LRP this instance was started for.
    #[serde(default)]
    pub desired_modification_tag: ModificationTag,
    /// Last state change, nanoseconds since the Unix epoch.
    #[serde(default)]
    pub since: i64,
}

impl ActualLrp {
    /// A fresh unclaimed instance for `desired` at `index`.
    pub fn unclaimed(desired: &DesiredLrp, index: u32, since: i64) -> Self {
        Self {
            process_guid: desired.process_guid.clone(),
            index,
            domain: desired.domain.clone(),
            state: ActualLrpState::Unclaimed,
            cell_id: String::new(),
            desired_modification_tag: desired.modification_tag.clone(),
            since,
        }
    }

    /// Storage key for a process guid and index.
    pub fn key_for(process_guid: &str, index: u32) -> String {
        format!("{}-{}", process_guid, index)
    }
}

impl Record for ActualLrp {
    const NAMESPACE: Namespace = Namespace::Actual;

    fn key(&self) -> String {
        Self::key_for(&self.process_guid, self.index)
    }

    fn validate(&self) -> Result<(), BulletinError> {
        let mut errors = ValidationError::new();
        errors.check(self.process_guid.is_empty(), "process_guid", "cannot be blank");
        errors.check(self.domain.is_empty(), "domain", "cannot be blank");
        errors.check(
            self.state == ActualLrpState::Unclaimed && !self.cell_id.is_empty(),
            "cell_id",
            "must be blank when unclaimed",
        );
        errors.check(
            matches!(self.state, ActualLrpState::Claimed | ActualLrpState::Running)
                && self.cell_id.is_empty(),
            "cell_id",
            "cannot be blank when claimed or running",
        );
        errors.into_result()
    }
}
