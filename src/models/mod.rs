//! Record models.
//!
//! Every persisted record type implements [`Record`], which ties it to a
//! [`Namespace`] and a stable key within that namespace.

pub mod lrp;
pub mod task;
pub mod validation;
pub mod volume_mount;

pub use lrp::{ActualLrp, ActualLrpState, DesiredLrp, ModificationTag};
pub use task::{Task, TaskState};
pub use validation::ValidationError;
pub use volume_mount::{Device, SharedDevice, VolumeMount};

use crate::core::error::BulletinError;
use crate::events::Category;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Storage namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Namespace {
    Desired,
    Actual,
    Task,
    /// Store bookkeeping (schema version, key rotation marker).
    Meta,
}

impl Namespace {
    /// Namespaces holding encrypted domain records.
    pub const RECORDS: [Namespace; 3] = [Namespace::Desired, Namespace::Actual, Namespace::Task];

    /// Every namespace, including metadata.
    pub const ALL: [Namespace; 4] = [
        Namespace::Desired,
        Namespace::Actual,
        Namespace::Task,
        Namespace::Meta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desired => "desired",
            Self::Actual => "actual",
            Self::Task => "task",
            Self::Meta => "meta",
        }
    }

    /// Event category mutations in this namespace are published on.
    pub fn category(&self) -> Option<Category> {
        match self {
            Self::Desired => Some(Category::Desired),
            Self::Actual => Some(Category::Actual),
            Self::Task | Self::Meta => None,
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed record persisted through the record store.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Namespace records of this type live in.
    const NAMESPACE: Namespace;

    /// Stable key within the namespace.
    fn key(&self) -> String;

    /// Reject structurally invalid records before they are written.
    fn validate(&self) -> Result<(), BulletinError>;
}
