//! Volume mount descriptors attached to LRPs and tasks.
//!
//! A mount names a volume driver, the path inside the container, an access
//! mode and a device. Records written by older clients may still carry the
//! flat `deprecated_volume_id` / `deprecated_config` pair; when either is
//! present both must be usable or the mount is rejected.

use super::validation::ValidationError;
use crate::core::error::BulletinError;
use serde::{Deserialize, Serialize};

/// Read-only access.
pub const MODE_READ: &str = "r";
/// Read-write access.
pub const MODE_READ_WRITE: &str = "rw";

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub driver: String,
    pub container_dir: String,
    pub mode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deprecated_volume_id: String,

    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "base64_bytes"
    )]
    pub deprecated_config: Vec<u8>,
}

/// Device kinds a mount can reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// A volume that may be mounted by several containers at once.
    Shared(SharedDevice),
}

/// Shared device descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedDevice {
    pub volume_id: String,

    /// Driver-specific configuration, passed through untouched.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_config: String,
}

impl VolumeMount {
    /// Build a mount backed by a shared device.
    pub fn shared(
        driver: impl Into<String>,
        container_dir: impl Into<String>,
        mode: impl Into<String>,
        volume_id: impl Into<String>,
        mount_config: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            container_dir: container_dir.into(),
            mode: mode.into(),
            device: Some(Device::Shared(SharedDevice {
                volume_id: volume_id.into(),
                mount_config: mount_config.into(),
            })),
            deprecated_volume_id: String::new(),
            deprecated_config: Vec::new(),
        }
    }

    /// Shared device, if that is the device kind.
    pub fn shared_device(&self) -> Option<&SharedDevice> {
        match &self.device {
            Some(Device::Shared(shared)) => Some(shared),
            None => None,
        }
    }

    /// Mutable shared device, if that is the device kind.
    pub fn shared_device_mut(&mut self) -> Option<&mut SharedDevice> {
        match &mut self.device {
            Some(Device::Shared(shared)) => Some(shared),
            None => None,
        }
    }

    fn has_deprecated_fields(&self) -> bool {
        !self.deprecated_volume_id.is_empty() || !self.deprecated_config.is_empty()
    }

    /// Collect every validation failure of this mount.
    pub fn validation_errors(&self) -> ValidationError {
        let mut errors = ValidationError::new();

        errors.check(self.driver.is_empty(), "driver", "cannot be blank");
        errors.check(
            self.container_dir.is_empty(),
            "container_dir",
            "cannot be blank",
        );
        errors.check(
            self.mode != MODE_READ && self.mode != MODE_READ_WRITE,
            "mode",
            "must be 'r' or 'rw'",
        );

        match &self.device {
            Some(Device::Shared(shared)) => {
                errors.check(
                    shared.volume_id.is_empty(),
                    "shared.volume_id",
                    "cannot be blank",
                );
            }
            None if !self.has_deprecated_fields() => {
                errors.push("device", "must be specified");
            }
            None => {}
        }

        if self.has_deprecated_fields() {
            errors.check(
                self.deprecated_volume_id.is_empty(),
                "deprecated_volume_id",
                "cannot be blank when legacy fields are set",
            );
            if serde_json::from_slice::<serde_json::Value>(&self.deprecated_config).is_err() {
                errors.push("deprecated_config", "must be a JSON document");
            }
        }

        errors
    }

    /// Validate the mount, failing with `InvalidRecord`.
    pub fn validate(&self) -> Result<(), BulletinError> {
        self.validation_errors().into_result()
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
