//! Field-level validation accumulation.

use crate::core::error::BulletinError;

/// Collects every validation failure for a record instead of stopping at the
/// first one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationError {
    errors: Vec<String>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `field`.
    pub fn push(&mut self, field: &str, reason: impl Into<String>) {
        self.errors.push(format!("{}: {}", field, reason.into()));
    }

    /// Record a failure for `field` when `failed` holds.
    pub fn check(&mut self, failed: bool, field: &str, reason: &str) {
        if failed {
            self.push(field, reason);
        }
    }

    /// Merge failures from a nested value under a field prefix.
    pub fn nest(&mut self, prefix: &str, other: ValidationError) {
        for e in other.errors {
            self.errors.push(format!("{}.{}", prefix, e));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Convert into a result, failing with `InvalidRecord` when any error was
    /// recorded.
    pub fn into_result(self) -> Result<(), BulletinError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(BulletinError::invalid(self.errors.join("; ")))
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_all_failures() {
        let mut v = ValidationError::new();
        v.check(true, "driver", "cannot be blank");
        v.check(false, "mode", "unused");
        let mut inner = ValidationError::new();
        inner.push("volume_id", "cannot be blank");
        v.nest("shared", inner);

        assert_eq!(v.errors().len(), 2);
        assert_eq!(v.errors()[1], "shared.volume_id: cannot be blank");
        assert!(v.into_result().is_err());
    }

    #[test]
    fn test_empty_is_ok() {
        assert!(ValidationError::new().into_result().is_ok());
    }
}
