//! Optimistic concurrency expectation for execution writes.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// The version a writer last read.
///
/// Every execution write carries one; the store applies the write only if the
/// stored version still equals it, then increments the stored version. There is
/// no `Any` escape hatch: every execution write is a compare-and-write.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedVersion(u64);

impl ExpectedVersion {
    pub fn exact(version: u64) -> Self {
        Self(version)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The version the record will carry once this write is applied.
    pub fn next(self) -> u64 {
        self.0 + 1
    }

    pub fn matches(self, actual: u64) -> bool {
        self.0 == actual
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {}, actual: {actual})",
                self.0
            )))
        }
    }
}
