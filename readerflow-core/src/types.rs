//! Shared identifier types
//!
//! Small newtypes used across the flow so reader identifiers and operation
//! generations cannot be mixed up with plain strings and integers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a physical card reader as reported by discovery
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReaderId(String);

impl ReaderId {
    /// Create a new reader identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReaderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReaderId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Session token attached to every discovery operation
///
/// Raised on every start, cancel and retry. Events tagged with an older
/// generation belong to an abandoned operation and are dropped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Generation(u64);

impl Generation {
    /// The generation that follows this one
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Raw counter value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
