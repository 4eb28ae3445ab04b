//! Submitter identity
//!
//! The rate-limiter partition key. Accepted on the wire as a JSON string or
//! number; numbers are kept as their decimal text so `42` and `"42"` share a
//! window. Zero counts as a missing id, as do blank strings. Control
//! characters are refused so an identity always fits on one log line.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::GateError;

/// Opaque submitter key (`user_id`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Build an identity, rejecting blank keys and control characters
    pub fn new(raw: impl Into<String>) -> Result<Self, GateError> {
        let raw = raw.into();
        if raw.trim().is_empty() || raw.chars().any(char::is_control) {
            return Err(GateError::InvalidIdentity);
        }
        Ok(Self(raw))
    }

    /// Identity from a JSON value (string or number)
    pub fn from_json(value: &serde_json::Value) -> Result<Self, GateError> {
        match value {
            serde_json::Value::String(s) => Self::new(s.clone()),
            serde_json::Value::Number(n) if n.as_f64() == Some(0.0) => {
                Err(GateError::InvalidIdentity)
            }
            serde_json::Value::Number(n) => Self::new(n.to_string()),
            _ => Err(GateError::InvalidIdentity),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identity {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Identity::from_json(&value).map_err(serde::de::Error::custom)
    }
}
