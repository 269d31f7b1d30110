use std::{fmt, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

lazy_static! {
    static ref HANDLE_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Identifier linking a partition request or volume definition to the block
/// devices it produces.
///
/// Handles are short, case-sensitive strings matching `^[A-Za-z0-9_-]+$`.
/// They need to be unique within a volume registry; partition requests may
/// share a handle, in which case the group denotes one partition per device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Validates `value` (surrounding whitespace is trimmed) and wraps it.
    pub fn new(value: impl AsRef<str>) -> Result<Self, ParseError> {
        let value = value.as_ref().trim();
        if !HANDLE_PATTERN.is_match(value) {
            return Err(ParseError::BadHandle {
                value: value.to_string(),
            });
        }
        Ok(Handle(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Handle {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Handle::new(s)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D>(deserializer: D) -> Result<Handle, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Handle::new(&raw).map_err(serde::de::Error::custom)
    }
}
