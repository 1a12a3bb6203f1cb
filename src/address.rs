// address.rs
//! Device base addresses.
//!
//! A base address is `scheme://host[:port]` and nothing else. Paths, queries,
//! fragments and userinfo are rejected because the value ends up as the prefix
//! of an outbound request built from user-supplied text.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, sync::LazyLock};

use crate::error::ProxyError;

static SCHEME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://").expect("scheme pattern is valid")
});

static BASE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://[a-z0-9.-]+(?::(\d+))?$").expect("address pattern is valid")
});

/// Trims, adds `http://` when no scheme is present and strips trailing slashes.
/// Empty input stays empty.
pub fn normalize(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let with_scheme = if SCHEME.is_match(trimmed) {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    with_scheme.trim_end_matches('/').to_string()
}

/// Host and optional port only; the port must be 1-65535.
pub fn is_valid(input: &str) -> bool {
    let normalized = normalize(input);
    let Some(caps) = BASE_ADDRESS.captures(&normalized) else {
        return false;
    };
    match caps.get(1) {
        Some(port) => matches!(port.as_str().parse::<u16>(), Ok(p) if p != 0),
        None => true,
    }
}

/// A normalized base address that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn parse(input: &str) -> Result<Self, ProxyError> {
        let normalized = normalize(input);
        if is_valid(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(ProxyError::InvalidAddress(input.trim().to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins a device API path such as `/json/state` onto the base.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.0, path)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DeviceAddress::parse(&raw).map_err(serde::de::Error::custom)
    }
}
