//! Validated channel ("portal") names.
//!
//! A name is 3 to 16 characters drawn from `[0-9a-zA-Z_/]`. Names are checked
//! at the edge, so everything past parsing can assume a well-formed name.

use crate::error::{PortalError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Minimum channel name length in bytes
pub const MIN_NAME_LEN: usize = 3;

/// Maximum channel name length in bytes
pub const MAX_NAME_LEN: usize = 16;

/// Name of a channel, guaranteed to match `[0-9a-zA-Z_/]{3,16}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    /// Validate and wrap a channel name
    pub fn parse(name: &str) -> Result<Self> {
        if Self::is_valid(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(PortalError::InvalidChannelName(name.to_string()))
        }
    }

    /// Parse a name carried as raw bytes (binary protocol)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let name = std::str::from_utf8(bytes)
            .map_err(|_| PortalError::InvalidChannelName(String::from_utf8_lossy(bytes).into()))?;
        Self::parse(name)
    }

    pub fn is_valid(name: &str) -> bool {
        (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelName {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ChannelName {
    type Error = PortalError;

    fn try_from(value: String) -> Result<Self> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(PortalError::InvalidChannelName(value))
        }
    }
}

impl From<ChannelName> for String {
    fn from(name: ChannelName) -> Self {
        name.0
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn accepts_names_in_pattern() {
        for name in ["foo", "testportal", "a/b_c", "0123456789abcdef", "UP/down"] {
            assert!(ChannelName::parse(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_names_outside_pattern() {
        for name in ["", "ab", "0123456789abcdefg", "with space", "dash-ed", "ümlaut", "a.b.c"] {
            assert!(
                matches!(
                    ChannelName::parse(name),
                    Err(PortalError::InvalidChannelName(_))
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn from_bytes_rejects_invalid_utf8() {
        assert!(ChannelName::from_bytes(&[0xff, 0xfe, 0xfd]).is_err());
        assert_eq!(ChannelName::from_bytes(b"foo").unwrap().as_str(), "foo");
    }

    #[test]
    fn deserialization_validates() {
        let ok: ChannelName = toml::from_str::<toml::Value>("n = 'myportal'")
            .unwrap()
            .get("n")
            .unwrap()
            .clone()
            .try_into()
            .unwrap();
        assert_eq!(ok.as_str(), "myportal");

        let bad: std::result::Result<ChannelName, _> = toml::Value::String("x".into()).try_into();
        assert!(bad.is_err());
    }
}
