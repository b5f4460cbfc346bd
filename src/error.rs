//! # Error Types
//!
//! Comprehensive error handling for the portal relay.
//!
//! This module defines all error variants that can occur while relaying envelopes,
//! from low-level I/O errors to authorization failures raised by the multiplexer.
//!
//! ## Error Categories
//! - **I/O Errors**: Network and file system failures, fatal to one connection only
//! - **Framing Errors**: Malformed lines, unknown frame tags, oversized frames
//! - **Integrity Errors**: MAC mismatches, unknown or expired serials
//! - **Authorization Errors**: Password mismatch, duplicate or missing subscriptions
//! - **Channel Errors**: Invalid or unknown channel names, channel rejections
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use portal_mux::core::channel_name::ChannelName;
//! use portal_mux::error::{PortalError, Result};
//! use tracing::{error, info};
//!
//! fn parse(name: &str) -> Result<ChannelName> {
//!     ChannelName::parse(name)
//! }
//!
//! fn main() {
//!     match parse("no") {
//!         Ok(name) => info!(%name, "Valid channel"),
//!         Err(e) => error!(error = %e, reason = e.public_reason(), "Rejected channel"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Reason shown to network peers for every integrity failure
    pub const ERR_REJECTED_MESSAGE: &str = "Invalid or replayed message";

    /// Text protocol errors
    pub const ERR_UNSUPPORTED_COMMAND: &str = "Command not supported";
    pub const ERR_ARGUMENT_COUNT: &str = "Invalid number of arguments";
    pub const ERR_INVALID_BASE64: &str = "Invalid Base64-encoded message";
    pub const ERR_LINE_TOO_LONG: &str = "Line too long";
    pub const ERR_MALFORMED_LINE: &str = "Malformed line";

    /// Multiplexer errors
    pub const ERR_ALREADY_SUBSCRIBED: &str = "Portal was already subscribed";
    pub const ERR_NOT_SUBSCRIBED: &str = "Portal was not subscribed";
    pub const ERR_PASSWORD_MISMATCH: &str = "Passwords do not match";
    pub const ERR_OUTBOUND_ONLY: &str = "Channel does not accept payloads";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Closing notice sent before a `QUIT` closes the connection
    pub const MSG_CLOSING: &str = "Service closing transmission channel";
}

// PortalError is the primary error type for all relay operations
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid channel name: {0:?}")]
    InvalidChannelName(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Portal was already subscribed: {0}")]
    AlreadySubscribed(String),

    #[error("Portal was not subscribed: {0}")]
    NotSubscribed(String),

    #[error("Passwords do not match")]
    PasswordMismatch,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Malformed envelope: {0} bytes")]
    MalformedEnvelope(usize),

    #[error("Invalid or replayed message: unknown serial {0}")]
    UnknownSerial(u32),

    #[error("Invalid or replayed message: serial {0} expired")]
    ExpiredSerial(u32),

    #[error("Serial space exhausted")]
    SerialExhausted,

    #[error("Payload too large: {0} bytes")]
    OversizedPayload(usize),

    #[error("Invalid Base64-encoded message")]
    InvalidBase64,

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Command not supported")]
    UnsupportedCommand,

    #[error("Unknown frame tag: {0}")]
    UnknownFrameTag(i32),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(i32),

    #[error("Channel rejected payload: {0}")]
    ChannelRejected(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Synchronization primitive poisoned")]
    LockPoisoned,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl PortalError {
    /// Whether this error means an envelope failed authentication or replay checks
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            PortalError::InvalidSignature
                | PortalError::MalformedEnvelope(_)
                | PortalError::UnknownSerial(_)
                | PortalError::ExpiredSerial(_)
        )
    }

    /// Text safe to send to a network peer.
    ///
    /// Integrity failures collapse into one generic string so a peer cannot
    /// tell a bad MAC from a spent serial.
    pub fn public_reason(&self) -> String {
        if self.is_integrity_failure() {
            return constants::ERR_REJECTED_MESSAGE.to_string();
        }
        match self {
            PortalError::Io(_) | PortalError::Serialization(_) | PortalError::LockPoisoned => {
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PortalError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        PortalError::LockPoisoned
    }
}

/// Type alias for Results using PortalError
pub type Result<T> = std::result::Result<T, PortalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_failures_share_one_public_reason() {
        let reasons: Vec<String> = [
            PortalError::InvalidSignature,
            PortalError::MalformedEnvelope(3),
            PortalError::UnknownSerial(7),
            PortalError::ExpiredSerial(7),
        ]
        .iter()
        .map(PortalError::public_reason)
        .collect();

        assert!(reasons.iter().all(|r| r == constants::ERR_REJECTED_MESSAGE));
    }

    #[test]
    fn authorization_errors_keep_their_text() {
        assert_eq!(
            PortalError::PasswordMismatch.public_reason(),
            "Passwords do not match"
        );
        assert_eq!(
            PortalError::UnknownChannel("foo".into()).public_reason(),
            "Unknown channel: foo"
        );
    }
}
