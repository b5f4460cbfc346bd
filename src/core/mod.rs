//! # Core Components
//!
//! Channel names, the signed envelope format and the stream codecs.
//!
//! ## Envelope Format
//! ```text
//! [MAC(32)] [Serial(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - HMAC-SHA-256 over serial and payload, compared in constant time
//! - Line and frame lengths are bounded before anything is buffered

pub mod channel_name;
pub mod codec;
pub mod envelope;
