//! # portal-mux
//!
//! Signed, replay-protected publish/subscribe relay. Peers subscribe to named
//! channels ("portals") over a line protocol or a framed binary protocol;
//! payloads published on a channel are sealed into HMAC-signed envelopes with
//! single-use serials and fanned out to every subscriber. Envelopes submitted
//! back are verified, their serial consumed, and the payload handed to the
//! channel.
//!
//! ## Quick start
//! ```no_run
//! use portal_mux::config::RelayConfig;
//! use portal_mux::core::envelope::{EnvelopeCodec, SharedSecret};
//! use portal_mux::mux::{directory::MemoryDirectory, Multiplexer};
//! use portal_mux::utils::SerialRegistry;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> portal_mux::error::Result<()> {
//! let config = RelayConfig::default();
//! let directory = MemoryDirectory::new(tokio::runtime::Handle::current(), &config.channels);
//! let registry = Arc::new(SerialRegistry::new(config.security.max_serial_lifetime));
//! let codec = EnvelopeCodec::new(SharedSecret::from("change me"), registry);
//! let mux = Arc::new(Multiplexer::new(directory.clone(), codec));
//! directory.attach(&mux);
//!
//! let server = portal_mux::transport::spawn(&config.server, mux)?;
//! println!("listening on {}", server.text_addr());
//! server.shutdown()
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use error::{PortalError, Result};
