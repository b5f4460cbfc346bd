//! # Utility Modules
//!
//! Supporting pieces shared by the multiplexer and the server.
//!
//! ## Components
//! - **Serial Registry**: single-use serials with expiry and persistence
//! - **Flush**: debounced flush timer for channels
//! - **Logging**: structured logging configuration
//! - **Time**: clock abstraction for expiry checks
//! - **Metrics**: thread-safe observability counters

pub mod flush;
pub mod logging;
pub mod metrics;
pub mod serial_registry;
pub mod time;

pub use serial_registry::{Serial, SerialRegistry, SerialSnapshot};
