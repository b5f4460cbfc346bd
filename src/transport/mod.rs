//! # Transport Layer
//!
//! TCP listeners, per-connection state machines and clients.
//!
//! ## Components
//! - **Server**: dedicated I/O thread driving both listeners
//! - **Connection**: text and binary protocol loops plus the delivery queue
//! - **Client**: framed clients for the two wire protocols
//!
//! ## Scheduling
//! All sockets are serviced by one thread. The multiplexer is shared with
//! the host's own threads and guarded by its own lock.

pub mod client;
pub mod connection;
pub mod server;

pub use client::{BinaryClient, TextClient};
pub use server::{spawn, ServerHandle};
