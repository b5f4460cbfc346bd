//! # Wire Protocols
//!
//! Command grammar, binary frames and per-connection dispatch.
//!
//! Both protocols map onto the same four operations: subscribe, unsubscribe,
//! submit and (text only) quit.

pub mod command;
pub mod dispatcher;
pub mod frame;
