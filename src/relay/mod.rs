//! Broker-side protocol implementation.
//!
//! `message` defines the wire types and their validation, `codec` frames the
//! byte stream, `nick` owns nickname rules and generation, `server` holds the
//! registries, dispatcher and fan-out, and `liveness` drives ping rounds.

pub mod codec;
mod liveness;
pub mod message;
pub mod nick;
pub mod server;
