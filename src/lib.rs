//! brook — a standalone JSON-framed chat relay.
//!
//! One central broker accepts long-lived TCP connections, assigns each a
//! unique nickname, lets clients form ad-hoc `#`-named channels, and relays
//! directed and broadcast messages among them. See [`relay::server::Broker`]
//! for the process lifecycle.

pub mod relay;
