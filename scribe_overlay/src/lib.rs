//! A Pastry-style distributed hash table over acknowledged UDP, with
//! Scribe-style multicast trees built on top of it.
//!
//! [`core`] carries keys, hosts, wire framing, reliable delivery and message
//! dispatch. [`overlay`] joins nodes into a ring and routes messages by key.
//! [`tree`] builds per-group multicast trees through the overlay's upcalls.
//! [`testkit`] holds logging setup and fault injection.

pub mod core;
pub mod overlay;
pub mod testkit;
pub mod tree;
