//! A prefix-routing DHT in the style of Pastry.
//!
//! Each node owns the keys numerically closest to its own. A message for a
//! key is forwarded hop by hop: inside the range of a node's leafset it goes
//! straight to the closest leafset member, otherwise to a routing table entry
//! sharing one more digit with the key.
//!
//! ### Joining
//! A new node sends `JOIN` to any bootstrap node, which routes it toward the
//! new node's own key. Every hop on the way sends the joiner one row of its
//! routing table. The node where the join ends replies `JOIN_ACK` with its
//! leafset, or `JOIN_NACK` if the joiner failed recently; the joiner then
//! waits out the grace period and tries again.
//!
//! ### Repair
//! Once active, a node pings everything it knows every
//! [`check_period`](OverlayConfig::check_period). Hosts whose success
//! average falls below [`bad_link`](OverlayConfig::bad_link) are evicted.
//! Leafsets are exchanged every few rounds.
//!
//! ### Layering
//! The layer above implements [`Upcalls`]: `forward` sees a routed message on
//! every hop, `deliver` on the node responsible for its key.

use crate::testkit::LogLevel;
mod config;
mod handlers;
mod node;
mod routing;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

#[rustfmt::skip]
pub use {
  config::OverlayConfig,
  config::DEFAULT_PORT,
  node::JoinState,
  node::Overlay,
  node::Upcalls,
  node::JOIN,
  node::JOIN_ACK,
  node::JOIN_NACK,
  node::PIGGY,
  node::PING,
  node::RESERVED_KINDS,
  node::UPDATE,
  routing::RoutingTable,
};
