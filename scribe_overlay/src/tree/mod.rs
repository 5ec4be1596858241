//! Application-level multicast on top of the overlay.
//!
//! A group is named by a URI such as `scribe://news`. The group part of the
//! URI is hashed to a key, and the node responsible for that key is the
//! group's root and rendezvous point.
//!
//! ### Trees
//! A `JOIN` is routed toward the group key. Every node it passes adopts the
//! previous hop as a child, answers with `PARENT`, and puts itself in the
//! message before passing it on. The reverse join paths form the tree.
//!
//! ### Multicast
//! A sender hands the payload to the rendezvous point, found once with
//! `RP_REQUEST`. From there every node copies it to each of its children.
//!
//! ### Maintenance
//! Each round, children lose one point of their counter and are dropped at
//! zero. Listeners rejoin every round, which refreshes the counters along
//! their path. A `LEAVE` prunes the branch up to the first node that still
//! has other children.

use crate::testkit::LogLevel;
mod config;
mod error;
mod group;
mod instance;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

pub const CREATE: u16 = 51;
pub const JOIN: u16 = 52;
pub const LEAVE: u16 = 53;
pub const MULTICAST: u16 = 54;
pub const PING: u16 = 60;
pub const HEARTBEAT: u16 = 61;
pub const RP_REQUEST: u16 = 62;
pub const RP_REPLY: u16 = 63;
pub const REPLICATE: u16 = 64;
pub const PARENT: u16 = 65;

#[rustfmt::skip]
pub use {
  config::TreeConfig,
  error::TreeError,
  group::GroupUri,
  group::Role,
  group::ScribeGroup,
  group::ScribeNode,
  group::UriCache,
  group::DEFAULT_COUNT,
  instance::ack_policy,
  instance::ScribeInstance,
  instance::TreeEvent,
};
