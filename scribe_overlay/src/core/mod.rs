//! The substrate under the overlay: identifiers, hosts, wire framing,
//! acknowledged UDP delivery and the worker pool that runs message handlers.
//!
//! ### Keys
//! A [`Key`] is a 96-bit point on a ring. Nodes and groups both get keys by
//! hashing a string with SHA-1. Routing reads keys as 48 base-4 digits.
//!
//! ### Delivery
//! Every datagram starts with an 8-byte [`NetworkHeader`] holding an
//! [`AckFlag`] and a sequence number. Message types registered as
//! [`AckPolicy::Required`] are retransmitted by the [`Transport`] until
//! acknowledged, at most `max_retry` extra times. Handlers can see the same
//! message more than once and must tolerate it.
//!
//! ### Dispatch
//! Received messages are handed to a [`Dispatcher`], which looks up the
//! handler registered for the message type and queues it for a fixed pool of
//! workers.

use crate::testkit::LogLevel;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

mod dispatch;
mod error;
mod host;
mod key;
mod message;
mod packets;
mod transport;

pub const LOG_LEVEL: LogLevel = LogLevel::Warn;

#[rustfmt::skip]
pub use {
  dispatch::AckPolicy,
  dispatch::BoxFuture,
  dispatch::Dispatcher,
  dispatch::Handler,
  error::OverlayError,
  host::Host,
  host::HostRegistry,
  host::SUCCESS_WINDOW,
  key::Key,
  key::ParseKeyError,
  key::BASE,
  key::DIGITS,
  key::DIGIT_BITS,
  key::KEY_BITS,
  key::KEY_BYTES,
  message::Message,
  packets::encode_datagram,
  packets::AckFlag,
  packets::DecodeError,
  packets::HostRecord,
  packets::NetworkHeader,
  packets::Reader,
  packets::Writer,
  packets::MAX_DATAGRAM,
  packets::MAX_PAYLOAD,
  transport::Delivery,
  transport::Transport,
};

// Poisoned locks are recovered, not propagated.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(m: &RwLock<T>) -> RwLockReadGuard<'_, T> {
  m.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(m: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
  m.write().unwrap_or_else(PoisonError::into_inner)
}
