use crate::core::DecodeError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
  #[error("could not bind the overlay socket: {0}")]
  Bind(#[source] io::Error),
  #[error("could not resolve {0}")]
  Resolve(String),
  #[error("message type {0} is reserved for the overlay")]
  ReservedKind(u16),
  #[error("message type {0} already has a handler")]
  DuplicateKind(u16),
  #[error("message type {0} has no registered handler")]
  UnregisteredKind(u16),
  #[error("payload of {0} bytes does not fit in one datagram")]
  PayloadTooLarge(usize),
  #[error("malformed message: {0}")]
  Decode(#[from] DecodeError),
  #[error("socket error: {0}")]
  Io(#[from] io::Error),
  #[error("the overlay shut down before the join completed")]
  JoinAborted,
}
