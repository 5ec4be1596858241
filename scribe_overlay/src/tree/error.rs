use crate::core::OverlayError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
  #[error("not a group URI: {0:?}")]
  BadUri(String),
  #[error("payload of {len} bytes exceeds the MTU of {mtu}")]
  PayloadTooLarge { len: usize, mtu: usize },
  #[error("the overlay has not joined a ring")]
  NotJoined,
  #[error(transparent)]
  Overlay(#[from] OverlayError),
}
