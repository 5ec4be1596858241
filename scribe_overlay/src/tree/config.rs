use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configures a [`ScribeInstance`](crate::tree::ScribeInstance).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeConfig {
  /// Whether joins, leaves and multicasts are acknowledged and retransmitted. Group creation and
  /// rendezvous point discovery are always acknowledged.
  ///
  /// default: `false`
  pub reliable: bool,
  /// Whether the background maintenance loop runs. Without it, call
  /// [`maintain`](crate::tree::ScribeInstance::maintain) by hand.
  ///
  /// default: `true`
  pub maintenance: bool,
  /// Period of the maintenance loop. Each round decays children that did not rejoin and
  /// rejoins every group this node listens to.
  ///
  /// default: `60 seconds`
  pub maintenance_interval: Duration,
  /// Largest multicast payload accepted by [`send`](crate::tree::ScribeInstance::send).
  ///
  /// default: `1280`
  pub mtu: usize,
}
impl Default for TreeConfig {
  #[inline]
  fn default() -> Self {
    TreeConfig {
      reliable: false,
      maintenance: true,
      maintenance_interval: Duration::from_millis(60_000),
      mtu: 1280,
    }
  }
}
impl TreeConfig {
  /// Reliable delivery and no background maintenance.
  pub fn testing() -> Self {
    TreeConfig {
      reliable: true,
      maintenance: false,
      ..Default::default()
    }
  }
}
