use crate::core::Key;
use crate::testkit::FailureConfigMap;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Port the binaries use when none is given.
pub const DEFAULT_PORT: u16 = 16783;

/// Configures an [`Overlay`](crate::overlay::Overlay).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayConfig {
  /// The address other nodes reach this node at. Together with the bound port it determines the
  /// node's key unless [`key`](#structfield.key) is set.
  ///
  /// default: `127.0.0.1`
  pub address: Ipv4Addr,
  /// The address the UDP socket binds to.
  ///
  /// default: `0.0.0.0`
  pub bind_address: Ipv4Addr,
  /// The UDP port. `0` lets the OS pick one.
  ///
  /// default: `16783`
  pub port: u16,
  /// Overrides the key derived from `address:port`.
  ///
  /// default: `None`
  pub key: Option<Key>,
  /// Total leafset size, split evenly between both sides of the local key.
  ///
  /// default: `8`
  pub leafset_size: usize,
  /// Hosts kept per routing table cell.
  ///
  /// default: `3`
  pub max_entry: usize,
  /// How long a reliable send waits for its ack before it is retransmitted. The retransmit sweep
  /// runs at the same period.
  ///
  /// default: `1 second`
  pub retransmit_interval: Duration,
  /// Retransmissions after the first send before a reliable send is given up on.
  ///
  /// default: `3`
  pub max_retry: u32,
  /// Period of the liveness check that pings the leafset and the routing table.
  ///
  /// default: `20 seconds`
  pub check_period: Duration,
  /// Every this many liveness checks, leafsets are exchanged with the leafset members.
  ///
  /// default: `3`
  pub piggy_every: u32,
  /// A host that failed more recently than this is refused as a joiner and ignored in
  /// piggy-backed tables.
  ///
  /// default: `30 seconds`
  pub grace_period: Duration,
  /// Success average under which a host is evicted from the routing structures.
  ///
  /// default: `0.3`
  pub bad_link: f64,
  /// How many times a routed message whose send failed is routed again.
  ///
  /// default: `3`
  pub max_reroutes: usize,
  /// Number of workers running message handlers.
  ///
  /// default: `num_cpus::get()`
  pub workers: usize,
  /// Capacity of the job queue in front of the workers.
  ///
  /// default: `1024`
  pub queue_size: usize,
  /// Hosts cached by address before unreferenced ones are evicted.
  ///
  /// default: `64`
  pub host_cache: usize,
  /// Faults injected into outbound datagrams.
  ///
  /// default: `FailureConfigMap::from_env()`
  pub fail_map: FailureConfigMap,
}
impl Default for OverlayConfig {
  #[inline]
  fn default() -> Self {
    OverlayConfig {
      address: Ipv4Addr::LOCALHOST,
      bind_address: Ipv4Addr::UNSPECIFIED,
      port: DEFAULT_PORT,
      key: None,
      leafset_size: 8,
      max_entry: 3,
      retransmit_interval: Duration::from_millis(1000),
      max_retry: 3,
      check_period: Duration::from_millis(20_000),
      piggy_every: 3,
      grace_period: Duration::from_millis(30_000),
      bad_link: 0.3,
      max_reroutes: 3,
      workers: num_cpus::get(),
      queue_size: 1024,
      host_cache: 64,
      fail_map: FailureConfigMap::from_env(),
    }
  }
}
impl OverlayConfig {
  /// A loopback node on `port` with short timers and no injected faults.
  pub fn testing(port: u16) -> Self {
    OverlayConfig {
      address: Ipv4Addr::LOCALHOST,
      bind_address: Ipv4Addr::LOCALHOST,
      port,
      retransmit_interval: Duration::from_millis(100),
      check_period: Duration::from_millis(500),
      grace_period: Duration::from_millis(1000),
      workers: 2,
      fail_map: FailureConfigMap::default(),
      ..Default::default()
    }
  }
}
