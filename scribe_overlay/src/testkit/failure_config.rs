use im::HashMap;
use once_cell::sync::Lazy;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::env::var;
use std::net::SocketAddrV4;
use std::time::Duration;

static PACKET_DROP: Lazy<f64> = Lazy::new(|| {
  var("SCRIBE_PACKET_DROP")
    .map(|x| x.parse().ok())
    .ok()
    .flatten()
    .unwrap_or(0.0)
});

static DELAY: Lazy<Option<(Duration, Duration)>> = Lazy::new(|| {
  var("SCRIBE_MIN_DELAY")
    .map(|x| x.parse().ok().map(Duration::from_millis))
    .ok()
    .flatten()
    .zip(
      var("SCRIBE_MAX_DELAY")
        .map(|x| x.parse().ok().map(Duration::from_millis))
        .ok()
        .flatten(),
    )
    .filter(|(x, y)| x <= y)
});

/// Faults injected into outbound datagrams toward one destination.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  /// Probability in `[0, 1]` that a datagram is silently dropped.
  pub drop_prob: f64,
  /// Inclusive range a per-datagram delay is drawn from.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub fn drops(&self) -> bool {
    self.drop_prob > 0.0 && rand::random::<f64>() < self.drop_prob
  }

  pub fn sample_delay(&self) -> Option<Duration> {
    self.delay.map(|(min, max)| {
      let range = min.as_millis()..=max.as_millis();
      Duration::from_millis(SmallRng::from_entropy().gen_range(range) as u64)
    })
  }
}

/// Per-destination fault settings with a fallback for everyone else.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<SocketAddrV4, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, addr: &SocketAddrV4) -> &FailureConfig {
    self.node_wide.get(addr).unwrap_or(&self.cluster_wide)
  }

  /// Cluster-wide faults from `SCRIBE_PACKET_DROP`, `SCRIBE_MIN_DELAY` and
  /// `SCRIBE_MAX_DELAY` (milliseconds).
  pub fn from_env() -> FailureConfigMap {
    FailureConfigMap {
      cluster_wide: FailureConfig {
        drop_prob: *PACKET_DROP,
        delay: *DELAY,
      },
      node_wide: HashMap::new(),
    }
  }

  pub fn is_clean(&self) -> bool {
    let clean = |c: &FailureConfig| c.drop_prob <= 0.0 && c.delay.is_none();
    clean(&self.cluster_wide) && self.node_wide.values().all(clean)
  }
}

#[test]
fn test_failure_config_map() {
  let target: SocketAddrV4 = "127.0.0.1:4100".parse().unwrap();
  let mut map = FailureConfigMap::default();
  assert!(map.is_clean());
  assert!(!map.get(&target).drops());
  map.node_wide.insert(
    target,
    FailureConfig {
      drop_prob: 1.0,
      delay: Some((Duration::from_millis(5), Duration::from_millis(10))),
    },
  );
  assert!(!map.is_clean());
  assert!(map.get(&target).drops());
  let d = map.get(&target).sample_delay().unwrap();
  assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(10));
  assert!(!map.get(&"127.0.0.1:4101".parse().unwrap()).drops());
}
