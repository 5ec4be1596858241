use async_trait::async_trait;
use crossbeam::channel::{unbounded, Sender};
use scribe_overlay::core::{AckPolicy, Key, Message};
use scribe_overlay::overlay::{self, JoinState, Overlay, OverlayConfig, Upcalls};
use scribe_overlay::testkit::init_logging;
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const APP: u16 = 30;
const TIMEOUT: Duration = Duration::from_secs(10);

struct Recorder {
  me: Key,
  tx: Sender<(Key, Key)>,
}
#[async_trait]
impl Upcalls for Recorder {
  async fn deliver(&self, key: &Key, msg: Message) {
    if msg.kind == APP {
      let _ = self.tx.send((self.me, *key));
    }
  }
}

async fn start_ring(ports: &[u16]) -> Vec<Overlay> {
  let mut nodes: Vec<Overlay> = Vec::new();
  for port in ports {
    let node = Overlay::new(OverlayConfig::testing(*port)).await.unwrap();
    node.register(APP, AckPolicy::Required).unwrap();
    let boot = nodes.first().map(|n| n.local_addr());
    timeout(TIMEOUT, node.join(boot)).await.unwrap().unwrap();
    assert_eq!(node.join_state(), JoinState::Active);
    nodes.push(node);
  }
  nodes
}

/// Waits until every node has every other node in its leafset.
async fn converge(nodes: &[Overlay]) {
  let deadline = Instant::now() + TIMEOUT;
  loop {
    let done = nodes.iter().all(|n| {
      let known = n.neighbors(n.config().leafset_size);
      nodes
        .iter()
        .filter(|o| o.key() != n.key())
        .all(|o| known.iter().any(|h| h.key() == o.key()))
    });
    if done {
      return;
    }
    assert!(Instant::now() < deadline, "leafsets did not converge");
    sleep(Duration::from_millis(100)).await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_join() {
  init_logging(overlay::LOG_LEVEL);
  let a = Overlay::new(OverlayConfig::testing(5200)).await.unwrap();
  assert_eq!(a.join_state(), JoinState::Init);
  a.join(None).await.unwrap();
  assert_eq!(a.join_state(), JoinState::Active);

  let b = Overlay::new(OverlayConfig::testing(5201)).await.unwrap();
  timeout(TIMEOUT, b.join(Some(a.local_addr()))).await.unwrap().unwrap();
  assert_eq!(b.join_state(), JoinState::Active);
  assert!(b.neighbors(8).iter().any(|h| h.key() == a.key()));
  converge(&[a.clone(), b.clone()]).await;
  assert!(a.table_dump().contains(&b.key().to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routes_to_closest_node() {
  init_logging(overlay::LOG_LEVEL);
  let nodes = start_ring(&[5210, 5211, 5212, 5213, 5214]).await;
  converge(&nodes).await;

  let (tx, rx) = unbounded();
  let recorders = nodes
    .iter()
    .map(|n| {
      let r = Arc::new(Recorder { me: n.key(), tx: tx.clone() });
      let weak = Arc::downgrade(&r);
      let weak: Weak<dyn Upcalls> = weak;
      n.set_upcalls(weak);
      r
    })
    .collect::<Vec<_>>();

  for (i, name) in ["alpha", "beta", "gamma", "delta"].iter().enumerate() {
    let key = Key::hash(name.as_bytes());
    let closest = nodes
      .iter()
      .map(|n| n.key())
      .min_by_key(|k| (k.distance(&key), *k))
      .unwrap();
    let from = &nodes[i % nodes.len()];
    from.send(key, from.key(), 0, APP, name.as_bytes().to_vec()).await.unwrap();
    let (at, delivered) = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(delivered, key);
    assert_eq!(at, closest);
  }
  assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
  drop(recorders);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dead_node_is_evicted() {
  init_logging(overlay::LOG_LEVEL);
  let nodes = start_ring(&[5220, 5221, 5222]).await;
  converge(&nodes).await;
  let dead = nodes[2].key();
  nodes[2].shutdown();

  let deadline = Instant::now() + Duration::from_secs(15);
  loop {
    let gone = nodes[..2]
      .iter()
      .all(|n| n.neighbors(8).iter().all(|h| h.key() != dead));
    if gone {
      break;
    }
    assert!(Instant::now() < deadline, "dead node still in a leafset");
    sleep(Duration::from_millis(200)).await;
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_payload_is_rejected() {
  let node = Overlay::new(OverlayConfig::testing(5230)).await.unwrap();
  node.register(APP, AckPolicy::NoAck).unwrap();
  node.join(None).await.unwrap();
  let huge = vec![0u8; 70_000];
  assert!(node.send(node.key(), node.key(), 0, APP, huge).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recently_failed_joiner_is_refused_then_retries() {
  init_logging(overlay::LOG_LEVEL);
  let a = Overlay::new(OverlayConfig::testing(5240)).await.unwrap();
  a.register(APP, AckPolicy::Required).unwrap();
  a.join(None).await.unwrap();

  // Fail a send to the joiner's address before anything listens there.
  let b_addr: SocketAddrV4 = "127.0.0.1:5241".parse().unwrap();
  let stale = a.hosts().get(b_addr);
  let msg = Message::new(stale.key(), a.key(), 0, APP, b"early".to_vec());
  let delivery = a.send_direct(&stale, msg).await.unwrap().unwrap();
  assert!(!timeout(Duration::from_secs(3), delivery).await.unwrap().unwrap());
  let grace = a.config().grace_period;
  assert!(stale.failed_within(grace));

  let b = Overlay::new(OverlayConfig::testing(5241)).await.unwrap();
  assert_eq!(b.key(), stale.key());
  let started = Instant::now();
  timeout(TIMEOUT, b.join(Some(a.local_addr()))).await.unwrap().unwrap();
  // Refused once, then retried after the grace period and one more second.
  assert!(started.elapsed() >= grace + Duration::from_secs(1));
  assert_eq!(b.join_state(), JoinState::Active);
  assert!(b.neighbors(8).iter().any(|h| h.key() == a.key()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarding_hop_sends_its_row() {
  init_logging(overlay::LOG_LEVEL);
  let base = Key::hash(b"ring");
  let quarter = Key::new(Key::HALF.value() / 2);
  let at = |quarters: u128, extra: u128| {
    (0..quarters).fold(base, |k, _| k.add(&quarter)).add(&Key::new(extra))
  };
  let keyed = |port: u16, key: Key| {
    let mut config = OverlayConfig::testing(port);
    config.key = Some(key);
    config.leafset_size = 2;
    // No leafset exchange: hosts are only learned while joining.
    config.piggy_every = 0;
    config
  };
  let root = Overlay::new(keyed(5250, base)).await.unwrap();
  root.join(None).await.unwrap();
  let mut ring = vec![root.clone()];
  for (port, key) in [(5251, at(1, 1000)), (5252, at(2, 2000)), (5253, at(3, 3000))] {
    let node = Overlay::new(keyed(port, key)).await.unwrap();
    timeout(TIMEOUT, node.join(Some(root.local_addr()))).await.unwrap().unwrap();
    ring.push(node);
  }
  let far = ring[2].clone();
  let joiner_key = base.add(&Key::new(1));

  let deadline = Instant::now() + TIMEOUT;
  loop {
    let leafset = root.neighbors(2);
    let settled = [&ring[1], &ring[3]]
      .iter()
      .all(|n| leafset.iter().any(|h| h.key() == n.key()))
      && far.lookup(&joiner_key, 1)[0].key() != far.key();
    if settled {
      break;
    }
    assert!(Instant::now() < deadline, "ring did not settle");
    sleep(Duration::from_millis(100)).await;
  }

  // The far node only forwards the join; the root answers it.
  let joiner = Overlay::new(keyed(5254, joiner_key)).await.unwrap();
  timeout(TIMEOUT, joiner.join(Some(far.local_addr()))).await.unwrap().unwrap();
  let deadline = Instant::now() + TIMEOUT;
  loop {
    let learned = joiner
      .routing_table()
      .iter()
      .chain(joiner.neighbors(2).iter())
      .any(|h| h.key() == far.key());
    if learned {
      break;
    }
    assert!(Instant::now() < deadline, "joiner never learned the forwarding hop");
    sleep(Duration::from_millis(50)).await;
  }
  assert!(joiner.neighbors(2).iter().any(|h| h.key() == root.key()));
}
