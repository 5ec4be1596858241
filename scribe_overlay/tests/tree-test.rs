use scribe_overlay::core::{
  encode_datagram, AckFlag, Host, Key, Message, NetworkHeader, SUCCESS_WINDOW,
};
use scribe_overlay::overlay::{Overlay, OverlayConfig, UPDATE};
use scribe_overlay::testkit::{init_logging, FailureConfig};
use scribe_overlay::tree::{self, Role, ScribeInstance, TreeConfig, TreeError, TreeEvent};
use std::net::{SocketAddrV4, UdpSocket};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);
const GROUP: &str = "scribe://chat";

struct Member {
  overlay: Overlay,
  tree: ScribeInstance,
  events: UnboundedReceiver<TreeEvent>,
}
impl Member {
  fn uri(&self) -> String {
    format!("scribe://{}", self.overlay.key())
  }
}

async fn start(ports: &[u16]) -> Vec<Member> {
  let mut members: Vec<Member> = Vec::new();
  for port in ports {
    let overlay = Overlay::new(OverlayConfig::testing(*port)).await.unwrap();
    let tree = ScribeInstance::new(overlay.clone(), TreeConfig::testing()).unwrap();
    let events = tree.subscribe();
    let boot = members.first().map(|m| m.overlay.local_addr());
    timeout(TIMEOUT, overlay.join(boot)).await.unwrap().unwrap();
    members.push(Member {
      overlay,
      tree,
      events,
    });
  }
  let deadline = Instant::now() + TIMEOUT;
  while !members.iter().all(|m| {
    let known = m.overlay.neighbors(8);
    members
      .iter()
      .filter(|o| o.overlay.key() != m.overlay.key())
      .all(|o| known.iter().any(|h| h.key() == o.overlay.key()))
  }) {
    assert!(Instant::now() < deadline, "leafsets did not converge");
    sleep(Duration::from_millis(100)).await;
  }
  members
}

/// Index of the node responsible for the group key.
fn root_of(members: &[Member], uri: &str) -> usize {
  let key = members[0].tree.group_key(uri).unwrap();
  (0..members.len())
    .min_by_key(|i| {
      let k: Key = members[*i].overlay.key();
      (k.distance(&key), k)
    })
    .unwrap()
}

async fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
  let deadline = Instant::now() + TIMEOUT;
  while !f() {
    assert!(Instant::now() < deadline, "timed out waiting for {}", what);
    sleep(Duration::from_millis(50)).await;
  }
}

/// The next multicast payload, skipping other events.
async fn next_received(events: &mut UnboundedReceiver<TreeEvent>, wait: Duration) -> Option<Vec<u8>> {
  let deadline = Instant::now() + wait;
  loop {
    let left = deadline.saturating_duration_since(Instant::now());
    match timeout(left, events.recv()).await {
      Ok(Some(TreeEvent::Received { uri, payload })) => {
        assert_eq!(uri, GROUP);
        return Some(payload);
      }
      Ok(Some(_)) => continue,
      Ok(None) | Err(_) => return None,
    }
  }
}

async fn join_all(members: &[Member], joiners: &[usize], root: usize) {
  for i in joiners {
    members[*i].tree.join(GROUP).await.unwrap();
  }
  let expected = joiners
    .iter()
    .filter(|i| **i != root)
    .map(|i| members[*i].uri())
    .collect::<Vec<_>>();
  wait_for("the root to adopt every joiner", || {
    let children = members[root].tree.children_set(GROUP);
    expected.iter().all(|c| children.contains(c))
  })
  .await;
  wait_for("every joiner to learn its parent", || {
    joiners
      .iter()
      .filter(|i| **i != root)
      .all(|i| members[*i].tree.parent_set(GROUP) == vec![members[root].uri()])
  })
  .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multicast_reaches_each_member_once() {
  init_logging(tree::LOG_LEVEL);
  let mut members = start(&[5300, 5301, 5302, 5303]).await;
  let root = root_of(&members, GROUP);

  members[0].tree.create(GROUP).await.unwrap();
  let deadline = Instant::now() + TIMEOUT;
  loop {
    let left = deadline.saturating_duration_since(Instant::now());
    match timeout(left, members[root].events.recv()).await.unwrap() {
      Some(TreeEvent::NewSource(uri)) => {
        assert_eq!(uri, GROUP);
        break;
      }
      Some(_) => continue,
      None => panic!("event stream closed"),
    }
  }

  let joiners = [1, 2, 3];
  join_all(&members, &joiners, root).await;
  for i in joiners.iter() {
    assert!(members[*i].tree.is_member(GROUP));
    let roles = members[*i].tree.group_set();
    assert!(roles.contains(&(GROUP.to_string(), Role::Listener)) || *i == root);
  }
  assert!(members[root].tree.designated_host(GROUP));

  for payload in [&b"first"[..], &b"second"[..]] {
    assert_eq!(members[0].tree.send(GROUP, payload).await.unwrap(), payload.len());
    for i in joiners.iter() {
      let got = next_received(&mut members[*i].events, Duration::from_secs(3)).await;
      assert_eq!(got.as_deref(), Some(payload));
    }
    sleep(Duration::from_millis(300)).await;
  }
  for m in members.iter_mut() {
    assert_eq!(next_received(&mut m.events, Duration::from_millis(300)).await, None);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leave_prunes_the_branch() {
  init_logging(tree::LOG_LEVEL);
  let mut members = start(&[5310, 5311, 5312]).await;
  let root = root_of(&members, GROUP);
  let joiners = (0..members.len()).filter(|i| *i != root).collect::<Vec<_>>();
  join_all(&members, &joiners, root).await;

  let (leaver, stayer) = (joiners[0], joiners[1]);
  members[leaver].tree.leave(GROUP).await.unwrap();
  assert!(!members[leaver].tree.is_member(GROUP));
  let leaver_uri = members[leaver].uri();
  wait_for("the root to drop the leaver", || {
    !members[root].tree.children_set(GROUP).contains(&leaver_uri)
  })
  .await;

  members[root].tree.send(GROUP, b"after").await.unwrap();
  let got = next_received(&mut members[stayer].events, Duration::from_secs(3)).await;
  assert_eq!(got.as_deref(), Some(&b"after"[..]));
  assert_eq!(
    next_received(&mut members[leaver].events, Duration::from_millis(500)).await,
    None
  );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_children_decay_and_rejoin() {
  init_logging(tree::LOG_LEVEL);
  let members = start(&[5320, 5321, 5322]).await;
  let root = root_of(&members, GROUP);
  let child = (root + 1) % members.len();
  join_all(&members, &[child], root).await;
  let child_uri = members[child].uri();

  members[root].tree.maintain().await;
  assert!(members[root].tree.children_set(GROUP).contains(&child_uri));
  members[root].tree.maintain().await;
  assert!(members[root].tree.children_set(GROUP).is_empty());
  assert!(!members[root].tree.designated_host(GROUP));

  members[child].tree.maintain().await;
  wait_for("the child to rejoin", || {
    members[root].tree.children_set(GROUP).contains(&child_uri)
  })
  .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_preconditions() {
  let overlay = Overlay::new(OverlayConfig::testing(5330)).await.unwrap();
  let tree = ScribeInstance::new(overlay.clone(), TreeConfig::testing()).unwrap();
  assert!(matches!(tree.send(GROUP, b"early").await, Err(TreeError::NotJoined)));
  overlay.join(None).await.unwrap();
  let big = vec![0u8; tree.config().mtu + 1];
  assert!(matches!(
    tree.send(GROUP, &big).await,
    Err(TreeError::PayloadTooLarge { .. })
  ));
  assert!(matches!(tree.join("chat").await, Err(TreeError::BadUri(_))));
  assert_eq!(tree.map(GROUP), GROUP);
  assert_eq!(tree.group_key(GROUP).unwrap(), Key::hash(b"chat"));
  assert_eq!(tree.group_key("ip://chat:5000").unwrap(), Key::hash(b"chat"));

  // A single node is the root of everything.
  let mut events = tree.subscribe();
  tree.join(GROUP).await.unwrap();
  tree.send(GROUP, b"solo").await.unwrap();
  assert_eq!(next_received(&mut events, Duration::from_secs(2)).await.as_deref(), Some(&b"solo"[..]));
  assert_eq!(tree.group_set(), vec![(GROUP.to_string(), Role::Listener)]);
  assert!(tree.children_set(GROUP).is_empty());
  assert!(tree.parent_set(GROUP).is_empty());
  assert!(!tree.designated_host(GROUP));
}

fn key_uri(key: Key) -> String {
  format!("scribe://{}", key)
}

async fn start_keyed(
  port: u16,
  key: Key,
  boot: Option<SocketAddrV4>,
  delayed: Option<SocketAddrV4>,
) -> Member {
  let mut config = OverlayConfig::testing(port);
  config.key = Some(key);
  config.leafset_size = 2;
  if let Some(addr) = delayed {
    config.fail_map.node_wide.insert(
      addr,
      FailureConfig {
        drop_prob: 0.0,
        delay: Some((Duration::from_millis(60), Duration::from_millis(60))),
      },
    );
  }
  let overlay = Overlay::new(config).await.unwrap();
  let tree = ScribeInstance::new(overlay.clone(), TreeConfig::testing()).unwrap();
  let events = tree.subscribe();
  timeout(TIMEOUT, overlay.join(boot)).await.unwrap().unwrap();
  Member {
    overlay,
    tree,
    events,
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interior_node_forwards_without_listening() {
  init_logging(tree::LOG_LEVEL);
  let group = Key::hash(b"chat");
  let root_addr: SocketAddrV4 = "127.0.0.1:5350".parse().unwrap();
  let root = start_keyed(5350, group, None, None).await;
  let inner = start_keyed(5351, group.add(&Key::new(1)), Some(root_addr), None).await;
  // The leaf reaches the root slowly, so its table prefers the inner node.
  let leaf_key = group.add(&Key::new(1 << 40));
  let mut leaf = start_keyed(5352, leaf_key, Some(root_addr), Some(root_addr)).await;
  let mut sender = start_keyed(5353, group.add(&Key::HALF), Some(root_addr), None).await;
  assert_eq!(root.tree.group_key(GROUP).unwrap(), group);

  wait_for("the leaf to route the group through the inner node", || {
    leaf.overlay.lookup(&group, 1)[0].key() == inner.overlay.key()
      && inner.overlay.lookup(&group, 1)[0].key() == root.overlay.key()
  })
  .await;
  assert!(leaf.overlay.key().prefix_length(&group) < inner.overlay.key().prefix_length(&group));

  leaf.tree.join(GROUP).await.unwrap();
  wait_for("the path to form", || {
    inner.tree.children_set(GROUP) == vec![leaf.uri()]
      && root.tree.children_set(GROUP) == vec![inner.uri()]
      && leaf.tree.parent_set(GROUP) == vec![inner.uri()]
      && inner.tree.parent_set(GROUP) == vec![root.uri()]
  })
  .await;
  assert!(!inner.tree.is_member(GROUP));
  assert!(inner.tree.designated_host(GROUP));
  assert!(inner.tree.group_set().contains(&(GROUP.to_string(), Role::Sender)));
  assert!(!root.tree.is_member(GROUP));

  sender.tree.send(GROUP, b"down the path").await.unwrap();
  let got = next_received(&mut leaf.events, Duration::from_secs(3)).await;
  assert_eq!(got.as_deref(), Some(&b"down the path"[..]));
  assert_eq!(next_received(&mut leaf.events, Duration::from_millis(500)).await, None);
  assert_eq!(next_received(&mut sender.events, Duration::from_millis(100)).await, None);

  // Leaving empties the inner node, which prunes itself from the root.
  leaf.tree.leave(GROUP).await.unwrap();
  wait_for("the branch to be pruned", || {
    inner.tree.children_set(GROUP).is_empty() && root.tree.children_set(GROUP).is_empty()
  })
  .await;
  assert!(!inner.tree.designated_host(GROUP));
  assert!(inner.tree.parent_set(GROUP).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rerouted_join_keeps_the_joiner() {
  init_logging(tree::LOG_LEVEL);
  let mut config = OverlayConfig::testing(5340);
  config.check_period = Duration::from_secs(60);
  let overlay = Overlay::new(config).await.unwrap();
  let tree = ScribeInstance::new(overlay.clone(), TreeConfig::testing()).unwrap();
  overlay.join(None).await.unwrap();
  let group = tree.group_key(GROUP).unwrap();
  let wire_addr: SocketAddrV4 = "127.0.0.1:5342".parse().unwrap();
  let wire = UdpSocket::bind(wire_addr).unwrap();
  let datagram = |msg: Message| {
    let header = NetworkHeader {
      flag: AckFlag::NoAck,
      seq: 0,
    };
    encode_datagram(header, Some(&msg))
  };

  // Nothing listens at the node that owns the group key.
  let dead: SocketAddrV4 = "127.0.0.1:5341".parse().unwrap();
  let update = Message::new(overlay.key(), group, 0, UPDATE, Host::new(dead, group).encode());
  wire.send_to(&datagram(update), overlay.local_addr()).unwrap();
  wait_for("the dead owner to be routed to", || {
    overlay.lookup(&group, 1)[0].addr() == dead
  })
  .await;
  let owner = overlay.hosts().get(dead);
  for _ in 0..SUCCESS_WINDOW {
    owner.update_stat(false);
  }

  let joiner = Host::new(wire_addr, Key::hash(b"joiner"));
  let mut payload = joiner.encode();
  payload.push(b':');
  payload.extend_from_slice(GROUP.as_bytes());
  payload.push(0);
  let join = Message::new(group, group, 0, tree::JOIN, payload);
  wire.send_to(&datagram(join), overlay.local_addr()).unwrap();

  wait_for("the dead owner to be evicted", || {
    overlay.lookup(&group, 1)[0].key() == overlay.key()
  })
  .await;
  sleep(Duration::from_millis(300)).await;
  assert!(!tree.is_member(GROUP));
  assert_eq!(tree.children_set(GROUP), vec![key_uri(joiner.key())]);
  assert_eq!(tree.group_set(), vec![(GROUP.to_string(), Role::Sender)]);
}
