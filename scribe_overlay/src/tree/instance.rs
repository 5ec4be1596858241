use crate::core::{lock, AckPolicy, DecodeError, Host, Key, Message, Reader};
use crate::overlay::{JoinState, Overlay, Upcalls};
use crate::tree::{
  GroupUri, Role, ScribeGroup, TreeConfig, TreeError, UriCache, CREATE, HEARTBEAT, JOIN, LEAVE,
  MULTICAST, PARENT, PING, REPLICATE, RP_REPLY, RP_REQUEST,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What subscribers of a [`ScribeInstance`] are told about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeEvent {
  /// This node became the root of a newly created group.
  NewSource(String),
  /// A child joined a group through this node.
  Joined(String),
  /// This node left a group.
  Left(String),
  /// A multicast reached this node as a listener.
  Received { uri: String, payload: Vec<u8> },
}

/// Acknowledgement policy of each tree message type.
pub fn ack_policy(kind: u16, reliable: bool) -> AckPolicy {
  match kind {
    CREATE | RP_REQUEST | RP_REPLY | REPLICATE | PARENT => AckPolicy::Required,
    _ => AckPolicy::reliable(reliable),
  }
}

/// A multicast group layer on top of an [`Overlay`]. Groups are trees rooted
/// at the node responsible for the group key.
///
/// Dropping the instance stops its maintenance loop. The overlay keeps
/// running, but tree messages it receives are no longer handled.
pub struct ScribeInstance {
  state: Arc<TreeState>,
}

struct TreeState {
  overlay: Overlay,
  me: Arc<Host>,
  config: TreeConfig,
  groups: Mutex<BTreeMap<Key, ScribeGroup>>,
  uris: Mutex<UriCache>,
  subscribers: Mutex<Vec<UnboundedSender<TreeEvent>>>,
  maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ScribeInstance {
  /// Registers the tree message types on `overlay` and takes over its
  /// upcalls. Must run inside a tokio runtime when maintenance is enabled.
  pub fn new(overlay: Overlay, config: TreeConfig) -> Result<ScribeInstance, TreeError> {
    for kind in [
      CREATE, JOIN, LEAVE, MULTICAST, PING, HEARTBEAT, RP_REQUEST, RP_REPLY, REPLICATE, PARENT,
    ] {
      overlay.register(kind, ack_policy(kind, config.reliable))?;
    }
    let state = Arc::new(TreeState {
      me: overlay.me(),
      overlay,
      groups: Mutex::new(BTreeMap::new()),
      uris: Mutex::new(UriCache::default()),
      subscribers: Mutex::new(Vec::new()),
      maintenance: Mutex::new(None),
      config,
    });
    let weak = Arc::downgrade(&state);
    let upcalls: Weak<dyn Upcalls> = weak;
    state.overlay.set_upcalls(upcalls);
    if state.config.maintenance {
      let task = tokio::spawn(run_maintenance(
        Arc::downgrade(&state),
        state.config.maintenance_interval,
      ));
      *lock(&state.maintenance) = Some(task);
    }
    Ok(ScribeInstance { state })
  }

  pub fn overlay(&self) -> &Overlay {
    &self.state.overlay
  }

  pub fn config(&self) -> &TreeConfig {
    &self.state.config
  }

  /// Every event emitted after this call.
  pub fn subscribe(&self) -> UnboundedReceiver<TreeEvent> {
    let (tx, rx) = unbounded_channel();
    lock(&self.state.subscribers).push(tx);
    rx
  }

  /// Group URIs are already in their network form.
  pub fn map(&self, uri: &str) -> String {
    uri.to_string()
  }

  /// The key a group URI maps to.
  pub fn group_key(&self, uri: &str) -> Result<Key, TreeError> {
    self.state.group_key(uri).map(|(k, _)| k)
  }

  /// Announces a group to its root.
  pub async fn create(&self, uri: &str) -> Result<(), TreeError> {
    let state = &self.state;
    let (key, port) = state.group_key(uri)?;
    let payload = name_payload(&state.me, uri);
    info!("Creating group {} ({})", uri, key);
    state.overlay.send(key, key, port, CREATE, payload).await?;
    Ok(())
  }

  /// Subscribes this node to a group.
  pub async fn join(&self, uri: &str) -> Result<(), TreeError> {
    self.state.join(uri).await
  }

  /// Unsubscribes this node from a group. Leaving a group this node is not
  /// in does nothing.
  pub async fn leave(&self, uri: &str) -> Result<(), TreeError> {
    let state = &self.state;
    let (key, port) = state.group_key(uri)?;
    let me = state.me.key();
    let (parent, prune) = {
      let mut groups = lock(&state.groups);
      let group = match groups.get_mut(&key) {
        Some(g) if g.has_child(&me) => g,
        _ => {
          debug!("Not a member of {}", uri);
          return Ok(());
        }
      };
      group.remove_child(&me);
      let prune = group.child_count() == 0;
      (if prune { group.parent.take() } else { None }, prune)
    };
    info!("Leaving group {}", uri);
    let payload = state.me.encode();
    match parent.filter(|p| p.key() != me) {
      Some(parent) => {
        let msg = Message::new(parent.key(), key, port, LEAVE, payload);
        state.overlay.send_direct(&parent, msg).await?;
      }
      None if prune => state.overlay.send(key, key, port, LEAVE, payload).await?,
      None => {}
    }
    state.emit(TreeEvent::Left(uri.to_string()));
    Ok(())
  }

  /// Multicasts `payload` to every member of a group. The payload first goes
  /// to the group's rendezvous point, which is looked up on first use.
  /// Returns the number of payload bytes sent.
  pub async fn send(&self, uri: &str, payload: &[u8]) -> Result<usize, TreeError> {
    let state = &self.state;
    if payload.len() > state.config.mtu {
      return Err(TreeError::PayloadTooLarge {
        len: payload.len(),
        mtu: state.config.mtu,
      });
    }
    if state.overlay.join_state() != JoinState::Active {
      return Err(TreeError::NotJoined);
    }
    let (key, port) = state.group_key(uri)?;
    let rp = {
      let mut groups = lock(&state.groups);
      let group = groups
        .entry(key)
        .or_insert_with(|| ScribeGroup::new(key, uri.to_string()));
      group.rp.clone()
    };
    match rp {
      Some(rp) if rp.key() == state.me.key() => {
        let msg = Message::new(rp.key(), key, port, MULTICAST, payload.to_vec());
        state.deliver_multicast(msg).await;
      }
      Some(rp) => {
        let msg = Message::new(rp.key(), key, port, MULTICAST, payload.to_vec());
        state.overlay.send_direct(&rp, msg).await?;
      }
      None => {
        let ask = state.me.encode();
        state.overlay.send(key, key, port, RP_REQUEST, ask).await?;
        state
          .overlay
          .send(key, key, port, MULTICAST, payload.to_vec())
          .await?;
      }
    }
    Ok(payload.len())
  }

  /// One maintenance round: decays children, drops empty groups and rejoins
  /// every group this node listens to.
  pub async fn maintain(&self) {
    self.state.maintain().await
  }

  /// URIs of the overlay leafset members.
  pub fn neighbor_set(&self) -> Vec<String> {
    let size = self.state.overlay.config().leafset_size;
    self
      .state
      .overlay
      .neighbors(size)
      .iter()
      .map(|h| host_uri(h))
      .collect()
  }

  /// Every group this node knows, with its role in it.
  pub fn group_set(&self) -> Vec<(String, Role)> {
    let me = self.state.me.key();
    let groups = lock(&self.state.groups);
    groups
      .values()
      .filter(|g| !g.uri.is_empty())
      .map(|g| (g.uri.clone(), g.role(&me)))
      .collect()
  }

  pub fn parent_set(&self, uri: &str) -> Vec<String> {
    self
      .with_group(uri, |g, _| g.parent.iter().map(|p| host_uri(p)).collect::<Vec<_>>())
      .unwrap_or_default()
  }

  /// The children of a group, not counting this node.
  pub fn children_set(&self, uri: &str) -> Vec<String> {
    self
      .with_group(uri, |g, me| {
        g.children()
          .filter(|c| c.host.key() != *me)
          .map(|c| host_uri(&c.host))
          .collect::<Vec<_>>()
      })
      .unwrap_or_default()
  }

  /// Whether this node forwards the group's traffic to another node.
  pub fn designated_host(&self, uri: &str) -> bool {
    self
      .with_group(uri, |g, me| g.designated(me))
      .unwrap_or(false)
  }

  /// Whether this node is a member of the group.
  pub fn is_member(&self, uri: &str) -> bool {
    self
      .with_group(uri, |g, me| g.has_child(me))
      .unwrap_or(false)
  }

  fn with_group<T>(&self, uri: &str, f: impl FnOnce(&ScribeGroup, &Key) -> T) -> Option<T> {
    let (key, _) = self.state.group_key(uri).ok()?;
    let groups = lock(&self.state.groups);
    groups.get(&key).map(|g| f(g, &self.state.me.key()))
  }
}
impl Drop for ScribeInstance {
  fn drop(&mut self) {
    if let Some(task) = lock(&self.state.maintenance).take() {
      task.abort();
    }
  }
}

fn host_uri(host: &Host) -> String {
  format!("scribe://{}", host.key())
}

/// `host ':' uri '\0'`
fn name_payload(host: &Host, uri: &str) -> Vec<u8> {
  let mut payload = host.encode();
  payload.push(b':');
  payload.extend_from_slice(uri.as_bytes());
  payload.push(0);
  payload
}

impl TreeState {
  fn group_key(&self, uri: &str) -> Result<(Key, u16), TreeError> {
    let parsed = GroupUri::parse(uri)?;
    let key = lock(&self.uris).key_of(&parsed);
    Ok((key, parsed.port))
  }

  fn emit(&self, event: TreeEvent) {
    debug!("Tree event {:?}", event);
    lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
  }

  fn label(&self, key: &Key) -> String {
    let groups = lock(&self.groups);
    match groups.get(key) {
      Some(g) if !g.uri.is_empty() => g.uri.clone(),
      _ => format!("scribe://{}", key),
    }
  }

  fn decode_name(&self, payload: &[u8]) -> Result<(Arc<Host>, Option<String>), DecodeError> {
    let mut r = Reader::new(payload);
    let host = self.overlay.hosts().decode(&mut r)?;
    if r.is_empty() {
      return Ok((host, None));
    }
    if r.read_u8("separator")? != b':' {
      return Err(DecodeError::BadSeparator);
    }
    let rest = r.rest();
    let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
    let name = std::str::from_utf8(&rest[..end]).map_err(|_| DecodeError::BadName)?;
    Ok((host, Some(name.to_string()).filter(|n| !n.is_empty())))
  }

  /// The URI of a group as far as this node knows it. Empty when unknown.
  fn resolve_uri(&self, key: &Key, port: u16, name: Option<String>) -> String {
    let mut uris = lock(&self.uris);
    let known = uris.uri_of(key, port);
    match name {
      Some(name) => {
        if let Ok(uri) = GroupUri::parse(&name) {
          uris.key_of(&uri);
        }
        known.unwrap_or(name)
      }
      None => known.unwrap_or_default(),
    }
  }

  async fn join(&self, uri: &str) -> Result<(), TreeError> {
    let (key, port) = self.group_key(uri)?;
    lock(&self.groups)
      .entry(key)
      .or_insert_with(|| ScribeGroup::new(key, uri.to_string()))
      .add_child(self.me.clone());
    debug!("Joining group {}", uri);
    let payload = name_payload(&self.me, uri);
    self.overlay.send(key, key, port, JOIN, payload).await?;
    Ok(())
  }

  async fn maintain(&self) {
    let me = self.me.key();
    let rejoin = {
      let mut groups = lock(&self.groups);
      let mut rejoin = Vec::new();
      for group in groups.values_mut() {
        if group.decay(&me) && !group.uri.is_empty() {
          rejoin.push(group.uri.clone());
        }
      }
      groups.retain(|_, g| !g.is_tombstone());
      rejoin
    };
    trace!("Maintenance rejoining {} groups", rejoin.len());
    for uri in rejoin {
      if let Err(e) = self.join(&uri).await {
        warn!("Rejoin of {} failed: {}", uri, e);
      }
    }
  }

  /// Adds `child` to a group and tells it about its new parent.
  async fn adopt(&self, group: Key, port: u16, child: Arc<Host>, uri: String) {
    let me = self.me.key();
    {
      let mut groups = lock(&self.groups);
      // Only join() makes this node a member of its own group.
      if child.key() == me && !groups.get(&group).map_or(false, |g| g.has_child(&me)) {
        debug!("Ignoring join for {} naming this node", group);
        return;
      }
      let g = groups
        .entry(group)
        .or_insert_with(|| ScribeGroup::new(group, uri.clone()));
      if g.uri.is_empty() {
        g.uri = uri;
      }
      g.add_child(child.clone());
    }
    if child.key() != me {
      let msg = Message::new(child.key(), group, port, PARENT, self.me.encode());
      if let Err(e) = self.overlay.send_direct(&child, msg).await {
        warn!("Could not tell {} about its parent: {}", child, e);
      }
    }
  }

  async fn forward_join(&self, msg: &mut Message) {
    let (child, name) = match self.decode_name(&msg.payload) {
      Ok(x) => x,
      Err(e) => {
        warn!("Forwarding join with a bad payload: {}", e);
        return;
      }
    };
    let uri = self.resolve_uri(&msg.src, msg.port, name);
    self.adopt(msg.src, msg.port, child, uri).await;
    // The next hop adopts this node, not the joiner.
    let mut payload = self.me.encode();
    let head = payload.len();
    payload.extend_from_slice(&msg.payload[head..]);
    msg.payload = payload;
    // TODO: stop the join here when this node was already in the tree, once
    // rejoins carry enough state to refresh the path above it.
    self.emit(TreeEvent::Joined(self.label(&msg.src)));
  }

  async fn deliver_create(&self, msg: Message) {
    let (_, name) = match self.decode_name(&msg.payload) {
      Ok(x) => x,
      Err(e) => {
        warn!("Discarding create for {}: {}", msg.src, e);
        return;
      }
    };
    let uri = self.resolve_uri(&msg.src, 0, name);
    if uri.is_empty() {
      warn!("Discarding create for unnamed group {}", msg.src);
      return;
    }
    info!("Root of new group {}", uri);
    lock(&self.groups)
      .entry(msg.src)
      .or_insert_with(|| ScribeGroup::new(msg.src, uri.clone()));
    self.emit(TreeEvent::NewSource(uri));
  }

  async fn deliver_join(&self, msg: Message) {
    let (child, name) = match self.decode_name(&msg.payload) {
      Ok(x) => x,
      Err(e) => {
        warn!("Discarding join for {}: {}", msg.src, e);
        return;
      }
    };
    let uri = self.resolve_uri(&msg.src, msg.port, name);
    debug!("{} joined {} at the root", child, msg.src);
    self.adopt(msg.src, msg.port, child, uri).await;
    self.emit(TreeEvent::Joined(self.label(&msg.src)));
  }

  async fn deliver_leave(&self, msg: Message) {
    let child = match self.overlay.hosts().decode(&mut Reader::new(&msg.payload)) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding leave for {}: {}", msg.src, e);
        return;
      }
    };
    let parent = {
      let mut groups = lock(&self.groups);
      let group = match groups.get_mut(&msg.src) {
        Some(g) => g,
        None => {
          debug!("Leave for unknown group {}", msg.src);
          return;
        }
      };
      group.remove_child(&child.key());
      if group.child_count() == 0 {
        group.parent.take()
      } else {
        None
      }
    };
    debug!("{} left {}", child, msg.src);
    if let Some(parent) = parent.filter(|p| p.key() != self.me.key()) {
      let fwd = Message::new(parent.key(), msg.src, msg.port, LEAVE, self.me.encode());
      if let Err(e) = self.overlay.send_direct(&parent, fwd).await {
        warn!("Could not pass leave on to {}: {}", parent, e);
      }
    }
  }

  async fn deliver_parent(&self, msg: Message) {
    let parent = match self.overlay.hosts().decode(&mut Reader::new(&msg.payload)) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding parent for {}: {}", msg.src, e);
        return;
      }
    };
    if parent.key() == self.me.key() {
      return;
    }
    match lock(&self.groups).get_mut(&msg.src) {
      Some(g) => g.parent = Some(parent),
      None => debug!("Parent {} for unknown group {}", parent, msg.src),
    }
  }

  async fn deliver_rp_request(&self, msg: Message) {
    let asker = match self.overlay.hosts().decode(&mut Reader::new(&msg.payload)) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding RP request for {}: {}", msg.src, e);
        return;
      }
    };
    let reply = Message::new(asker.key(), msg.src, msg.port, RP_REPLY, self.me.encode());
    if let Err(e) = self.overlay.send_direct(&asker, reply).await {
      warn!("Could not answer RP request from {}: {}", asker, e);
    }
  }

  async fn deliver_rp_reply(&self, msg: Message) {
    let rp = match self.overlay.hosts().decode(&mut Reader::new(&msg.payload)) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding RP reply for {}: {}", msg.src, e);
        return;
      }
    };
    debug!("RP of {} is {}", msg.src, rp);
    let uri = self.resolve_uri(&msg.src, 0, None);
    lock(&self.groups)
      .entry(msg.src)
      .or_insert_with(|| ScribeGroup::new(msg.src, uri))
      .rp = Some(rp);
  }

  /// Passes a multicast down the tree, keeping a copy if this node listens.
  async fn deliver_multicast(&self, msg: Message) {
    if msg.payload.is_empty() {
      trace!("Empty multicast on {}", msg.src);
      return;
    }
    let me = self.me.key();
    let children = {
      let groups = lock(&self.groups);
      match groups.get(&msg.src) {
        Some(g) => g.children().map(|c| c.host.clone()).collect::<Vec<_>>(),
        None => {
          debug!("Multicast for unknown group {}", msg.src);
          return;
        }
      }
    };
    for child in children {
      if child.key() == me {
        self.emit(TreeEvent::Received {
          uri: self.label(&msg.src),
          payload: msg.payload.clone(),
        });
        continue;
      }
      let copy = Message::new(child.key(), msg.src, msg.port, MULTICAST, msg.payload.clone());
      if let Err(e) = self.overlay.send_direct(&child, copy).await {
        warn!("Multicast to {} failed: {}", child, e);
      }
    }
  }
}

#[async_trait]
impl Upcalls for TreeState {
  async fn forward(&self, _key: &Key, msg: &mut Message, _next_hop: &Arc<Host>) {
    if msg.kind == JOIN {
      self.forward_join(msg).await;
    }
  }

  async fn deliver(&self, _key: &Key, msg: Message) {
    match msg.kind {
      CREATE => self.deliver_create(msg).await,
      JOIN => self.deliver_join(msg).await,
      LEAVE => self.deliver_leave(msg).await,
      MULTICAST => self.deliver_multicast(msg).await,
      PARENT => self.deliver_parent(msg).await,
      RP_REQUEST => self.deliver_rp_request(msg).await,
      RP_REPLY => self.deliver_rp_reply(msg).await,
      PING | HEARTBEAT | REPLICATE => trace!("Ignoring tree message type {}", msg.kind),
      kind => trace!("Delivered foreign message type {}", kind),
    }
  }

  fn updated(&self, host: &Arc<Host>, joined: bool) {
    trace!("Leafset {} {}", if joined { "gained" } else { "lost" }, host);
  }
}

async fn run_maintenance(state: Weak<TreeState>, period: Duration) {
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  ticker.tick().await;
  loop {
    ticker.tick().await;
    match state.upgrade() {
      Some(state) => state.maintain().await,
      None => return,
    }
  }
}

#[test]
fn test_ack_policies() {
  assert_eq!(ack_policy(CREATE, false), AckPolicy::Required);
  assert_eq!(ack_policy(PARENT, false), AckPolicy::Required);
  assert_eq!(ack_policy(RP_REQUEST, false), AckPolicy::Required);
  assert_eq!(ack_policy(MULTICAST, false), AckPolicy::NoAck);
  assert_eq!(ack_policy(JOIN, true), AckPolicy::Required);
  assert_eq!(ack_policy(HEARTBEAT, false), AckPolicy::NoAck);
}

#[test]
fn test_name_payload() {
  let addr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 9100);
  let host = Host::new(addr, Host::default_key(&addr));
  let payload = name_payload(&host, "scribe://G");
  assert_eq!(payload.len(), 18 + 1 + "scribe://G".len() + 1);
  assert_eq!(payload[18], b':');
  assert_eq!(payload.last(), Some(&0));
}
