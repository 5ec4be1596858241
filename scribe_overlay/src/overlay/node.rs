use crate::core::{
  lock, read, write, AckPolicy, BoxFuture, Delivery, Dispatcher, Handler, Host, HostRegistry,
  Key, Message, OverlayError, Reader, Transport, MAX_PAYLOAD,
};
use crate::overlay::{OverlayConfig, RoutingTable};
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const JOIN: u16 = 1;
pub const JOIN_ACK: u16 = 2;
pub const UPDATE: u16 = 3;
pub const PIGGY: u16 = 4;
pub const JOIN_NACK: u16 = 5;
pub const PING: u16 = 6;
/// Message types under this value belong to the overlay itself.
pub const RESERVED_KINDS: u16 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinState {
  Init,
  Joining,
  Active,
}

/// Hooks the layer above the overlay uses to watch and terminate routing.
#[async_trait]
pub trait Upcalls: Send + Sync {
  /// Runs on every node a routed message passes through, before it is sent
  /// on to `next_hop`. The message may be rewritten.
  async fn forward(&self, _key: &Key, _msg: &mut Message, _next_hop: &Arc<Host>) {}

  /// Runs on the node responsible for `key`.
  async fn deliver(&self, _key: &Key, _msg: Message) {}

  /// A host entered (`joined`) or left the leafset.
  fn updated(&self, _host: &Arc<Host>, _joined: bool) {}
}

/// A handle to one overlay node. Clones share the node.
///
/// The node stops when the last handle is dropped or on
/// [`shutdown`](Overlay::shutdown).
#[derive(Clone)]
pub struct Overlay {
  pub(in crate::overlay) state: Arc<OverlayState>,
}

pub(in crate::overlay) struct OverlayState {
  pub(in crate::overlay) me: Arc<Host>,
  pub(in crate::overlay) config: OverlayConfig,
  pub(in crate::overlay) hosts: HostRegistry,
  pub(in crate::overlay) table: Mutex<RoutingTable>,
  pub(in crate::overlay) transport: Arc<Transport>,
  pub(in crate::overlay) dispatch: Arc<Dispatcher>,
  upcalls: RwLock<Option<Weak<dyn Upcalls>>>,
  join_state: Mutex<JoinState>,
  join_signal: Mutex<Option<oneshot::Sender<()>>>,
  pub(in crate::overlay) bootstrap: Mutex<Option<Arc<Host>>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Overlay {
  /// Binds the socket and starts the receive loop, the retransmit sweep and
  /// the workers. Must run inside a multi-threaded tokio runtime.
  pub async fn new(config: OverlayConfig) -> Result<Overlay, OverlayError> {
    let dispatch = Arc::new(Dispatcher::new(config.queue_size));
    let transport = Arc::new(
      Transport::bind(
        SocketAddrV4::new(config.bind_address, config.port),
        dispatch.clone(),
        config.fail_map.clone(),
        config.retransmit_interval,
        config.max_retry,
      )
      .await?,
    );
    let addr = SocketAddrV4::new(config.address, transport.local_addr().port());
    let key = config.key.unwrap_or_else(|| Host::default_key(&addr));
    let me = Arc::new(Host::new(addr, key));
    let state = Arc::new(OverlayState {
      table: Mutex::new(RoutingTable::new(
        me.clone(),
        config.leafset_size,
        config.max_entry,
      )),
      hosts: HostRegistry::new(config.host_cache),
      me,
      transport: transport.clone(),
      dispatch: dispatch.clone(),
      upcalls: RwLock::new(None),
      join_state: Mutex::new(JoinState::Init),
      join_signal: Mutex::new(None),
      bootstrap: Mutex::new(None),
      tasks: Mutex::new(Vec::new()),
      config,
    });
    state.register_overlay_handlers()?;
    let mut tasks = dispatch.start(state.config.workers);
    tasks.push(tokio::spawn(transport.clone().run_receiver()));
    tasks.push(tokio::spawn(transport.run_retransmit()));
    lock(&state.tasks).extend(tasks);
    info!("Overlay node {} listening on {}", key, addr);
    Ok(Overlay { state })
  }

  pub fn me(&self) -> Arc<Host> {
    self.state.me.clone()
  }

  pub fn key(&self) -> Key {
    self.state.me.key()
  }

  pub fn local_addr(&self) -> SocketAddrV4 {
    self.state.me.addr()
  }

  pub fn config(&self) -> &OverlayConfig {
    &self.state.config
  }

  pub fn join_state(&self) -> JoinState {
    *lock(&self.state.join_state)
  }

  pub fn hosts(&self) -> &HostRegistry {
    &self.state.hosts
  }

  /// Joins the ring through `bootstrap`, or starts a new ring without one.
  /// Returns once the join has been acknowledged. There is no timeout.
  pub async fn join(&self, bootstrap: Option<SocketAddrV4>) -> Result<(), OverlayError> {
    let state = &self.state;
    let boot = match bootstrap {
      Some(addr) => state.hosts.get(addr),
      None => {
        info!("{} starting a new ring", state.me);
        state.become_active();
        return Ok(());
      }
    };
    let (tx, rx) = oneshot::channel();
    *lock(&state.join_signal) = Some(tx);
    *lock(&state.bootstrap) = Some(boot.clone());
    *lock(&state.join_state) = JoinState::Joining;
    state.send_join(&boot).await?;
    rx.await.map_err(|_| OverlayError::JoinAborted)
  }

  /// Resolves `name:port` to an IPv4 socket address.
  pub async fn resolve(&self, name: &str, port: u16) -> Result<SocketAddrV4, OverlayError> {
    self
      .state
      .hosts
      .resolve(name, port)
      .await
      .map(|h| h.addr())
      .map_err(|e| OverlayError::Resolve(format!("{}:{}: {}", name, port, e)))
  }

  /// Registers an application message type. Received messages of that type
  /// are routed toward their destination key.
  pub fn register(&self, kind: u16, ack: AckPolicy) -> Result<(), OverlayError> {
    if kind < RESERVED_KINDS {
      return Err(OverlayError::ReservedKind(kind));
    }
    let route = handler(&self.state, |state, msg| async move {
      let key = msg.dst;
      state.route(key, msg, None).await
    });
    self.state.dispatch.register(kind, ack, route)
  }

  pub fn set_upcalls(&self, upcalls: Weak<dyn Upcalls>) {
    *write(&self.state.upcalls) = Some(upcalls);
  }

  pub async fn route(&self, key: Key, msg: Message, hint: Option<Arc<Host>>) {
    self.state.route(key, msg, hint).await
  }

  /// Builds a message and routes it toward `dst`.
  pub async fn send(
    &self,
    dst: Key,
    src: Key,
    port: u16,
    kind: u16,
    payload: Vec<u8>,
  ) -> Result<(), OverlayError> {
    if payload.len() > MAX_PAYLOAD {
      return Err(OverlayError::PayloadTooLarge(payload.len()));
    }
    if self.state.dispatch.ack_policy(kind).is_none() {
      return Err(OverlayError::UnregisteredKind(kind));
    }
    self
      .state
      .route(dst, Message::new(dst, src, port, kind, payload), None)
      .await;
    Ok(())
  }

  /// Sends `msg` straight to `host` without routing. A message to ourselves
  /// goes directly to dispatch.
  pub async fn send_direct(
    &self,
    host: &Arc<Host>,
    msg: Message,
  ) -> Result<Delivery, OverlayError> {
    if host.key() == self.state.me.key() {
      self.state.dispatch.submit(msg).await;
      return Ok(None);
    }
    self.state.transport.send(host, &msg).await
  }

  pub fn neighbors(&self, count: usize) -> Vec<Arc<Host>> {
    lock(&self.state.table).neighbors(count)
  }

  pub fn routing_table(&self) -> Vec<Arc<Host>> {
    lock(&self.state.table).table()
  }

  pub fn lookup(&self, key: &Key, count: usize) -> Vec<Arc<Host>> {
    lock(&self.state.table).lookup(key, count)
  }

  /// Human-readable dump of the routing table and leafset.
  pub fn table_dump(&self) -> String {
    lock(&self.state.table).to_string()
  }

  /// Reliable sends still waiting on an ack.
  pub fn pending_sends(&self) -> usize {
    self.state.transport.in_flight()
  }

  /// Stops every background task. Handles stay usable but inert.
  pub fn shutdown(&self) {
    self.state.stop();
  }
}

/// Wraps an overlay method as a dispatch handler that holds the node weakly.
pub(in crate::overlay) fn handler<F, Fut>(state: &Arc<OverlayState>, f: F) -> Handler
where
  F: Fn(Arc<OverlayState>, Message) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let weak = Arc::downgrade(state);
  let f = Arc::new(f);
  Arc::new(move |msg: Message| -> BoxFuture {
    let weak = weak.clone();
    let f = f.clone();
    Box::pin(async move {
      if let Some(state) = weak.upgrade() {
        f(state, msg).await
      }
    })
  })
}

impl OverlayState {
  pub(in crate::overlay) fn upcalls(&self) -> Option<Arc<dyn Upcalls>> {
    read(&self.upcalls).as_ref().and_then(Weak::upgrade)
  }

  pub(in crate::overlay) fn notify_updated(&self, host: &Arc<Host>, joined: bool) {
    if let Some(up) = self.upcalls() {
      up.updated(host, joined);
    }
  }

  /// Inserts or removes `host` and tells the layer above if the leafset
  /// changed.
  pub(in crate::overlay) fn update_host(&self, host: &Arc<Host>, joining: bool) {
    let changed = lock(&self.table).update(host, joining);
    if changed {
      debug!("{} {} the leafset", host, if joining { "entered" } else { "left" });
      self.notify_updated(host, joining);
    }
  }

  pub(in crate::overlay) fn message_to(&self, host: &Arc<Host>, kind: u16, payload: Vec<u8>) -> Message {
    Message::new(host.key(), self.me.key(), 0, kind, payload)
  }

  /// Sends an overlay control message, logging instead of failing.
  pub(in crate::overlay) async fn send_control(
    &self,
    host: &Arc<Host>,
    kind: u16,
    payload: Vec<u8>,
  ) -> Delivery {
    let msg = self.message_to(host, kind, payload);
    match self.transport.send(host, &msg).await {
      Ok(d) => d,
      Err(e) => {
        warn!("Could not send type {} to {}: {}", kind, host, e);
        None
      }
    }
  }

  pub(in crate::overlay) async fn send_join(&self, boot: &Arc<Host>) -> Result<(), OverlayError> {
    info!("{} joining through {}", self.me, boot);
    let msg = Message::new(self.me.key(), self.me.key(), 0, JOIN, self.me.encode());
    self.transport.send(boot, &msg).await.map(|_| ())
  }

  pub(in crate::overlay) fn become_active(self: &Arc<Self>) {
    let started = {
      let mut st = lock(&self.join_state);
      let was = *st;
      *st = JoinState::Active;
      was != JoinState::Active
    };
    if started {
      let task = tokio::spawn(run_checks(Arc::downgrade(self), self.config.check_period));
      lock(&self.tasks).push(task);
    }
    if let Some(tx) = lock(&self.join_signal).take() {
      let _ = tx.send(());
    }
  }

  /// The next hop for `key`, or `None` when it belongs here.
  fn next_hop(&self, key: &Key, kind: u16) -> Option<Arc<Host>> {
    if *key == self.me.key() {
      return None;
    }
    let mut candidates = lock(&self.table).lookup(key, 2).into_iter();
    let first = candidates.next()?;
    // A joiner already in our table must not be handed its own join. With
    // nothing else closer, the join completes here.
    let pick = if kind == JOIN && first.key() == *key {
      candidates.next()
    } else {
      Some(first)
    };
    pick.filter(|h| h.key() != self.me.key())
  }

  pub(in crate::overlay) async fn route(self: &Arc<Self>, key: Key, msg: Message, hint: Option<Arc<Host>>) {
    self.route_attempt(key, msg, hint, 0).await
  }

  fn reroute(self: Arc<Self>, key: Key, msg: Message, attempt: usize) -> BoxFuture {
    Box::pin(async move { self.route_attempt(key, msg, None, attempt).await })
  }

  async fn route_attempt(
    self: &Arc<Self>,
    key: Key,
    mut msg: Message,
    hint: Option<Arc<Host>>,
    attempt: usize,
  ) {
    let next = match (self.next_hop(&key, msg.kind), hint) {
      (Some(_), Some(hint)) => Some(hint),
      (next, _) => next,
    };
    let host = match next {
      Some(host) => host,
      None => {
        let joiner = if msg.kind == JOIN {
          Some(msg.payload.clone())
        } else {
          None
        };
        if let Some(up) = self.upcalls() {
          up.deliver(&key, msg).await;
        }
        if let Some(payload) = joiner {
          self.join_complete(&payload).await;
        }
        return;
      }
    };
    // A reroute starts over from the message as it reached this node.
    let unforwarded = match self.dispatch.ack_policy(msg.kind) {
      Some(AckPolicy::Required) if attempt < self.config.max_reroutes => Some(msg.clone()),
      _ => None,
    };
    if let Some(up) = self.upcalls() {
      up.forward(&key, &mut msg, &host).await;
    }
    let delivery = match self.transport.send(&host, &msg).await {
      Ok(d) => d,
      Err(e) => {
        warn!("Dropping message of type {} for {}: {}", msg.kind, key, e);
        return;
      }
    };
    if msg.kind == JOIN {
      self.send_row_info(&msg).await;
    }
    if let (Some(rx), Some(original)) = (delivery, unforwarded) {
      let state = self.clone();
      tokio::spawn(async move {
        if let Ok(false) = rx.await {
          debug!("Send to {} failed, routing {} again", host, key);
          if host.success_avg() < state.config.bad_link {
            state.update_host(&host, false);
          }
          state.reroute(key, original, attempt + 1).await;
        }
      });
    }
  }

  /// Runs on the root for a joiner's key.
  async fn join_complete(&self, payload: &[u8]) {
    let joiner = match self.hosts.decode(&mut Reader::new(payload)) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding join with a bad host record: {}", e);
        return;
      }
    };
    if joiner.failed_within(self.config.grace_period) {
      info!("Refusing join from recently failed {}", joiner);
      self.send_control(&joiner, JOIN_NACK, self.me.encode()).await;
      return;
    }
    let mut payload = self.me.encode();
    let leafset = lock(&self.table).neighbors(self.config.leafset_size);
    for h in leafset.iter() {
      payload.extend(h.encode());
    }
    info!("Accepting join from {}", joiner);
    self.send_control(&joiner, JOIN_ACK, payload).await;
  }

  /// Sends the joiner the table row it shares with us.
  async fn send_row_info(&self, msg: &Message) {
    let joiner = match self.hosts.decode(&mut Reader::new(&msg.payload)) {
      Ok(h) => h,
      Err(e) => {
        warn!("Join carries a bad host record: {}", e);
        return;
      }
    };
    let row = lock(&self.table).row_lookup(&joiner.key());
    let payload = row.iter().flat_map(|h| h.encode()).collect::<Vec<_>>();
    self.send_control(&joiner, PIGGY, payload).await;
  }

  fn stop(&self) {
    self.dispatch.close();
    for task in lock(&self.tasks).drain(..) {
      task.abort();
    }
  }
}
impl Drop for OverlayState {
  fn drop(&mut self) {
    self.stop();
  }
}

pub(in crate::overlay) async fn run_checks(state: Weak<OverlayState>, period: std::time::Duration) {
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  ticker.tick().await;
  let mut cycle = 0u32;
  loop {
    ticker.tick().await;
    cycle = cycle.wrapping_add(1);
    match state.upgrade() {
      Some(state) => state.check(cycle).await,
      None => return,
    }
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_next_hop_skips_the_joiner() {
  let overlay = Overlay::new(OverlayConfig::testing(5400)).await.unwrap();
  overlay.join(None).await.unwrap();
  let state = &overlay.state;
  let joiner = state.hosts.get("127.0.0.1:5401".parse().unwrap());
  state.update_host(&joiner, true);
  // Only the joiner beats us, so its join ends here.
  assert!(state.next_hop(&joiner.key(), JOIN).is_none());
  let other = next_hop_key(state, &joiner.key(), PING);
  assert_eq!(other, Some(joiner.key()));

  // With a second candidate the join goes there instead.
  let second = state.hosts.get("127.0.0.1:5402".parse().unwrap());
  state.update_host(&second, true);
  let closer_than_me = second.key().distance(&joiner.key()) < overlay.key().distance(&joiner.key());
  let expected = if closer_than_me { Some(second.key()) } else { None };
  assert_eq!(next_hop_key(state, &joiner.key(), JOIN), expected);
  overlay.shutdown();
}

#[cfg(test)]
fn next_hop_key(state: &OverlayState, key: &Key, kind: u16) -> Option<Key> {
  state.next_hop(key, kind).map(|h| h.key())
}
