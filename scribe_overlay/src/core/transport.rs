use crate::core::{
  encode_datagram, lock, AckFlag, AckPolicy, Dispatcher, Host, Message, NetworkHeader,
  OverlayError, Reader, MAX_DATAGRAM, MAX_PAYLOAD,
};
use crate::testkit::FailureConfigMap;
use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Outcome of a send. Reliable sends resolve `true` once acknowledged and
/// `false` once the retry budget is spent. Unreliable sends carry nothing.
pub type Delivery = Option<oneshot::Receiver<bool>>;

struct AckEntry {
  acked_at: Option<Instant>,
}

struct PendingSend {
  host: Arc<Host>,
  bytes: Arc<Vec<u8>>,
  seq: u32,
  retries: u32,
  sent_at: Instant,
  outcome: Option<oneshot::Sender<bool>>,
}
impl PendingSend {
  // Taking the sender makes a second resolution a no-op.
  fn resolve(&mut self, delivered: bool) {
    if let Some(tx) = self.outcome.take() {
      let _ = tx.send(delivered);
    }
  }
}

#[derive(Default)]
struct Pending {
  next_seq: u32,
  waiting: HashMap<u32, AckEntry>,
  queue: BTreeMap<(Instant, u32), PendingSend>,
}

/// Acknowledged datagram delivery over one UDP socket.
///
/// Every datagram carries a `NetworkHeader`. Reliable sends stay in a
/// time-ordered queue until the sweep sees them acknowledged or out of
/// retries.
pub struct Transport {
  socket: Arc<UdpSocket>,
  local: SocketAddrV4,
  pending: Mutex<Pending>,
  dispatch: Arc<Dispatcher>,
  fail_map: FailureConfigMap,
  retransmit_interval: Duration,
  max_retry: u32,
}
impl Transport {
  pub async fn bind(
    addr: SocketAddrV4,
    dispatch: Arc<Dispatcher>,
    fail_map: FailureConfigMap,
    retransmit_interval: Duration,
    max_retry: u32,
  ) -> Result<Transport, OverlayError> {
    let socket = UdpSocket::bind(addr).await.map_err(OverlayError::Bind)?;
    let local = match socket.local_addr().map_err(OverlayError::Bind)? {
      SocketAddr::V4(v4) => v4,
      SocketAddr::V6(v6) => return Err(OverlayError::Resolve(v6.to_string())),
    };
    Ok(Transport {
      socket: Arc::new(socket),
      local,
      pending: Mutex::new(Pending::default()),
      dispatch,
      fail_map,
      retransmit_interval,
      max_retry,
    })
  }

  pub fn local_addr(&self) -> SocketAddrV4 {
    self.local
  }

  /// Reliable sends not yet acknowledged or given up on.
  pub fn in_flight(&self) -> usize {
    lock(&self.pending).queue.len()
  }

  /// Sends `msg` to `host` with the ack policy registered for its type.
  pub async fn send(&self, host: &Arc<Host>, msg: &Message) -> Result<Delivery, OverlayError> {
    if msg.payload.len() > MAX_PAYLOAD {
      return Err(OverlayError::PayloadTooLarge(msg.payload.len()));
    }
    let ack = self
      .dispatch
      .ack_policy(msg.kind)
      .ok_or(OverlayError::UnregisteredKind(msg.kind))?;
    let (bytes, delivery) = {
      let mut pending = lock(&self.pending);
      let seq = pending.next_seq;
      pending.next_seq = seq.wrapping_add(1);
      let header = NetworkHeader {
        flag: ack.flag(),
        seq,
      };
      let bytes = Arc::new(encode_datagram(header, Some(msg)));
      let delivery = match ack {
        AckPolicy::NoAck => None,
        AckPolicy::Required => {
          let (tx, rx) = oneshot::channel();
          let now = Instant::now();
          pending.waiting.insert(seq, AckEntry { acked_at: None });
          pending.queue.insert(
            (now + self.retransmit_interval, seq),
            PendingSend {
              host: host.clone(),
              bytes: bytes.clone(),
              seq,
              retries: 0,
              sent_at: now,
              outcome: Some(tx),
            },
          );
          Some(rx)
        }
      };
      (bytes, delivery)
    };
    trace!("Sending type {} to {} ({} bytes)", msg.kind, host, bytes.len());
    self.transmit(host.addr(), bytes).await;
    Ok(delivery)
  }

  async fn transmit(&self, addr: SocketAddrV4, bytes: Arc<Vec<u8>>) {
    let fail_cfg = self.fail_map.get(&addr);
    if fail_cfg.drops() {
      trace!("Injected drop of {} bytes to {}", bytes.len(), addr);
      return;
    }
    if let Some(delay) = fail_cfg.sample_delay() {
      let socket = self.socket.clone();
      tokio::spawn(async move {
        sleep(delay).await;
        if let Err(e) = socket.send_to(&bytes, addr).await {
          warn!("Delayed send to {} failed: {}", addr, e);
        }
      });
      return;
    }
    if let Err(e) = self.socket.send_to(&bytes, addr).await {
      // The retransmit sweep covers reliable sends.
      warn!("Send to {} failed: {}", addr, e);
    }
  }

  pub(crate) async fn run_receiver(self: Arc<Self>) {
    debug!("Receiving on {}", self.local);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
      let (len, from) = match self.socket.recv_from(&mut buf).await {
        Ok(x) => x,
        Err(e) => {
          warn!("Receive on {} failed: {}", self.local, e);
          continue;
        }
      };
      self.handle_datagram(&buf[..len], from).await;
    }
  }

  async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
    let mut r = Reader::new(data);
    let header = match NetworkHeader::take(&mut r) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding datagram from {}: {}", from, e);
        return;
      }
    };
    match header.flag {
      AckFlag::Ack => self.acked(header.seq),
      AckFlag::Required => {
        if let SocketAddr::V4(v4) = from {
          let ack = NetworkHeader {
            flag: AckFlag::Ack,
            seq: header.seq,
          };
          self.transmit(v4, Arc::new(encode_datagram(ack, None))).await;
        }
        self.deliver(&mut r, from).await;
      }
      AckFlag::NoAck => self.deliver(&mut r, from).await,
    }
  }

  async fn deliver(&self, r: &mut Reader<'_>, from: SocketAddr) {
    match Message::take(r) {
      Ok(msg) => self.dispatch.submit(msg).await,
      Err(e) => warn!("Discarding message from {}: {}", from, e),
    }
  }

  fn acked(&self, seq: u32) {
    let mut pending = lock(&self.pending);
    match pending.waiting.get_mut(&seq) {
      Some(entry) => {
        if entry.acked_at.is_none() {
          entry.acked_at = Some(Instant::now());
        }
      }
      None => trace!("Ack for unknown or settled seq {}", seq),
    }
  }

  pub(crate) async fn run_retransmit(self: Arc<Self>) {
    let mut ticker = interval(self.retransmit_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      ticker.tick().await;
      self.sweep().await;
    }
  }

  async fn sweep(&self) {
    let now = Instant::now();
    let mut resend = Vec::new();
    {
      let mut pending = lock(&self.pending);
      let due = pending
        .queue
        .range(..=(now, u32::MAX))
        .map(|(k, _)| *k)
        .collect::<Vec<_>>();
      for k in due {
        let mut send = match pending.queue.remove(&k) {
          Some(s) => s,
          None => continue,
        };
        let acked_at = pending.waiting.get(&send.seq).and_then(|e| e.acked_at);
        if let Some(at) = acked_at {
          pending.waiting.remove(&send.seq);
          send.host.update_stat(true);
          send.host.update_latency(at.saturating_duration_since(send.sent_at));
          send.resolve(true);
        } else if send.retries < self.max_retry {
          send.retries += 1;
          send.sent_at = now;
          resend.push((send.host.addr(), send.bytes.clone()));
          pending.queue.insert((now + self.retransmit_interval, send.seq), send);
        } else {
          pending.waiting.remove(&send.seq);
          send.host.update_stat(false);
          send.host.mark_failed();
          debug!(
            "Giving up on seq {} to {} after {} retries",
            send.seq, send.host, send.retries
          );
          send.resolve(false);
        }
      }
    }
    for (addr, bytes) in resend {
      trace!("Retransmitting {} bytes to {}", bytes.len(), addr);
      self.transmit(addr, bytes).await;
    }
  }
}
