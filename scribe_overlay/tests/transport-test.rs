use async_trait::async_trait;
use crossbeam::channel::{unbounded, Sender};
use scribe_overlay::core::{AckPolicy, Key, Message, OverlayError, LOG_LEVEL};
use scribe_overlay::overlay::{Overlay, OverlayConfig, Upcalls};
use scribe_overlay::testkit::{init_logging, FailureConfig};
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::timeout;

const APP: u16 = 20;

struct Recorder {
  tx: Sender<Vec<u8>>,
}
#[async_trait]
impl Upcalls for Recorder {
  async fn deliver(&self, _: &Key, msg: Message) {
    let _ = self.tx.send(msg.payload);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unacked_send_gives_up_after_retries() {
  init_logging(LOG_LEVEL);
  let sink = UdpSocket::bind("127.0.0.1:5101").unwrap();
  sink.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
  let overlay = Overlay::new(OverlayConfig::testing(5100)).await.unwrap();
  overlay.register(APP, AckPolicy::Required).unwrap();

  let host = overlay.hosts().get("127.0.0.1:5101".parse().unwrap());
  let msg = Message::new(host.key(), overlay.key(), 0, APP, b"anyone?".to_vec());
  let delivery = overlay.send_direct(&host, msg).await.unwrap().unwrap();
  let delivered = timeout(Duration::from_secs(3), delivery).await.unwrap().unwrap();
  assert!(!delivered);
  assert!(host.failed_within(Duration::from_secs(5)));
  assert_eq!(overlay.pending_sends(), 0);

  let received = tokio::task::spawn_blocking(move || {
    let mut buf = [0u8; 2048];
    let mut count = 0;
    while sink.recv_from(&mut buf).is_ok() {
      count += 1;
    }
    count
  })
  .await
  .unwrap();
  // One send plus `max_retry` retransmissions.
  assert_eq!(received, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acked_send_resolves_and_records_latency() {
  init_logging(LOG_LEVEL);
  let a = Overlay::new(OverlayConfig::testing(5110)).await.unwrap();
  let b = Overlay::new(OverlayConfig::testing(5111)).await.unwrap();
  a.register(APP, AckPolicy::Required).unwrap();
  b.register(APP, AckPolicy::Required).unwrap();
  let (tx, rx) = unbounded();
  let recorder = Arc::new(Recorder { tx });
  let weak = Arc::downgrade(&recorder);
  let weak: Weak<dyn Upcalls> = weak;
  b.set_upcalls(weak);

  let host = a.hosts().get(b.local_addr());
  let msg = Message::new(b.key(), a.key(), 0, APP, b"hello".to_vec());
  let delivery = a.send_direct(&host, msg).await.unwrap().unwrap();
  assert!(timeout(Duration::from_secs(3), delivery).await.unwrap().unwrap());
  assert!(host.latency().is_some());
  assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), b"hello".to_vec());
  assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_acks_lead_to_duplicate_deliveries() {
  init_logging(LOG_LEVEL);
  let a_addr: SocketAddrV4 = "127.0.0.1:5120".parse().unwrap();
  let a = Overlay::new(OverlayConfig::testing(5120)).await.unwrap();
  let mut b_config = OverlayConfig::testing(5121);
  b_config.fail_map.node_wide.insert(
    a_addr,
    FailureConfig {
      drop_prob: 1.0,
      delay: None,
    },
  );
  let b = Overlay::new(b_config).await.unwrap();
  a.register(APP, AckPolicy::Required).unwrap();
  b.register(APP, AckPolicy::Required).unwrap();
  let (tx, rx) = unbounded();
  let recorder = Arc::new(Recorder { tx });
  let weak = Arc::downgrade(&recorder);
  let weak: Weak<dyn Upcalls> = weak;
  b.set_upcalls(weak);

  let host = a.hosts().get(b.local_addr());
  let msg = Message::new(b.key(), a.key(), 0, APP, b"again".to_vec());
  let delivery = a.send_direct(&host, msg).await.unwrap().unwrap();
  assert!(!timeout(Duration::from_secs(3), delivery).await.unwrap().unwrap());
  tokio::time::sleep(Duration::from_millis(200)).await;
  // Every retransmission is handed up again.
  assert_eq!(rx.try_iter().filter(|p| p == b"again").count(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_rules() {
  let overlay = Overlay::new(OverlayConfig::testing(5130)).await.unwrap();
  assert!(matches!(
    overlay.register(3, AckPolicy::NoAck),
    Err(OverlayError::ReservedKind(3))
  ));
  overlay.register(APP, AckPolicy::NoAck).unwrap();
  assert!(matches!(
    overlay.register(APP, AckPolicy::Required),
    Err(OverlayError::DuplicateKind(APP))
  ));
  let me = overlay.me();
  let msg = Message::new(me.key(), me.key(), 0, APP + 1, Vec::new());
  assert!(matches!(
    overlay.send_direct(&overlay.hosts().get("127.0.0.1:5131".parse().unwrap()), msg).await,
    Err(OverlayError::UnregisteredKind(21))
  ));
}
