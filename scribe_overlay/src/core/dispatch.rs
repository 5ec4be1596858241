use crate::core::{read, write, AckFlag, Message, OverlayError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
/// Runs a message of one registered type to completion on a worker.
pub type Handler = Arc<dyn Fn(Message) -> BoxFuture + Send + Sync>;

/// Whether sends of a message type wait for an acknowledgement.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AckPolicy {
  Required,
  NoAck,
}
impl AckPolicy {
  pub fn reliable(reliable: bool) -> AckPolicy {
    if reliable {
      AckPolicy::Required
    } else {
      AckPolicy::NoAck
    }
  }

  pub fn flag(&self) -> AckFlag {
    match self {
      AckPolicy::Required => AckFlag::Required,
      AckPolicy::NoAck => AckFlag::NoAck,
    }
  }
}

struct Registration {
  ack: AckPolicy,
  handler: Handler,
}

struct Job {
  handler: Handler,
  msg: Message,
}

/// Type-indexed handler table in front of a fixed pool of workers.
///
/// The receive loop submits decoded messages; a full queue makes it wait
/// instead of growing without bound.
pub struct Dispatcher {
  registry: RwLock<HashMap<u16, Registration>>,
  tx: async_channel::Sender<Job>,
  rx: async_channel::Receiver<Job>,
}
impl Dispatcher {
  pub fn new(queue_size: usize) -> Dispatcher {
    let (tx, rx) = async_channel::bounded(queue_size.max(1));
    Dispatcher {
      registry: RwLock::new(HashMap::new()),
      tx,
      rx,
    }
  }

  pub fn register(
    &self,
    kind: u16,
    ack: AckPolicy,
    handler: Handler,
  ) -> Result<(), OverlayError> {
    let mut registry = write(&self.registry);
    if registry.contains_key(&kind) {
      return Err(OverlayError::DuplicateKind(kind));
    }
    registry.insert(kind, Registration { ack, handler });
    Ok(())
  }

  pub fn ack_policy(&self, kind: u16) -> Option<AckPolicy> {
    read(&self.registry).get(&kind).map(|r| r.ack)
  }

  pub async fn submit(&self, msg: Message) {
    let handler = match read(&self.registry).get(&msg.kind) {
      Some(r) => r.handler.clone(),
      None => {
        warn!("Dropping message of unregistered type {}", msg.kind);
        return;
      }
    };
    trace!("Queueing message of type {} for {}", msg.kind, msg.dst);
    if self.tx.send(Job { handler, msg }).await.is_err() {
      trace!("Job queue closed, dropping message");
    }
  }

  pub fn start(&self, workers: usize) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
      .map(|_| {
        let rx = self.rx.clone();
        tokio::spawn(async move {
          while let Ok(job) = rx.recv().await {
            (job.handler)(job.msg).await;
          }
        })
      })
      .collect()
  }

  pub fn close(&self) {
    self.tx.close();
  }
}

#[test]
fn test_dispatch() {
  use crate::core::Key;
  use tokio::sync::mpsc::unbounded_channel;

  let (tx, mut rx) = unbounded_channel();
  let dispatch = Dispatcher::new(4);
  let handler = |tag: &'static str| -> Handler {
    let tx = tx.clone();
    Arc::new(move |msg: Message| -> BoxFuture {
      let tx = tx.clone();
      Box::pin(async move {
        tx.send((tag, msg.payload)).unwrap();
      })
    })
  };
  dispatch.register(20, AckPolicy::Required, handler("a")).unwrap();
  dispatch.register(21, AckPolicy::NoAck, handler("b")).unwrap();
  assert!(matches!(
    dispatch.register(20, AckPolicy::NoAck, handler("c")),
    Err(OverlayError::DuplicateKind(20))
  ));
  assert_eq!(dispatch.ack_policy(20), Some(AckPolicy::Required));
  assert_eq!(dispatch.ack_policy(21), Some(AckPolicy::NoAck));
  assert_eq!(dispatch.ack_policy(22), None);

  let mut recvd = tokio_test::block_on(async {
    let workers = dispatch.start(2);
    for (kind, byte) in [(20u16, 1u8), (21, 2), (22, 3), (20, 4)].iter() {
      let msg = Message::new(Key::ZERO, Key::ZERO, 0, *kind, vec![*byte]);
      dispatch.submit(msg).await;
    }
    let mut recvd = Vec::new();
    for _ in 0..3 {
      recvd.push(rx.recv().await.unwrap());
    }
    dispatch.close();
    for w in workers {
      w.await.unwrap();
    }
    recvd
  });
  recvd.sort();
  assert_eq!(recvd, vec![("a", vec![1]), ("a", vec![4]), ("b", vec![2])]);
}
