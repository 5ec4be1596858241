use crate::core::{lock, AckPolicy, Message, OverlayError, Reader};
use crate::overlay::node::{handler, OverlayState, JOIN, JOIN_ACK, JOIN_NACK, PIGGY, PING, UPDATE};
use itertools::Itertools;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

impl OverlayState {
  pub(in crate::overlay) fn register_overlay_handlers(self: &Arc<Self>) -> Result<(), OverlayError> {
    let d = &self.dispatch;
    d.register(JOIN, AckPolicy::Required, handler(self, |s, m| async move {
      let key = m.dst;
      s.route(key, m, None).await
    }))?;
    d.register(JOIN_ACK, AckPolicy::Required, handler(self, |s, m| async move {
      s.on_join_ack(m).await
    }))?;
    d.register(JOIN_NACK, AckPolicy::Required, handler(self, |s, m| async move {
      s.on_join_nack(m)
    }))?;
    d.register(UPDATE, AckPolicy::Required, handler(self, |s, m| async move {
      s.on_update(m)
    }))?;
    d.register(PIGGY, AckPolicy::Required, handler(self, |s, m| async move {
      s.on_piggy(m)
    }))?;
    d.register(PING, AckPolicy::Required, handler(self, |s, m| async move {
      s.on_ping(m)
    }))?;
    Ok(())
  }

  async fn on_join_ack(self: Arc<Self>, msg: Message) {
    let hosts = match self.hosts.decode_all(&msg.payload) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding join ack: {}", e);
        return;
      }
    };
    info!("{} joined through {} ({} hosts)", self.me, msg.src, hosts.len());
    for h in hosts.iter() {
      self.update_host(h, true);
    }
    let announce = {
      let table = lock(&self.table);
      table.known()
    };
    let me = self.me.encode();
    for h in announce.iter() {
      self.send_control(h, UPDATE, me.clone()).await;
    }
    self.become_active();
  }

  fn on_join_nack(self: Arc<Self>, msg: Message) {
    let wait = self.config.grace_period + Duration::from_secs(1);
    info!("Join refused by {}, retrying in {:?}", msg.src, wait);
    let weak = Arc::downgrade(&self);
    drop(self);
    tokio::spawn(async move {
      sleep(wait).await;
      let state = match weak.upgrade() {
        Some(s) => s,
        None => return,
      };
      let boot = lock(&state.bootstrap).clone();
      if let Some(boot) = boot {
        if let Err(e) = state.send_join(&boot).await {
          warn!("Join retry through {} failed: {}", boot, e);
        }
      }
    });
  }

  fn on_update(self: Arc<Self>, msg: Message) {
    match self.hosts.decode(&mut Reader::new(&msg.payload)) {
      Ok(host) => self.update_host(&host, true),
      Err(e) => warn!("Discarding update: {}", e),
    }
  }

  fn on_piggy(self: Arc<Self>, msg: Message) {
    let hosts = match self.hosts.decode_all(&msg.payload) {
      Ok(h) => h,
      Err(e) => {
        warn!("Discarding piggy-backed hosts: {}", e);
        return;
      }
    };
    for h in hosts.iter() {
      if h.key() != self.me.key() && !h.failed_within(self.config.grace_period) {
        self.update_host(h, true);
      }
    }
  }

  fn on_ping(self: Arc<Self>, msg: Message) {
    match self.hosts.decode(&mut Reader::new(&msg.payload)) {
      Ok(sender) => sender.update_stat(true),
      Err(e) => warn!("Discarding ping: {}", e),
    }
  }

  /// One liveness round: ping everyone known, evict bad links and, every
  /// `piggy_every` rounds, hand our leafset to the leafset.
  pub(in crate::overlay) async fn check(self: Arc<Self>, cycle: u32) {
    let (leafset, known) = {
      let table = lock(&self.table);
      (table.neighbors(self.config.leafset_size), table.known())
    };
    let me = self.me.encode();
    for h in known.iter() {
      self.send_control(h, PING, me.clone()).await;
    }
    let evicted = lock(&self.table).evict_bad_links(self.config.bad_link);
    for (h, left_leafset) in evicted {
      info!("Evicting {} (success {:.2})", h, h.success_avg());
      if left_leafset {
        self.notify_updated(&h, false);
      }
    }
    if self.config.piggy_every > 0 && cycle % self.config.piggy_every == 0 {
      let payload = std::iter::once(&self.me)
        .chain(leafset.iter())
        .unique_by(|h| h.key())
        .flat_map(|h| h.encode())
        .collect::<Vec<_>>();
      debug!("Exchanging leafset with {} peers", leafset.len());
      for h in leafset.iter() {
        self.send_control(h, PIGGY, payload.clone()).await;
      }
    }
  }
}
