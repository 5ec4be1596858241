use crate::core::{lock, DecodeError, HostRecord, Key, Reader, Writer};
use linked_hash_map::LinkedHashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::lookup_host;

/// Number of send outcomes a host remembers.
pub const SUCCESS_WINDOW: usize = 20;

struct HostStats {
  window: [bool; SUCCESS_WINDOW],
  next: usize,
  successes: usize,
  latency: Option<Duration>,
  failed_at: Option<Instant>,
}
impl HostStats {
  fn new() -> HostStats {
    // Half failures, half successes: a fresh host starts at 0.5.
    let mut window = [false; SUCCESS_WINDOW];
    for slot in window.iter_mut().skip(SUCCESS_WINDOW / 2) {
      *slot = true;
    }
    HostStats {
      window,
      next: 0,
      successes: SUCCESS_WINDOW - SUCCESS_WINDOW / 2,
      latency: None,
      failed_at: None,
    }
  }
}

/// A remote overlay node and what we have learned about its link.
pub struct Host {
  addr: SocketAddrV4,
  key: Key,
  stats: Mutex<HostStats>,
}
impl Host {
  pub fn new(addr: SocketAddrV4, key: Key) -> Host {
    Host {
      addr,
      key,
      stats: Mutex::new(HostStats::new()),
    }
  }

  /// The key a node gets when nobody chose one for it.
  pub fn default_key(addr: &SocketAddrV4) -> Key {
    Key::hash(format!("{}:{}", addr.ip(), addr.port()).as_bytes())
  }

  pub fn key(&self) -> Key {
    self.key
  }

  pub fn addr(&self) -> SocketAddrV4 {
    self.addr
  }

  pub fn record(&self) -> HostRecord {
    HostRecord {
      key: self.key,
      addr: self.addr,
    }
  }

  pub fn put(&self, w: &mut Writer) {
    self.record().put(w)
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = Writer::with_capacity(HostRecord::SIZE);
    self.put(&mut w);
    w.into_inner()
  }

  /// Pushes one outcome into the rolling window.
  pub fn update_stat(&self, success: bool) {
    let mut stats = lock(&self.stats);
    let idx = stats.next;
    if stats.window[idx] != success {
      if success {
        stats.successes += 1;
      } else {
        stats.successes -= 1;
      }
    }
    stats.window[idx] = success;
    stats.next = (idx + 1) % SUCCESS_WINDOW;
  }

  pub fn success_avg(&self) -> f64 {
    lock(&self.stats).successes as f64 / SUCCESS_WINDOW as f64
  }

  pub fn update_latency(&self, sample: Duration) {
    let mut stats = lock(&self.stats);
    stats.latency = Some(match stats.latency {
      Some(old) => old.mul_f64(0.9) + sample.mul_f64(0.1),
      None => sample,
    });
  }

  pub fn latency(&self) -> Option<Duration> {
    lock(&self.stats).latency
  }

  pub fn mark_failed(&self) {
    lock(&self.stats).failed_at = Some(Instant::now());
  }

  pub fn failed_within(&self, grace: Duration) -> bool {
    lock(&self.stats)
      .failed_at
      .map(|t| t.elapsed() < grace)
      .unwrap_or(false)
  }
}
impl PartialEq for Host {
  fn eq(&self, other: &Self) -> bool {
    self.key == other.key && self.addr == other.addr
  }
}
impl Eq for Host {}
impl fmt::Display for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.addr)
  }
}
impl fmt::Debug for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Host({} {})", self.addr, self.key)
  }
}

/// Bounded cache of hosts keyed by address.
///
/// Eviction runs in least-recently-used order and skips any host someone
/// outside the cache still holds, so routing entries and in-flight sends keep
/// their statistics.
pub struct HostRegistry {
  capacity: usize,
  hosts: Mutex<LinkedHashMap<SocketAddrV4, Arc<Host>>>,
}
impl HostRegistry {
  pub fn new(capacity: usize) -> HostRegistry {
    HostRegistry {
      capacity,
      hosts: Mutex::new(LinkedHashMap::new()),
    }
  }

  pub fn get(&self, addr: SocketAddrV4) -> Arc<Host> {
    let mut hosts = lock(&self.hosts);
    if let Some(host) = hosts.get_refresh(&addr) {
      return host.clone();
    }
    let host = Arc::new(Host::new(addr, Host::default_key(&addr)));
    hosts.insert(addr, host.clone());
    self.trim(&mut hosts);
    host
  }

  /// Looks up `name` and returns the host at its first IPv4 address.
  pub async fn resolve(&self, name: &str, port: u16) -> io::Result<Arc<Host>> {
    let addr = lookup_host((name, port))
      .await?
      .find_map(|a| match a {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
      })
      .ok_or_else(|| {
        io::Error::new(
          io::ErrorKind::NotFound,
          format!("no IPv4 address for {}:{}", name, port),
        )
      })?;
    Ok(self.get(addr))
  }

  /// Caches a host learned from the wire. A record whose key disagrees with
  /// the cached host replaces it.
  pub fn insert_record(&self, record: HostRecord) -> Arc<Host> {
    let mut hosts = lock(&self.hosts);
    if let Some(host) = hosts.get_refresh(&record.addr) {
      if host.key() == record.key {
        return host.clone();
      }
    }
    let host = Arc::new(Host::new(record.addr, record.key));
    hosts.insert(record.addr, host.clone());
    self.trim(&mut hosts);
    host
  }

  pub fn decode(&self, r: &mut Reader<'_>) -> Result<Arc<Host>, DecodeError> {
    Ok(self.insert_record(HostRecord::take(r)?))
  }

  /// Decodes back-to-back host records until the buffer runs out.
  pub fn decode_all(&self, buf: &[u8]) -> Result<Vec<Arc<Host>>, DecodeError> {
    let mut r = Reader::new(buf);
    let mut v = Vec::with_capacity(buf.len() / HostRecord::SIZE);
    while !r.is_empty() {
      v.push(self.decode(&mut r)?);
    }
    Ok(v)
  }

  /// Drops `host` from the cache right away if the caller's handle is the only
  /// one left outside the cache. Otherwise a no-op.
  pub fn release(&self, host: &Arc<Host>) {
    let mut hosts = lock(&self.hosts);
    let idle = hosts
      .get(&host.addr())
      .map(|h| Arc::ptr_eq(h, host) && Arc::strong_count(h) <= 2)
      .unwrap_or(false);
    if idle {
      hosts.remove(&host.addr());
    }
  }

  pub fn len(&self) -> usize {
    lock(&self.hosts).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn trim(&self, hosts: &mut LinkedHashMap<SocketAddrV4, Arc<Host>>) {
    while hosts.len() > self.capacity {
      let victim = hosts
        .iter()
        .find(|(_, h)| Arc::strong_count(h) == 1)
        .map(|(a, _)| *a);
      match victim {
        Some(addr) => {
          hosts.remove(&addr);
        }
        None => break,
      }
    }
  }
}

#[test]
fn test_success_window() {
  let host = Host::new("127.0.0.1:9000".parse().unwrap(), Key::new(9));
  assert_eq!(host.success_avg(), 0.5);
  // The first half of the window already holds failures.
  for _ in 0..SUCCESS_WINDOW / 2 {
    host.update_stat(false);
  }
  assert_eq!(host.success_avg(), 0.5);
  for _ in 0..5 {
    host.update_stat(false);
  }
  assert_eq!(host.success_avg(), 0.25);
  for _ in 0..SUCCESS_WINDOW {
    host.update_stat(true);
  }
  assert_eq!(host.success_avg(), 1.0);
}

#[test]
fn test_latency_and_failure() {
  let host = Host::new("127.0.0.1:9001".parse().unwrap(), Key::new(1));
  assert_eq!(host.latency(), None);
  host.update_latency(Duration::from_millis(100));
  assert_eq!(host.latency(), Some(Duration::from_millis(100)));
  host.update_latency(Duration::from_millis(200));
  let smoothed = host.latency().unwrap();
  assert!(smoothed > Duration::from_millis(109) && smoothed < Duration::from_millis(111));
  assert!(!host.failed_within(Duration::from_secs(30)));
  host.mark_failed();
  assert!(host.failed_within(Duration::from_secs(30)));
}

#[test]
fn test_registry_eviction() {
  let registry = HostRegistry::new(2);
  let a = registry.get("127.0.0.1:7001".parse().unwrap());
  let b = registry.get("127.0.0.1:7002".parse().unwrap());
  assert_eq!(a.key(), Key::hash(b"127.0.0.1:7001"));
  assert!(Arc::ptr_eq(&a, &registry.get(a.addr())));
  drop(b);
  // b is unreferenced, so it goes; a stays even though it is older.
  let c = registry.get("127.0.0.1:7003".parse().unwrap());
  assert_eq!(registry.len(), 2);
  assert!(Arc::ptr_eq(&a, &registry.get(a.addr())));
  assert!(Arc::ptr_eq(&c, &registry.get(c.addr())));
  // Everything held: the cache grows past capacity rather than evict.
  let d = registry.get("127.0.0.1:7004".parse().unwrap());
  assert_eq!(registry.len(), 3);
  registry.release(&d);
  assert_eq!(registry.len(), 2);
  registry.release(&a);
  assert_eq!(registry.len(), 1);
}

#[test]
fn test_registry_decode() {
  let registry = HostRegistry::new(8);
  let a = Host::new("10.1.1.1:5000".parse().unwrap(), Key::new(77));
  let b = Host::new("10.1.1.2:5000".parse().unwrap(), Key::new(78));
  let mut buf = a.encode();
  buf.extend(b.encode());
  let hosts = registry.decode_all(&buf).unwrap();
  assert_eq!(hosts.len(), 2);
  assert_eq!(*hosts[0], a);
  assert_eq!(*hosts[1], b);
  assert!(registry.decode_all(&buf[..20]).is_err());
}
