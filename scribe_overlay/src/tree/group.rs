use crate::core::{Host, Key};
use crate::tree::TreeError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Robustness a child starts with, and the most it can accumulate.
pub const DEFAULT_COUNT: u32 = 2;

/// A `scheme://group[:port]` URI. Only the group part feeds the key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GroupUri {
  pub scheme: String,
  pub group: String,
  pub port: u16,
}
impl GroupUri {
  pub fn parse(uri: &str) -> Result<GroupUri, TreeError> {
    let bad = || TreeError::BadUri(uri.to_string());
    let (scheme, rest) = uri.split_once("://").ok_or_else(bad)?;
    let (group, port) = match rest.rsplit_once(':') {
      Some((g, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
        (g, p.parse::<u16>().map_err(|_| bad())?)
      }
      _ => (rest, 0),
    };
    if scheme.is_empty() || group.is_empty() {
      return Err(bad());
    }
    Ok(GroupUri {
      scheme: scheme.to_string(),
      group: group.to_string(),
      port,
    })
  }

  /// The URI without its port.
  pub fn base(&self) -> String {
    format!("{}://{}", self.scheme, self.group)
  }

  pub fn key(&self) -> Key {
    Key::hash(self.group.as_bytes())
  }
}
impl fmt::Display for GroupUri {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.port > 0 {
      write!(f, "{}://{}:{}", self.scheme, self.group, self.port)
    } else {
      write!(f, "{}://{}", self.scheme, self.group)
    }
  }
}

/// Both directions of the group name mapping. Wire messages only carry the
/// key, so a miss on `uri_of` is normal until a payload names the group.
#[derive(Default)]
pub struct UriCache {
  keys: HashMap<String, Key>,
  uris: HashMap<(Key, u16), String>,
}
impl UriCache {
  pub fn key_of(&mut self, uri: &GroupUri) -> Key {
    let full = uri.to_string();
    if let Some(k) = self.keys.get(&full) {
      return *k;
    }
    let key = uri.key();
    let base = uri.base();
    self.keys.insert(base.clone(), key);
    self.uris.insert((key, 0), base);
    if uri.port > 0 {
      self.keys.insert(full.clone(), key);
      self.uris.insert((key, uri.port), full);
    }
    key
  }

  pub fn uri_of(&mut self, key: &Key, port: u16) -> Option<String> {
    if let Some(uri) = self.uris.get(&(*key, port)) {
      return Some(uri.clone());
    }
    if port == 0 {
      return None;
    }
    let with_port = format!("{}:{}", self.uris.get(&(*key, 0))?, port);
    self.keys.insert(with_port.clone(), *key);
    self.uris.insert((*key, port), with_port.clone());
    Some(with_port)
  }
}

/// A child in a group's tree.
#[derive(Clone, Debug)]
pub struct ScribeNode {
  pub host: Arc<Host>,
  pub counter: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
  Sender,
  Listener,
  SenderAndListener,
}

/// Tree state for one group on one node.
pub struct ScribeGroup {
  pub key: Key,
  pub uri: String,
  pub parent: Option<Arc<Host>>,
  pub rp: Option<Arc<Host>>,
  children: BTreeMap<Key, ScribeNode>,
}
impl ScribeGroup {
  pub fn new(key: Key, uri: String) -> ScribeGroup {
    ScribeGroup {
      key,
      uri,
      parent: None,
      rp: None,
      children: BTreeMap::new(),
    }
  }

  /// Adds `host` or refreshes its counter. Returns true for a new child.
  pub fn add_child(&mut self, host: Arc<Host>) -> bool {
    match self.children.get_mut(&host.key()) {
      Some(node) => {
        node.counter = std::cmp::min(node.counter + 1, DEFAULT_COUNT);
        node.host = host;
        false
      }
      None => {
        self.children.insert(
          host.key(),
          ScribeNode {
            host,
            counter: DEFAULT_COUNT,
          },
        );
        true
      }
    }
  }

  pub fn remove_child(&mut self, key: &Key) -> bool {
    self.children.remove(key).is_some()
  }

  pub fn has_child(&self, key: &Key) -> bool {
    self.children.contains_key(key)
  }

  pub fn children(&self) -> impl Iterator<Item = &ScribeNode> {
    self.children.values()
  }

  pub fn child_count(&self) -> usize {
    self.children.len()
  }

  pub fn counter(&self, key: &Key) -> Option<u32> {
    self.children.get(key).map(|n| n.counter)
  }

  pub fn is_tombstone(&self) -> bool {
    self.children.is_empty() && self.rp.is_none()
  }

  /// One maintenance tick. Other children lose one point and are dropped at
  /// zero; returns whether `me` is a child and should rejoin.
  pub fn decay(&mut self, me: &Key) -> bool {
    let mut rejoin = false;
    for (key, node) in self.children.iter_mut() {
      if key == me {
        rejoin = true;
      } else {
        node.counter = node.counter.saturating_sub(1);
      }
    }
    self.children.retain(|k, n| k == me || n.counter > 0);
    rejoin
  }

  pub fn role(&self, me: &Key) -> Role {
    match (self.has_child(me), self.children.len() > 1) {
      (true, true) => Role::SenderAndListener,
      (true, false) => Role::Listener,
      (false, _) => Role::Sender,
    }
  }

  /// True when this node forwards to someone other than itself.
  pub fn designated(&self, me: &Key) -> bool {
    self.children.len() > 1 || (self.children.len() == 1 && !self.has_child(me))
  }
}

#[cfg(test)]
fn host(port: u16) -> Arc<Host> {
  let addr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, port);
  Arc::new(Host::new(addr, Host::default_key(&addr)))
}

#[test]
fn test_counter_decay() {
  let me = host(8000);
  let child = host(8001);
  let mut group = ScribeGroup::new(Key::hash(b"G"), "scribe://G".to_string());
  assert!(group.add_child(me.clone()));
  assert!(group.add_child(child.clone()));
  assert_eq!(group.counter(&child.key()), Some(DEFAULT_COUNT));

  assert!(group.decay(&me.key()));
  assert_eq!(group.counter(&child.key()), Some(1));
  // A rejoin refreshes the counter, capped at the default.
  assert!(!group.add_child(child.clone()));
  assert!(!group.add_child(child.clone()));
  assert_eq!(group.counter(&child.key()), Some(DEFAULT_COUNT));

  for _ in 0..3 {
    group.decay(&me.key());
  }
  assert!(!group.has_child(&child.key()));
  assert!(group.has_child(&me.key()));
  assert_eq!(group.counter(&me.key()), Some(DEFAULT_COUNT));
}

#[test]
fn test_roles() {
  let me = host(8100);
  let mut group = ScribeGroup::new(Key::hash(b"G"), "scribe://G".to_string());
  assert_eq!(group.role(&me.key()), Role::Sender);
  assert!(!group.designated(&me.key()));
  assert!(group.is_tombstone());
  group.add_child(me.clone());
  assert_eq!(group.role(&me.key()), Role::Listener);
  assert!(!group.designated(&me.key()));
  group.add_child(host(8101));
  assert_eq!(group.role(&me.key()), Role::SenderAndListener);
  assert!(group.designated(&me.key()));
  group.remove_child(&me.key());
  assert!(group.designated(&me.key()));
  assert!(!group.is_tombstone());
}

#[test]
fn test_uri_mapping() {
  let plain = GroupUri::parse("scribe://G").unwrap();
  let ported = GroupUri::parse("scribe://G:5000").unwrap();
  assert_eq!(plain.group, "G");
  assert_eq!(ported.port, 5000);
  assert_eq!(plain.key(), Key::hash(b"G"));
  assert_eq!(plain.key(), ported.key());
  assert_eq!(GroupUri::parse("ip://G").unwrap().key(), plain.key());
  assert!(GroupUri::parse("no-scheme").is_err());
  assert!(GroupUri::parse("scribe://").is_err());

  let mut cache = UriCache::default();
  let key = cache.key_of(&plain);
  assert_eq!(cache.uri_of(&key, 0).as_deref(), Some("scribe://G"));
  assert_eq!(cache.uri_of(&key, 7000).as_deref(), Some("scribe://G:7000"));
  assert_eq!(cache.uri_of(&Key::hash(b"other"), 0), None);
  assert_eq!(cache.key_of(&ported), key);
}
