use crate::core::{Host, Key, BASE, DIGITS};
use itertools::Itertools;
use std::cmp::max;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Prefix routing table plus leafset for one node.
///
/// Row `r`, column `c` holds hosts sharing exactly `r` leading digits with
/// the local key whose next digit is `c`. The leafset keeps the nearest
/// hosts on each side of the local key, closest first.
pub struct RoutingTable {
  me: Arc<Host>,
  rows: Vec<Vec<Vec<Arc<Host>>>>,
  left: Vec<Arc<Host>>,
  right: Vec<Arc<Host>>,
  leafset_size: usize,
  max_entry: usize,
}
impl RoutingTable {
  pub fn new(me: Arc<Host>, leafset_size: usize, max_entry: usize) -> RoutingTable {
    RoutingTable {
      me,
      rows: vec![vec![Vec::new(); BASE]; DIGITS],
      left: Vec::new(),
      right: Vec::new(),
      leafset_size,
      max_entry: max(max_entry, 1),
    }
  }

  pub fn me(&self) -> &Arc<Host> {
    &self.me
  }

  fn half(&self) -> usize {
    max(self.leafset_size / 2, 1)
  }

  /// Inserts `host` when `joining`, removes it everywhere otherwise. Returns
  /// whether leafset membership changed.
  pub fn update(&mut self, host: &Arc<Host>, joining: bool) -> bool {
    if host.key() == self.me.key() {
      return false;
    }
    if joining {
      self.insert_table(host);
      let me = self.me.key();
      let half = self.half();
      let cw = insert_side(&mut self.right, host, half, |k| k.sub(&me));
      let ccw = insert_side(&mut self.left, host, half, |k| me.sub(k));
      cw || ccw
    } else {
      let (row, col) = self.cell_of(&host.key());
      self.rows[row][col].retain(|h| h.key() != host.key());
      let before = self.left.len() + self.right.len();
      self.left.retain(|h| h.key() != host.key());
      self.right.retain(|h| h.key() != host.key());
      before != self.left.len() + self.right.len()
    }
  }

  fn cell_of(&self, key: &Key) -> (usize, usize) {
    let row = self.me.key().prefix_length(key);
    (row, key.digit(row))
  }

  fn insert_table(&mut self, host: &Arc<Host>) {
    let (row, col) = self.cell_of(&host.key());
    let max_entry = self.max_entry;
    let cell = &mut self.rows[row][col];
    if let Some(existing) = cell.iter_mut().find(|h| h.key() == host.key()) {
      *existing = host.clone();
    } else if cell.len() < max_entry {
      cell.push(host.clone());
    } else {
      let worst = (0..cell.len()).max_by_key(|i| proximity(&cell[*i])).unwrap_or(0);
      if proximity(host) < proximity(&cell[worst]) {
        cell[worst] = host.clone();
      }
    }
    cell.sort_by_key(|h| proximity(h));
  }

  pub fn leafset_full(&self) -> bool {
    self.left.len() >= self.half() && self.right.len() >= self.half()
  }

  fn leafset(&self) -> impl Iterator<Item = &Arc<Host>> {
    self.left.iter().chain(self.right.iter()).unique_by(|h| h.key())
  }

  /// Up to `count` next hops for `key`, best first. Never empty; the local
  /// host in front means `key` belongs here.
  pub fn lookup(&self, key: &Key, count: usize) -> Vec<Arc<Host>> {
    let count = max(count, 1);
    if !self.left.is_empty() || !self.right.is_empty() {
      let in_range = match (self.left.last(), self.right.last()) {
        (Some(l), Some(r)) if self.leafset_full() => key.between(&l.key(), &r.key()),
        _ => true,
      };
      if in_range {
        return self
          .leafset()
          .chain(std::iter::once(&self.me))
          .sorted_by_key(|h| (h.key().distance(key), h.key()))
          .take(count)
          .cloned()
          .collect();
      }
    }
    let (row, col) = self.cell_of(key);
    let cell = &self.rows[row][col];
    if !cell.is_empty() {
      // Latencies move after insertion, so rank the cell now.
      return cell
        .iter()
        .sorted_by_key(|h| proximity(h))
        .take(count)
        .cloned()
        .collect();
    }
    let mine = self.me.key().distance(key);
    let closer = self
      .known()
      .into_iter()
      .filter(|h| h.key().prefix_length(key) >= row && h.key().distance(key) < mine)
      .sorted_by_key(|h| (h.key().distance(key), h.key()))
      .take(count)
      .collect::<Vec<_>>();
    if closer.is_empty() {
      vec![self.me.clone()]
    } else {
      closer
    }
  }

  /// The leafset, nearest first by ring distance.
  pub fn neighbors(&self, count: usize) -> Vec<Arc<Host>> {
    let me = self.me.key();
    self
      .leafset()
      .sorted_by_key(|h| (h.key().distance(&me), h.key()))
      .take(count)
      .cloned()
      .collect()
  }

  /// The table row a joiner with `key` should copy, with the local host at
  /// its own digit.
  pub fn row_lookup(&self, key: &Key) -> Vec<Arc<Host>> {
    let row = self.me.key().prefix_length(key);
    let mut v = self.rows[row].iter().flatten().cloned().collect::<Vec<_>>();
    v.push(self.me.clone());
    v
  }

  /// Every host in the routing table.
  pub fn table(&self) -> Vec<Arc<Host>> {
    self
      .rows
      .iter()
      .flatten()
      .flatten()
      .unique_by(|h| h.key())
      .cloned()
      .collect()
  }

  /// Every host in the table or the leafset.
  pub fn known(&self) -> Vec<Arc<Host>> {
    self
      .rows
      .iter()
      .flatten()
      .flatten()
      .chain(self.left.iter())
      .chain(self.right.iter())
      .unique_by(|h| h.key())
      .cloned()
      .collect()
  }

  pub fn contains(&self, key: &Key) -> bool {
    self.known().iter().any(|h| h.key() == *key)
  }

  /// Removes every host whose success average is under `bad_link`. Each
  /// evicted host comes back with whether it left the leafset.
  pub fn evict_bad_links(&mut self, bad_link: f64) -> Vec<(Arc<Host>, bool)> {
    let bad = self
      .known()
      .into_iter()
      .filter(|h| h.success_avg() < bad_link)
      .collect::<Vec<_>>();
    bad
      .into_iter()
      .map(|h| {
        let left_leafset = self.update(&h, false);
        (h, left_leafset)
      })
      .collect()
  }
}

fn proximity(host: &Arc<Host>) -> Duration {
  host.latency().unwrap_or(Duration::MAX)
}

fn insert_side<F>(side: &mut Vec<Arc<Host>>, host: &Arc<Host>, half: usize, dist: F) -> bool
where
  F: Fn(&Key) -> Key,
{
  if let Some(existing) = side.iter_mut().find(|h| h.key() == host.key()) {
    *existing = host.clone();
    return false;
  }
  let d = dist(&host.key());
  let pos = side
    .iter()
    .position(|h| dist(&h.key()) > d)
    .unwrap_or(side.len());
  if pos >= half {
    return false;
  }
  side.insert(pos, host.clone());
  side.truncate(half);
  true
}

impl fmt::Display for RoutingTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "ROUTING TABLE of {} ({})", self.me.key(), self.me)?;
    for (r, row) in self.rows.iter().enumerate() {
      if row.iter().all(|c| c.is_empty()) {
        continue;
      }
      write!(f, "{:2}:", r)?;
      for cell in row {
        let entries = cell.iter().map(|h| h.key().to_string()).join(",");
        write!(f, " [{}]", entries)?;
      }
      writeln!(f)?;
    }
    writeln!(f, "LEAFSET")?;
    for h in self.left.iter().rev() {
      writeln!(f, "  - {} {}", h.key(), h)?;
    }
    for h in self.right.iter() {
      writeln!(f, "  + {} {}", h.key(), h)?;
    }
    Ok(())
  }
}

#[cfg(test)]
fn test_host(key: Key, port: u16) -> Arc<Host> {
  Arc::new(Host::new(
    std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, port),
    key,
  ))
}

#[cfg(test)]
fn offset(i: i64) -> Key {
  let step = Key::new((i.unsigned_abs() as u128) << 80);
  if i >= 0 {
    Key::HALF.add(&step)
  } else {
    Key::HALF.sub(&step)
  }
}

#[test]
fn test_leafset_bounds() {
  let me = test_host(Key::HALF, 6000);
  let mut table = RoutingTable::new(me.clone(), 8, 3);
  for i in (1..=10).chain(-10..=-1) {
    table.update(&test_host(offset(i), (6050 + i) as u16), true);
  }
  assert!(table.leafset_full());
  let neighbors = table.neighbors(usize::MAX);
  assert_eq!(neighbors.len(), 8);
  assert!(neighbors.iter().all(|h| h.key() != me.key()));
  let mut expected = (1..=4).chain(-4..=-1).map(offset).collect::<Vec<_>>();
  expected.sort();
  let mut got = neighbors.iter().map(|h| h.key()).collect::<Vec<_>>();
  got.sort();
  assert_eq!(expected, got);
  // Self is never stored.
  assert!(!table.update(&me, true));
  assert!(!table.contains(&me.key()));
}

#[test]
fn test_lookup_tiers() {
  let me = test_host(Key::HALF, 6100);
  let mut table = RoutingTable::new(me.clone(), 8, 3);
  // Alone: everything is ours.
  assert_eq!(table.lookup(&Key::new(5), 1)[0].key(), me.key());

  for i in (1..=10).chain(-10..=-1) {
    table.update(&test_host(offset(i), (6150 + i) as u16), true);
  }
  // Inside the leafset range, the numerically closest wins.
  let near = offset(2).add(&Key::new(3));
  assert_eq!(table.lookup(&near, 1)[0].key(), offset(2));
  assert_eq!(table.lookup(&Key::HALF.add(&Key::new(1)), 1)[0].key(), me.key());
  // Far away: the closest known host that beats us.
  let far = Key::new(5);
  let hop = table.lookup(&far, 1).remove(0);
  assert_ne!(hop.key(), me.key());
  assert!(hop.key().distance(&far) < me.key().distance(&far));
  assert_eq!(hop.key(), offset(-10));
}

#[test]
fn test_cell_capacity() {
  let me = test_host(Key::ZERO, 6200);
  let mut table = RoutingTable::new(me, 2, 2);
  // Same first digit (3), so all land in row 0, column 3.
  let hosts = (1..=3)
    .map(|i| test_host(Key::MAX.sub(&Key::new(i << 40)), 6200 + i as u16))
    .collect::<Vec<_>>();
  for h in hosts.iter() {
    table.update(h, true);
  }
  assert_eq!(table.table().len(), 2);
  // A host with measured latency displaces one that has none.
  hosts[2].update_latency(Duration::from_millis(3));
  table.update(&hosts[2], true);
  let t = table.table();
  assert_eq!(t.len(), 2);
  assert!(t.iter().any(|h| h.key() == hosts[2].key()));
  assert_eq!(table.row_lookup(&hosts[0].key()).len(), 3);
}

#[test]
fn test_cell_ranked_by_current_latency() {
  let me = test_host(Key::ZERO, 6400);
  let mut table = RoutingTable::new(me, 2, 3);
  let far_side = test_host(Key::HALF.add(&Key::new(3)), 6401);
  table.update(&far_side, true);
  // Both land in row 0, column 1.
  let quarter = Key::new(1 << 94);
  let a = test_host(quarter, 6410);
  let b = test_host(quarter.add(&Key::new(1)), 6411);
  b.update_latency(Duration::from_millis(5));
  table.update(&b, true);
  a.update_latency(Duration::from_millis(50));
  table.update(&a, true);
  assert!(table.leafset_full());
  // Past the leafset's clockwise edge, so the table cell decides.
  let target = quarter.add(&Key::new(1 << 80));
  assert_eq!(table.lookup(&target, 1)[0].key(), b.key());
  // The link to `a` gets faster after both were inserted.
  for _ in 0..60 {
    a.update_latency(Duration::from_micros(100));
  }
  assert_eq!(table.lookup(&target, 1)[0].key(), a.key());
  assert_eq!(table.lookup(&target, 2).len(), 2);
}

#[test]
fn test_bad_link_eviction() {
  let me = test_host(Key::HALF, 6300);
  let mut table = RoutingTable::new(me.clone(), 8, 3);
  let peer = test_host(offset(1), 6301);
  assert!(table.update(&peer, true));
  assert_eq!(table.lookup(&peer.key(), 1)[0].key(), peer.key());
  assert_eq!(table.neighbors(8).len(), 1);
  assert!(table.evict_bad_links(0.3).is_empty());

  for _ in 0..crate::core::SUCCESS_WINDOW {
    peer.update_stat(false);
  }
  let evicted = table.evict_bad_links(0.3);
  assert_eq!(evicted.len(), 1);
  assert!(evicted[0].1);
  assert_eq!(table.lookup(&peer.key(), 1)[0].key(), me.key());
  assert!(table.neighbors(8).is_empty());
  assert!(table.table().is_empty());
}
