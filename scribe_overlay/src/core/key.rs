use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of a [`Key`] in bits.
pub const KEY_BITS: u32 = 96;
/// Width of an encoded [`Key`] in bytes.
pub const KEY_BYTES: usize = 12;
/// Bits per routing digit. Routing works in base 4.
pub const DIGIT_BITS: u32 = 2;
/// Number of distinct digit values, which is the column count of the routing table.
pub const BASE: usize = 1 << DIGIT_BITS;
/// Number of digits in a key, which is the row count of the routing table.
pub const DIGITS: usize = (KEY_BITS / DIGIT_BITS) as usize;

const MASK: u128 = (1u128 << KEY_BITS) - 1;

/// A 96-bit identifier on the ring. All arithmetic wraps modulo 2^96.
///
/// Keys order the same way their big-endian encodings do, most significant
/// word first.
#[derive(
  Clone, Copy, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Key(u128);
impl Key {
  pub const ZERO: Key = Key(0);
  pub const MAX: Key = Key(MASK);
  /// Half of the ring. No distance ever exceeds it.
  pub const HALF: Key = Key(1u128 << (KEY_BITS - 1));

  pub fn new(value: u128) -> Key {
    Key(value & MASK)
  }

  pub fn value(&self) -> u128 {
    self.0
  }

  /// SHA-1 of `bytes`, truncated to the first 12 bytes of the digest.
  pub fn hash(bytes: &[u8]) -> Key {
    let digest = Sha1::digest(bytes);
    let mut buf = [0u8; KEY_BYTES];
    buf.copy_from_slice(&digest[..KEY_BYTES]);
    Key::from_bytes(&buf)
  }

  pub fn from_bytes(buf: &[u8; KEY_BYTES]) -> Key {
    Key(buf.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128))
  }

  pub fn to_bytes(&self) -> [u8; KEY_BYTES] {
    let mut buf = [0u8; KEY_BYTES];
    for (i, b) in buf.iter_mut().enumerate() {
      *b = (self.0 >> (8 * (KEY_BYTES - 1 - i))) as u8;
    }
    buf
  }

  pub fn add(&self, other: &Key) -> Key {
    Key(self.0.wrapping_add(other.0) & MASK)
  }

  pub fn sub(&self, other: &Key) -> Key {
    Key(self.0.wrapping_sub(other.0) & MASK)
  }

  /// The shorter of the two arcs between `self` and `other`.
  pub fn distance(&self, other: &Key) -> Key {
    std::cmp::min(self.sub(other), other.sub(self))
  }

  /// True iff walking clockwise from `left` reaches `self` at or before
  /// `right`. With `left == right` only `self == left` qualifies.
  pub fn between(&self, left: &Key, right: &Key) -> bool {
    if left == right {
      return self == left;
    }
    self.sub(left) <= right.sub(left)
  }

  /// Number of leading base-4 digits shared with `other`. Saturates at
  /// `DIGITS - 1`, the last routing table row.
  pub fn prefix_length(&self, other: &Key) -> usize {
    let diff = self.0 ^ other.0;
    if diff == 0 {
      return DIGITS - 1;
    }
    let zeros = diff.leading_zeros() - (128 - KEY_BITS);
    std::cmp::min((zeros / DIGIT_BITS) as usize, DIGITS - 1)
  }

  /// The `i`th digit, counting from the most significant end.
  pub fn digit(&self, i: usize) -> usize {
    debug_assert!(i < DIGITS);
    let shift = KEY_BITS - DIGIT_BITS * (i as u32 + 1);
    ((self.0 >> shift) & (BASE as u128 - 1)) as usize
  }

  /// Renders the key in base 4 or base 16. Returns `None` for any other base.
  pub fn to_string_base(&self, base: u32) -> Option<String> {
    match base {
      16 => Some(format!("{:024x}", self.0)),
      4 => Some((0..DIGITS).map(|i| (b'0' + self.digit(i) as u8) as char).collect()),
      _ => None,
    }
  }
}
impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:024x}", self.0)
  }
}
impl fmt::Debug for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Key({:024x})", self.0)
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseKeyError {
  #[error("key string has {0} hex digits, at most 24 allowed")]
  TooLong(usize),
  #[error("key string is not hexadecimal: {0}")]
  NotHex(String),
}

impl FromStr for Key {
  type Err = ParseKeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() > KEY_BYTES * 2 {
      return Err(ParseKeyError::TooLong(s.len()));
    }
    if s.is_empty() {
      return Err(ParseKeyError::NotHex(s.to_string()));
    }
    u128::from_str_radix(s, 16)
      .map(Key::new)
      .map_err(|_| ParseKeyError::NotHex(s.to_string()))
  }
}

#[test]
fn test_ring_arithmetic() {
  let keys = [
    Key::ZERO,
    Key::new(1),
    Key::HALF,
    Key::MAX,
    Key::hash(b"127.0.0.1:16783"),
    Key::hash(b"scribe"),
  ];
  for a in keys.iter() {
    assert_eq!(a.distance(a), Key::ZERO);
    for b in keys.iter() {
      assert_eq!(a.distance(b), b.distance(a));
      assert!(a.distance(b) <= Key::HALF);
    }
    if *a != Key::ZERO {
      let wrapped = a.add(&Key::MAX.sub(&a.sub(&Key::new(1))));
      assert_eq!(wrapped, Key::ZERO);
    }
  }
  assert_eq!(Key::MAX.add(&Key::new(1)), Key::ZERO);
  assert_eq!(Key::ZERO.sub(&Key::new(1)), Key::MAX);
  assert_eq!(Key::ZERO.distance(&Key::MAX), Key::new(1));
}

#[test]
fn test_between() {
  let x = Key::new(500);
  assert!(!Key::new(7).between(&x, &x));
  assert!(x.between(&x, &x));
  assert!(Key::new(10).between(&Key::new(5), &Key::new(20)));
  assert!(Key::new(5).between(&Key::new(5), &Key::new(20)));
  assert!(Key::new(20).between(&Key::new(5), &Key::new(20)));
  assert!(!Key::new(21).between(&Key::new(5), &Key::new(20)));
  // Wraps through zero.
  assert!(Key::new(2).between(&Key::MAX, &Key::new(3)));
  assert!(Key::ZERO.between(&Key::MAX, &Key::new(3)));
  // Interior antisymmetry.
  let (l, r, t) = (Key::new(100), Key::new(900), Key::new(300));
  assert!(t.between(&l, &r));
  assert!(!t.between(&r, &l));
}

#[test]
fn test_prefix_length() {
  let k = Key::hash(b"prefix");
  assert_eq!(k.prefix_length(&k), DIGITS - 1);
  let last = Key::new(k.value() ^ 1);
  assert_eq!(k.prefix_length(&last), DIGITS - 1);
  let first = Key::new(k.value() ^ (1u128 << (KEY_BITS - 1)));
  assert_eq!(k.prefix_length(&first), 0);
  let third = Key::new(k.value() ^ (1u128 << (KEY_BITS - 5)));
  assert_eq!(k.prefix_length(&third), 2);
}

#[test]
fn test_digits_and_strings() {
  let k = Key::new(0x1b);
  assert_eq!(k.digit(DIGITS - 1), 3);
  assert_eq!(k.digit(DIGITS - 2), 2);
  assert_eq!(k.digit(DIGITS - 3), 1);
  assert_eq!(k.digit(0), 0);
  let b4 = k.to_string_base(4).unwrap();
  assert_eq!(b4.len(), DIGITS);
  assert!(b4.ends_with("0123"));
  assert_eq!(k.to_string_base(16).unwrap(), "00000000000000000000001b");
  assert_eq!(k.to_string_base(2), None);
  let h = Key::hash(b"hello");
  assert_eq!(h.to_string().parse::<Key>(), Ok(h));
  assert_eq!(Key::from_bytes(&h.to_bytes()), h);
  // First 12 bytes of SHA-1("hello").
  assert_eq!(h.to_string(), "aaf4c61ddcc5e8a2dabede0f");
}
