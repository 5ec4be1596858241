use crate::core::{Key, Message, KEY_BYTES};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Largest UDP payload we will put on the wire.
pub const MAX_DATAGRAM: usize = 65507;
/// Largest message payload that still fits in one datagram.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - NetworkHeader::SIZE - Message::HEADER_SIZE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
  #[error("truncated {field}: need {need} bytes, have {have}")]
  Truncated {
    field: &'static str,
    need: usize,
    have: usize,
  },
  #[error("unknown ack flag {0}")]
  BadAckFlag(u32),
  #[error("expected ':' after the host record")]
  BadSeparator,
  #[error("group name is not valid UTF-8")]
  BadName,
}

/// Length-checked cursor over a received buffer. Every read validates the
/// remaining length first.
pub struct Reader<'a> {
  buf: &'a [u8],
  pos: usize,
}
impl<'a> Reader<'a> {
  pub fn new(buf: &'a [u8]) -> Self {
    Reader { buf, pos: 0 }
  }

  pub fn remaining(&self) -> usize {
    self.buf.len() - self.pos
  }

  pub fn is_empty(&self) -> bool {
    self.remaining() == 0
  }

  pub fn read_bytes(
    &mut self,
    field: &'static str,
    len: usize,
  ) -> Result<&'a [u8], DecodeError> {
    if self.remaining() < len {
      return Err(DecodeError::Truncated {
        field,
        need: len,
        have: self.remaining(),
      });
    }
    let slice = &self.buf[self.pos..self.pos + len];
    self.pos += len;
    Ok(slice)
  }

  pub fn read_u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
    Ok(self.read_bytes(field, 1)?[0])
  }

  pub fn read_u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
    let b = self.read_bytes(field, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
  }

  pub fn read_u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
    let b = self.read_bytes(field, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
  }

  pub fn read_key(&mut self, field: &'static str) -> Result<Key, DecodeError> {
    let mut buf = [0u8; KEY_BYTES];
    buf.copy_from_slice(self.read_bytes(field, KEY_BYTES)?);
    Ok(Key::from_bytes(&buf))
  }

  pub fn rest(&mut self) -> &'a [u8] {
    let slice = &self.buf[self.pos..];
    self.pos = self.buf.len();
    slice
  }
}

#[derive(Default)]
pub struct Writer {
  buf: Vec<u8>,
}
impl Writer {
  pub fn with_capacity(cap: usize) -> Self {
    Writer {
      buf: Vec::with_capacity(cap),
    }
  }

  pub fn put_u8(&mut self, v: u8) {
    self.buf.push(v);
  }

  pub fn put_u16(&mut self, v: u16) {
    self.buf.extend_from_slice(&v.to_be_bytes());
  }

  pub fn put_u32(&mut self, v: u32) {
    self.buf.extend_from_slice(&v.to_be_bytes());
  }

  pub fn put_key(&mut self, key: &Key) {
    self.buf.extend_from_slice(&key.to_bytes());
  }

  pub fn put_bytes(&mut self, bytes: &[u8]) {
    self.buf.extend_from_slice(bytes);
  }

  pub fn into_inner(self) -> Vec<u8> {
    self.buf
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum AckFlag {
  /// The datagram is a bare acknowledgement of `seq`.
  Ack = 0,
  /// A message follows and the sender wants `seq` acknowledged.
  Required = 1,
  /// A message follows, no acknowledgement wanted.
  NoAck = 2,
}

/*
Every datagram starts with this header. A bare ack is just the header; the
other two flags are followed by an encoded Message.
 */
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetworkHeader {
  pub flag: AckFlag,
  pub seq: u32,
}
impl NetworkHeader {
  pub const SIZE: usize = 8;

  pub fn put(&self, w: &mut Writer) {
    w.put_u32(self.flag.into());
    w.put_u32(self.seq);
  }

  pub fn take(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
    let raw = r.read_u32("ack flag")?;
    let flag = AckFlag::try_from(raw).map_err(|_| DecodeError::BadAckFlag(raw))?;
    let seq = r.read_u32("sequence number")?;
    Ok(NetworkHeader { flag, seq })
  }
}

/// Builds a whole datagram. `msg` is ignored for bare acks.
pub fn encode_datagram(header: NetworkHeader, msg: Option<&Message>) -> Vec<u8> {
  let len = msg.map(|m| Message::HEADER_SIZE + m.payload.len()).unwrap_or(0);
  let mut w = Writer::with_capacity(NetworkHeader::SIZE + len);
  header.put(&mut w);
  if header.flag != AckFlag::Ack {
    if let Some(m) = msg {
      m.put(&mut w);
    }
  }
  w.into_inner()
}

/// Wire identity of a host: key, IPv4 address and port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HostRecord {
  pub key: Key,
  pub addr: SocketAddrV4,
}
impl HostRecord {
  pub const SIZE: usize = KEY_BYTES + 4 + 2;

  pub fn put(&self, w: &mut Writer) {
    w.put_key(&self.key);
    w.put_u32(u32::from(*self.addr.ip()));
    w.put_u16(self.addr.port());
  }

  pub fn take(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
    let key = r.read_key("host key")?;
    let ip = Ipv4Addr::from(r.read_u32("host address")?);
    let port = r.read_u16("host port")?;
    Ok(HostRecord {
      key,
      addr: SocketAddrV4::new(ip, port),
    })
  }
}

#[test]
fn test_network_header() {
  let header = NetworkHeader {
    flag: AckFlag::Required,
    seq: 0x8b5d7015,
  };
  let buf = encode_datagram(header, None);
  assert_eq!(buf, vec![0, 0, 0, 1, 0x8b, 0x5d, 0x70, 0x15]);
  assert_eq!(NetworkHeader::take(&mut Reader::new(&buf)), Ok(header));
  let bad = [0u8, 0, 0, 9, 0, 0, 0, 1];
  assert_eq!(
    NetworkHeader::take(&mut Reader::new(&bad)),
    Err(DecodeError::BadAckFlag(9))
  );
}

#[test]
fn test_host_record() {
  let record = HostRecord {
    key: Key::hash(b"10.0.0.7:4000"),
    addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 4000),
  };
  let mut w = Writer::default();
  record.put(&mut w);
  let buf = w.into_inner();
  assert_eq!(buf.len(), HostRecord::SIZE);
  assert_eq!(&buf[12..16], &[10, 0, 0, 7]);
  assert_eq!(HostRecord::take(&mut Reader::new(&buf)), Ok(record));
  assert!(matches!(
    HostRecord::take(&mut Reader::new(&buf[..17])),
    Err(DecodeError::Truncated { field: "host port", need: 2, have: 1 })
  ));
}
