use crate::core::{DecodeError, Key, Reader, Writer, KEY_BYTES};

/// A routed overlay message.
///
/// `dst` is where the overlay routes it. `src` is its semantic origin; the
/// tree layer puts the group key there.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
  pub dst: Key,
  pub src: Key,
  pub port: u16,
  pub kind: u16,
  pub payload: Vec<u8>,
}
impl Message {
  pub const HEADER_SIZE: usize = 2 * KEY_BYTES + 2 + 2 + 2;

  pub fn new(dst: Key, src: Key, port: u16, kind: u16, payload: Vec<u8>) -> Message {
    Message {
      dst,
      src,
      port,
      kind,
      payload,
    }
  }

  pub fn size(&self) -> usize {
    self.payload.len()
  }

  /// Callers keep payloads under [`MAX_PAYLOAD`](crate::core::MAX_PAYLOAD).
  pub fn put(&self, w: &mut Writer) {
    w.put_key(&self.dst);
    w.put_key(&self.src);
    w.put_u16(self.port);
    w.put_u16(self.kind);
    w.put_u16(self.payload.len() as u16);
    w.put_bytes(&self.payload);
  }

  pub fn take(r: &mut Reader<'_>) -> Result<Message, DecodeError> {
    let dst = r.read_key("destination key")?;
    let src = r.read_key("source key")?;
    let port = r.read_u16("port")?;
    let kind = r.read_u16("message type")?;
    let size = r.read_u16("payload size")? as usize;
    let payload = r.read_bytes("payload", size)?.to_vec();
    Ok(Message {
      dst,
      src,
      port,
      kind,
      payload,
    })
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = Writer::with_capacity(Self::HEADER_SIZE + self.payload.len());
    self.put(&mut w);
    w.into_inner()
  }

  pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    Message::take(&mut Reader::new(buf))
  }
}

#[test]
fn test_message_codec() {
  let msg = Message::new(
    Key::hash(b"dst"),
    Key::hash(b"src"),
    16783,
    54,
    b"multicast payload".to_vec(),
  );
  let buf = msg.encode();
  assert_eq!(buf.len(), Message::HEADER_SIZE + msg.size());
  assert_eq!(&buf[24..26], &16783u16.to_be_bytes());
  assert_eq!(&buf[28..30], &17u16.to_be_bytes());
  assert_eq!(Message::decode(&buf), Ok(msg.clone()));

  let empty = Message::new(Key::ZERO, Key::MAX, 0, 1, vec![]);
  assert_eq!(Message::decode(&empty.encode()), Ok(empty));

  // Declared size larger than what arrived.
  assert!(matches!(
    Message::decode(&buf[..buf.len() - 1]),
    Err(DecodeError::Truncated { field: "payload", .. })
  ));
  assert!(Message::decode(&buf[..10]).is_err());
}
