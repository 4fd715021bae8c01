//! LOB frame encoding and decoding.
//!
//! Every datagram on the wire is one frame: a big-endian `u16` head length,
//! the head itself, and the rest of the bytes as the body. The first bytes
//! of the head decide how a frame is routed, so classification happens at
//! decode time.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde_json::{Map, Value};

use crate::error::LobError;

/// Decoded head of a LOB frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    /// No head. The body is a line-sealed packet.
    Empty,
    /// Single-byte head carrying a cipher-set id. The body is handshake
    /// ciphertext.
    Csid(u8),
    /// JSON object head. The body is channel payload.
    Json(Map<String, Value>),
}

/// One decoded LOB frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Decoded head.
    pub head: Head,
    /// Body bytes, untouched by the codec.
    pub body: Bytes,
}

impl Packet {
    /// Frame with no head.
    pub fn raw(body: Bytes) -> Self {
        Packet {
            head: Head::Empty,
            body,
        }
    }

    /// Frame with a one-byte cipher-set head.
    pub fn handshake(csid: u8, body: Bytes) -> Self {
        Packet {
            head: Head::Csid(csid),
            body,
        }
    }

    /// Frame with a JSON object head.
    pub fn json(head: Map<String, Value>, body: Bytes) -> Self {
        Packet {
            head: Head::Json(head),
            body,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Bytes, LobError> {
        let head_bytes = match &self.head {
            Head::Empty => Bytes::new(),
            Head::Csid(csid) => Bytes::copy_from_slice(&[*csid]),
            Head::Json(map) => {
                // serde_json writes maps without duplicate keys.
                Bytes::from(serde_json::to_vec(map)?)
            }
        };

        if head_bytes.len() > u16::MAX as usize {
            return Err(LobError::HeadTooLarge(head_bytes.len()));
        }

        let mut buf = BytesMut::with_capacity(2 + head_bytes.len() + self.body.len());
        buf.put_u16(head_bytes.len() as u16);
        buf.put_slice(&head_bytes);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decode a frame from wire bytes.
    ///
    /// The declared head length is checked against the remaining bytes
    /// before anything is copied, so a hostile length prefix cannot force
    /// an allocation.
    pub fn decode(mut bytes: Bytes) -> Result<Self, LobError> {
        if bytes.len() < 2 {
            return Err(LobError::ShortFrame);
        }

        let head_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let remaining = bytes.len() - 2;
        if head_len > remaining {
            return Err(LobError::Truncated {
                declared: head_len,
                remaining,
            });
        }

        let _prefix = bytes.split_to(2);
        let head_bytes = bytes.split_to(head_len);
        let body = bytes;

        let head = match head_len {
            0 => Head::Empty,
            1 => Head::Csid(head_bytes[0]),
            _ => {
                if head_bytes[0] != b'{' {
                    return Err(LobError::NotJson);
                }
                Head::Json(parse_json_head(&head_bytes)?)
            }
        };

        Ok(Packet { head, body })
    }
}

/// Parse a JSON object head, rejecting duplicate keys.
pub fn parse_json_head(bytes: &[u8]) -> Result<Map<String, Value>, LobError> {
    struct HeadVisitor;

    impl<'de> Visitor<'de> for HeadVisitor {
        type Value = Result<Map<String, Value>, String>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a json object")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut map = Map::new();
            while let Some((key, value)) = access.next_entry::<String, Value>()? {
                if map.insert(key.clone(), value).is_some() {
                    return Ok(Err(key));
                }
            }
            Ok(Ok(map))
        }
    }

    let mut de = serde_json::Deserializer::from_slice(bytes);
    match de.deserialize_map(HeadVisitor)? {
        Ok(map) => {
            de.end()?;
            Ok(map)
        }
        Err(key) => Err(LobError::DuplicateKey(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip() {
        let pkt = Packet::raw(Bytes::from_static(b"line sealed bytes"));
        let wire = pkt.encode().unwrap();
        assert_eq!(&wire[..2], &[0, 0]);
        assert_eq!(Packet::decode(wire).unwrap(), pkt);
    }

    #[test]
    fn test_csid_roundtrip() {
        let pkt = Packet::handshake(0x3a, Bytes::from_static(b"ciphertext"));
        let wire = pkt.encode().unwrap();
        assert_eq!(&wire[..3], &[0, 1, 0x3a]);
        assert_eq!(Packet::decode(wire).unwrap(), pkt);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut head = Map::new();
        head.insert("c".into(), Value::from("ab12"));
        head.insert("seq".into(), Value::from(7));
        let pkt = Packet::json(head, Bytes::from_static(b"payload"));

        let wire = pkt.encode().unwrap();
        let decoded = Packet::decode(wire.clone()).unwrap();
        assert_eq!(decoded, pkt);

        // decode(encode(decode(F))) == decode(F)
        let rewire = decoded.encode().unwrap();
        assert_eq!(Packet::decode(rewire).unwrap(), Packet::decode(wire).unwrap());
    }

    #[test]
    fn test_overlong_head_rejected() {
        // Declares an 8-byte head with only 3 bytes present.
        let wire = Bytes::from_static(&[0x00, 0x08, b'{', b'}', b'x']);
        assert!(matches!(
            Packet::decode(wire),
            Err(LobError::Truncated {
                declared: 8,
                remaining: 3
            })
        ));
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(
            Packet::decode(Bytes::from_static(&[0x00])),
            Err(LobError::ShortFrame)
        ));
    }

    #[test]
    fn test_non_json_head_rejected() {
        let wire = Bytes::from_static(&[0x00, 0x02, b'h', b'i']);
        assert!(matches!(Packet::decode(wire), Err(LobError::NotJson)));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let head = br#"{"c":"1","c":"2"}"#;
        let mut wire = BytesMut::new();
        wire.put_u16(head.len() as u16);
        wire.put_slice(head);
        assert!(matches!(
            Packet::decode(wire.freeze()),
            Err(LobError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_empty_body_ok() {
        let pkt = Packet::handshake(0x3a, Bytes::new());
        let decoded = Packet::decode(pkt.encode().unwrap()).unwrap();
        assert!(decoded.body.is_empty());
    }
}
