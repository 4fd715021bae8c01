//! Typed JSON heads for channel and handshake packets.

use e3x_hashname::{Hashname, Parts};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LobError;
use crate::path::PathAddr;

/// Most `miss` entries a single header may carry.
pub const MAX_MISS: usize = 100;

/// Head of a channel packet.
///
/// `seq`, `ack` and `miss` only appear on reliable channels. `type` only
/// appears on the first packet from the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelHeader {
    /// Channel id, 16 hex chars chosen by the initiator.
    pub c: String,
    /// Channel type, set on the opening packet only.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Sender sequence number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    /// Highest contiguous sequence received.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<u32>,
    /// Sequences above `ack` still missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miss: Option<Vec<u32>>,
    /// Marks the last payload packet.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
    /// Terminal error; mutually exclusive with further payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl ChannelHeader {
    /// Header addressing an existing channel.
    pub fn new(c: impl Into<String>) -> Self {
        ChannelHeader {
            c: c.into(),
            ..Default::default()
        }
    }

    /// Convert into a raw JSON head.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Parse from a raw JSON head. Caps `miss` at [`MAX_MISS`] entries.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, LobError> {
        let mut hdr: ChannelHeader =
            serde_json::from_value(Value::Object(map.clone()))?;
        if let Some(miss) = &mut hdr.miss {
            miss.truncate(MAX_MISS);
        }
        Ok(hdr)
    }
}

/// Inner head of a handshake packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Hashname the handshake is addressed to.
    pub to: Hashname,
    /// Sender parts, enough to derive the sender hashname. Csids are
    /// spelled as two hex chars on the wire.
    #[serde(with = "parts_hex")]
    pub from: Parts,
    /// Handshake timestamp, strictly increasing per sender.
    pub at: u32,
    /// Paths the sender believes it is reachable on.
    #[serde(default)]
    pub paths: Vec<PathAddr>,
}

mod parts_hex {
    use std::collections::BTreeMap;

    use e3x_hashname::Parts;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(parts: &Parts, serializer: S) -> Result<S::Ok, S::Error> {
        let hex_keyed: BTreeMap<String, &String> = parts
            .iter()
            .map(|(csid, part)| (format!("{csid:02x}"), part))
            .collect();
        hex_keyed.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Parts, D::Error> {
        let hex_keyed: BTreeMap<String, String> = Deserialize::deserialize(deserializer)?;
        let mut parts = Parts::new();
        for (csid, part) in hex_keyed {
            let csid = u8::from_str_radix(&csid, 16)
                .map_err(|_| D::Error::custom("invalid csid"))?;
            parts.insert(csid, part);
        }
        Ok(parts)
    }
}

impl HandshakeHeader {
    /// Convert into a raw JSON head.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Parse from a raw JSON head.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self, LobError> {
        Ok(serde_json::from_value(Value::Object(map.clone()))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_channel_header_roundtrip() {
        let hdr = ChannelHeader {
            c: "a1b2c3d4e5f60718".into(),
            typ: Some("echo".into()),
            seq: Some(0),
            ack: Some(3),
            miss: Some(vec![4, 6]),
            end: false,
            err: None,
        };
        let map = hdr.to_map();
        assert_eq!(map.get("type"), Some(&Value::from("echo")));
        assert!(!map.contains_key("end"));
        assert_eq!(ChannelHeader::from_map(&map).unwrap(), hdr);
    }

    #[test]
    fn test_absent_fields_stay_absent() {
        let hdr = ChannelHeader::new("00ff00ff00ff00ff");
        let map = hdr.to_map();
        assert_eq!(map.len(), 1, "only `c` should serialize: {map:?}");
    }

    #[test]
    fn test_miss_capped() {
        let mut map = ChannelHeader::new("00ff00ff00ff00ff").to_map();
        map.insert(
            "miss".into(),
            Value::from((0..500u32).collect::<Vec<_>>()),
        );
        let hdr = ChannelHeader::from_map(&map).unwrap();
        assert_eq!(hdr.miss.unwrap().len(), MAX_MISS);
    }

    #[test]
    fn test_handshake_header_roundtrip() {
        let mut keys = BTreeMap::new();
        keys.insert(0x3a, b"pk".to_vec());
        let parts = e3x_hashname::parts_from_keys(&keys).unwrap();
        let to = Hashname::from_keys(&keys).unwrap();

        let hdr = HandshakeHeader {
            to,
            from: parts,
            at: 1700000000,
            paths: vec![PathAddr::Udp4 {
                ip: "10.0.0.1".parse().unwrap(),
                port: 4242,
            }],
        };
        let map = hdr.to_map();
        assert_eq!(HandshakeHeader::from_map(&map).unwrap(), hdr);
    }
}
