//! Transport path addresses and their JSON form.
//!
//! Paths travel inside handshake headers as tagged JSON objects, e.g.
//! `{"type":"udp4","ip":"1.2.3.4","port":4242}`. Types nobody claims are
//! carried through untouched so future transports can use them.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::LobError;

/// A transport-level address for reaching a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathAddr {
    /// IPv4 UDP address.
    Udp4 {
        /// Remote IP.
        ip: Ipv4Addr,
        /// Remote port.
        port: u16,
    },
    /// IPv6 UDP address.
    Udp6 {
        /// Remote IP.
        ip: Ipv6Addr,
        /// Remote port.
        port: u16,
    },
    /// Relay path through a bridge, identified by hex token.
    Relay {
        /// Hex-encoded 16-byte token.
        token: String,
    },
    /// A path type this endpoint does not claim. Preserved verbatim.
    Other(Value),
}

impl PathAddr {
    /// Wrap a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => PathAddr::Udp4 {
                ip: *a.ip(),
                port: a.port(),
            },
            SocketAddr::V6(a) => PathAddr::Udp6 {
                ip: *a.ip(),
                port: a.port(),
            },
        }
    }

    /// Socket address for UDP paths, `None` otherwise.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PathAddr::Udp4 { ip, port } => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            PathAddr::Udp6 { ip, port } => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            _ => None,
        }
    }

    /// The `type` tag this address serializes with.
    pub fn kind(&self) -> &str {
        match self {
            PathAddr::Udp4 { .. } => "udp4",
            PathAddr::Udp6 { .. } => "udp6",
            PathAddr::Relay { .. } => "relay",
            PathAddr::Other(v) => v
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }

    /// Build from a JSON value, validating claimed types.
    pub fn from_value(v: Value) -> Result<Self, LobError> {
        let kind = v.get("type").and_then(Value::as_str);
        match kind {
            Some("udp4") | Some("udp6") => {
                let ip = v
                    .get("ip")
                    .and_then(Value::as_str)
                    .ok_or(LobError::InvalidPath)?;
                let port = v
                    .get("port")
                    .and_then(Value::as_u64)
                    .ok_or(LobError::InvalidPath)?;
                if port == 0 || port >= 65535 {
                    return Err(LobError::InvalidPath);
                }
                let ip: IpAddr = ip.parse().map_err(|_| LobError::InvalidPath)?;
                if ip.is_unspecified() {
                    return Err(LobError::InvalidPath);
                }
                match (kind, ip) {
                    (Some("udp4"), IpAddr::V4(ip)) => Ok(PathAddr::Udp4 {
                        ip,
                        port: port as u16,
                    }),
                    (Some("udp6"), IpAddr::V6(ip)) => Ok(PathAddr::Udp6 {
                        ip,
                        port: port as u16,
                    }),
                    _ => Err(LobError::InvalidPath),
                }
            }
            Some("relay") => {
                let token = v
                    .get("token")
                    .and_then(Value::as_str)
                    .ok_or(LobError::InvalidPath)?;
                Ok(PathAddr::Relay {
                    token: token.to_string(),
                })
            }
            _ => Ok(PathAddr::Other(v)),
        }
    }

    /// The tagged JSON form.
    pub fn to_value(&self) -> Value {
        match self {
            PathAddr::Udp4 { ip, port } => {
                json!({"type": "udp4", "ip": ip.to_string(), "port": port})
            }
            PathAddr::Udp6 { ip, port } => {
                json!({"type": "udp6", "ip": ip.to_string(), "port": port})
            }
            PathAddr::Relay { token } => json!({"type": "relay", "token": token}),
            PathAddr::Other(v) => v.clone(),
        }
    }
}

impl fmt::Display for PathAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathAddr::Udp4 { ip, port } => write!(f, "udp4:{}:{}", ip, port),
            PathAddr::Udp6 { ip, port } => write!(f, "udp6:[{}]:{}", ip, port),
            PathAddr::Relay { token } => write!(f, "relay:{}", token),
            PathAddr::Other(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for PathAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PathAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        PathAddr::from_value(v).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp4_roundtrip() {
        let path = PathAddr::Udp4 {
            ip: "1.2.3.4".parse().unwrap(),
            port: 4242,
        };
        let text = serde_json::to_string(&path).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"type":"udp4","ip":"1.2.3.4","port":4242})
        );
        assert_eq!(serde_json::from_str::<PathAddr>(&text).unwrap(), path);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let raw = json!({"type":"webrtc","sdp":"abc"});
        let path: PathAddr = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(path, PathAddr::Other(raw.clone()));
        assert_eq!(serde_json::to_value(&path).unwrap(), raw);
        assert_eq!(path.kind(), "webrtc");
    }

    #[test]
    fn test_claimed_type_validated() {
        for bad in [
            json!({"type":"udp4","ip":"0.0.0.0","port":42}),
            json!({"type":"udp4","ip":"1.2.3.4","port":0}),
            json!({"type":"udp4","ip":"1.2.3.4","port":65535}),
            json!({"type":"udp4","ip":"not-an-ip","port":42}),
            json!({"type":"udp6","ip":"1.2.3.4","port":42}),
        ] {
            assert!(serde_json::from_value::<PathAddr>(bad).is_err());
        }
    }

    #[test]
    fn test_socket_addr_conversion() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let path = PathAddr::from_socket_addr(addr);
        assert_eq!(path.socket_addr(), Some(addr));
        assert_eq!(path.kind(), "udp4");
    }
}
