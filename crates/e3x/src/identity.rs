//! Peer identities: keys, parts, hashname and paths.

use std::collections::BTreeMap;
use std::fmt;

use data_encoding::BASE32_NOPAD;
use e3x_hashname::{parts_from_keys, Hashname, Keys, Parts};
use e3x_lob::PathAddr;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Everything needed to reach and verify one peer.
///
/// Construction enforces the identity invariants: the hashname matches the
/// parts and every part is the digest of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    hashname: Hashname,
    keys: Keys,
    parts: Parts,
    paths: Vec<PathAddr>,
}

impl Identity {
    /// Build an identity from public keys and reachable paths.
    pub fn new(keys: Keys, paths: Vec<PathAddr>) -> Result<Self, Error> {
        if paths.is_empty() {
            return Err(Error::NoPath);
        }
        let parts = parts_from_keys(&keys)?;
        let hashname = Hashname::from_intermediates(&parts)?;
        Ok(Identity {
            hashname,
            keys,
            parts,
            paths,
        })
    }

    /// The peer's hashname.
    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    /// Public keys by csid.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Parts by csid.
    pub fn parts(&self) -> &Parts {
        &self.parts
    }

    /// Paths the peer is reachable on.
    pub fn paths(&self) -> &[PathAddr] {
        &self.paths
    }

    /// Highest csid present in both this identity and `local`.
    pub fn best_csid(&self, local: &[u8]) -> Option<u8> {
        self.keys
            .keys()
            .rev()
            .find(|csid| local.contains(csid))
            .copied()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hashname)
    }
}

// The JSON form spells csids as two hex chars and keys as base32, the same
// encodings the wire uses.
#[derive(Serialize, Deserialize)]
struct IdentityDoc {
    hashname: String,
    keys: BTreeMap<String, String>,
    parts: BTreeMap<String, String>,
    paths: Vec<PathAddr>,
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let doc = IdentityDoc {
            hashname: self.hashname.to_string(),
            keys: self
                .keys
                .iter()
                .map(|(csid, key)| {
                    (
                        format!("{csid:02x}"),
                        BASE32_NOPAD.encode(key).to_ascii_lowercase(),
                    )
                })
                .collect(),
            parts: self
                .parts
                .iter()
                .map(|(csid, part)| (format!("{csid:02x}"), part.clone()))
                .collect(),
            paths: self.paths.clone(),
        };
        doc.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = IdentityDoc::deserialize(deserializer)?;

        let mut keys = Keys::new();
        for (csid, key) in doc.keys {
            let csid = u8::from_str_radix(&csid, 16).map_err(D::Error::custom)?;
            let key = BASE32_NOPAD
                .decode(key.to_ascii_uppercase().as_bytes())
                .map_err(D::Error::custom)?;
            keys.insert(csid, key);
        }

        let identity =
            Identity::new(keys, doc.paths).map_err(|e| D::Error::custom(e.to_string()))?;

        // The stated hashname must match the keys; a mismatch means a
        // forged or corrupted document.
        let stated: Hashname = doc.hashname.parse().map_err(D::Error::custom)?;
        if stated != identity.hashname {
            return Err(D::Error::custom("hashname does not match keys"));
        }
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e3x_cipherset::CipherSet;

    fn identity() -> Identity {
        let cs = CipherSet::generate(0x3a).unwrap();
        let mut keys = Keys::new();
        keys.insert(0x3a, cs.public_key());
        Identity::new(
            keys,
            vec![PathAddr::Udp4 {
                ip: "127.0.0.1".parse().unwrap(),
                port: 4242,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_json_roundtrip() {
        let ident = identity();
        let text = serde_json::to_string(&ident).unwrap();
        let back: Identity = serde_json::from_str(&text).unwrap();
        assert_eq!(back, ident);
    }

    #[test]
    fn test_forged_hashname_rejected() {
        let ident = identity();
        let other = identity();
        let mut doc: serde_json::Value = serde_json::to_value(&ident).unwrap();
        doc["hashname"] = serde_json::Value::from(other.hashname().to_string());
        assert!(serde_json::from_value::<Identity>(doc).is_err());
    }

    #[test]
    fn test_no_paths_rejected() {
        let cs = CipherSet::generate(0x3a).unwrap();
        let mut keys = Keys::new();
        keys.insert(0x3a, cs.public_key());
        assert!(matches!(
            Identity::new(keys, vec![]),
            Err(Error::NoPath)
        ));
    }

    #[test]
    fn test_best_csid() {
        let ident = identity();
        assert_eq!(ident.best_csid(&[0x3a, 0x1a]), Some(0x3a));
        assert_eq!(ident.best_csid(&[0x1a]), None);
    }
}
