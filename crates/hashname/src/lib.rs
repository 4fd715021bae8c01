//! Self-certifying hashname identities.
//!
//! A hashname is a 32-byte identifier derived from the set of cipher-set
//! public keys a peer holds. The derivation folds the keys into a rolling
//! SHA-256 in ascending cipher-set order, so the same key set always yields
//! the same hashname no matter how the map was built.
//!
//! The text form is lowercase base32 without padding (52 characters).

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Map of cipher-set id to hex-encoded intermediate hash.
///
/// `BTreeMap` keeps csids in ascending byte order, which is the order the
/// rolling hash consumes them in.
pub type Parts = BTreeMap<u8, String>;

/// Map of cipher-set id to public key bytes.
pub type Keys = BTreeMap<u8, Vec<u8>>;

/// Errors from hashname derivation and parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HashnameError {
    /// The key or parts set was empty.
    #[error("no keys")]
    NoKeys,
    /// A public key had no bytes.
    #[error("empty key for csid {0:#04x}")]
    EmptyKey(u8),
    /// An intermediate was not 32 hex-encoded bytes.
    #[error("invalid intermediate for csid {0:#04x}")]
    InvalidIntermediate(u8),
    /// The text form was not 52 base32 characters.
    #[error("invalid hashname encoding")]
    InvalidEncoding,
}

/// A 32-byte self-certifying peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hashname([u8; 32]);

impl Hashname {
    /// Derive a hashname from a set of cipher-set public keys.
    pub fn from_keys(keys: &Keys) -> Result<Self, HashnameError> {
        Self::from_intermediates_raw(intermediates(keys)?)
    }

    /// Derive a hashname from pre-computed parts (hex intermediates).
    pub fn from_intermediates(parts: &Parts) -> Result<Self, HashnameError> {
        if parts.is_empty() {
            return Err(HashnameError::NoKeys);
        }

        let mut raw = BTreeMap::new();
        for (&csid, part) in parts {
            let bytes =
                hex::decode(part).map_err(|_| HashnameError::InvalidIntermediate(csid))?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| HashnameError::InvalidIntermediate(csid))?;
            raw.insert(csid, arr);
        }
        Self::from_intermediates_raw(raw)
    }

    fn from_intermediates_raw(
        intermediates: BTreeMap<u8, [u8; 32]>,
    ) -> Result<Self, HashnameError> {
        if intermediates.is_empty() {
            return Err(HashnameError::NoKeys);
        }

        // seed = H(seed || csid); seed = H(seed || intermediate)
        let mut seed = [0u8; 32];
        for (csid, part) in intermediates {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update([csid]);
            seed = hasher.finalize().into();

            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(part);
            seed = hasher.finalize().into();
        }

        Ok(Hashname(seed))
    }

    /// Wrap raw hashname bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hashname(bytes)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 base32 characters. A display hint only, never authoritative.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0).to_ascii_lowercase())
    }
}

impl fmt::Debug for Hashname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashname({})", self.short())
    }
}

impl FromStr for Hashname {
    type Err = HashnameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let bytes = BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|_| HashnameError::InvalidEncoding)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| HashnameError::InvalidEncoding)?;
        Ok(Hashname(arr))
    }
}

impl TryFrom<String> for Hashname {
    type Error = HashnameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Hashname> for String {
    fn from(h: Hashname) -> String {
        h.to_string()
    }
}

/// Compute the parts map (csid -> hex intermediate) for a key set.
pub fn parts_from_keys(keys: &Keys) -> Result<Parts, HashnameError> {
    Ok(intermediates(keys)?
        .into_iter()
        .map(|(csid, part)| (csid, hex::encode(part)))
        .collect())
}

fn intermediates(keys: &Keys) -> Result<BTreeMap<u8, [u8; 32]>, HashnameError> {
    if keys.is_empty() {
        return Err(HashnameError::NoKeys);
    }

    let mut out = BTreeMap::new();
    for (&csid, key) in keys {
        if key.is_empty() {
            return Err(HashnameError::EmptyKey(csid));
        }
        let digest: [u8; 32] = Sha256::digest(key).into();
        out.insert(csid, digest);
    }
    Ok(out)
}
