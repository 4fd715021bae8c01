//! Cipher-set error types.

use thiserror::Error;

/// Errors from cipher-set operations.
///
/// Every authentication or decryption failure collapses into [`Mac`]; the
/// caller learns nothing about which step failed.
///
/// [`Mac`]: CipherError::Mac
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CipherError {
    /// MAC verification or decryption failed.
    #[error("mac failure")]
    Mac,

    /// Packet too short for the cipher-set layout.
    #[error("short packet")]
    ShortPacket,

    /// No cipher suite registered for this csid.
    #[error("unknown csid {0:#04x}")]
    UnknownCsid(u8),

    /// Key bytes had the wrong length.
    #[error("invalid key")]
    InvalidKey,
}
