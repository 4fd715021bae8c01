//! LOB codec error types.

use thiserror::Error;

/// Errors raised while encoding or decoding LOB frames.
#[derive(Error, Debug)]
pub enum LobError {
    /// Frame shorter than the two-byte length prefix.
    #[error("short frame")]
    ShortFrame,

    /// Declared head length exceeds the remaining bytes.
    #[error("truncated head: declared {declared}, remaining {remaining}")]
    Truncated {
        /// Head length from the prefix.
        declared: usize,
        /// Bytes actually present after the prefix.
        remaining: usize,
    },

    /// Head of 2+ bytes that is not a JSON object.
    #[error("head is not a json object")]
    NotJson,

    /// Head JSON failed to parse.
    #[error("invalid json head: {0}")]
    Json(#[from] serde_json::Error),

    /// Head JSON object repeated a key.
    #[error("duplicate key in head: {0}")]
    DuplicateKey(String),

    /// Head too large for the u16 length prefix.
    #[error("head too large: {0} bytes")]
    HeadTooLarge(usize),

    /// A path address claimed a known type but was malformed.
    #[error("invalid path address")]
    InvalidPath,
}
