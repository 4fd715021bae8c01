//! Length-Object-Body packet framing.
//!
//! Every message in the protocol is one LOB frame:
//!
//! ```text
//! +----------------------+----------------------------+
//! | u16 head_len (BE)    | length of the head         |
//! +----------------------+----------------------------+
//! | head                 | empty, csid byte, or JSON  |
//! +----------------------+----------------------------+
//! | body                 | rest of the datagram       |
//! +----------------------+----------------------------+
//! ```
//!
//! The head length selects the interpretation: `0` means a line-sealed
//! packet, `1` means a handshake (the byte is the cipher-set id), and 2+
//! bytes must be a strict JSON object carrying a channel or handshake
//! header.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;
pub mod path;

pub use error::LobError;
pub use frame::{parse_json_head, Head, Packet};
pub use header::{ChannelHeader, HandshakeHeader, MAX_MISS};
pub use path::PathAddr;
