//! Endpoint error types.

use thiserror::Error;

/// Errors surfaced by endpoints, exchanges and channels.
///
/// `BadFrame`, `Crypto`, `UnknownToken` and `ReplayedHandshake` never reach
/// callers: the dispatch loop logs them at debug and drops the packet.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed LOB frame.
    #[error("bad frame: {0}")]
    BadFrame(#[from] e3x_lob::LobError),

    /// MAC or decrypt failure, or no shared cipher suite.
    #[error("crypto failure")]
    Crypto,

    /// Line packet whose token matches no exchange.
    #[error("unknown token")]
    UnknownToken,

    /// Handshake whose `at` does not exceed the last accepted one.
    #[error("replayed handshake")]
    ReplayedHandshake,

    /// No usable path to the peer.
    #[error("no path")]
    NoPath,

    /// Dial gave up waiting for the exchange to open.
    #[error("handshake timeout")]
    HandshakeTimeout,

    /// The exchange closed underneath the operation.
    #[error("exchange closed")]
    ExchangeClosed,

    /// The channel is closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer terminated the channel with an error.
    #[error("channel error: {0}")]
    ChannelErr(String),

    /// Inbound channel of a type no handler is registered for.
    #[error("unknown channel type: {0}")]
    ChannelType(String),

    /// The congestion window is full and the caller asked not to wait.
    #[error("backpressure")]
    Backpressure,

    /// A read or write deadline passed.
    #[error("deadline exceeded")]
    Timeout,

    /// The operation was cancelled by endpoint shutdown.
    #[error("cancelled")]
    Cancelled,

    /// All transports are gone.
    #[error("transport closed")]
    TransportClosed,

    /// Invalid endpoint construction.
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// Transport-level I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<e3x_cipherset::CipherError> for Error {
    fn from(_: e3x_cipherset::CipherError) -> Self {
        // Cipher failures are indistinguishable to callers.
        Error::Crypto
    }
}

impl From<e3x_hashname::HashnameError> for Error {
    fn from(e: e3x_hashname::HashnameError) -> Self {
        Error::ConfigInvalid(e.to_string())
    }
}
