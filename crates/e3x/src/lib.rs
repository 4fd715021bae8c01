//! Encrypted peer-to-peer exchanges with multiplexed channels.
//!
//! An [`Endpoint`] holds local cipher-suite keys and any number of
//! datagram transports. Dialing a peer's [`Identity`] establishes an
//! [`Exchange`]: an encrypted session identified on the wire by a 16-byte
//! token. Applications talk over [`Channel`]s, optionally reliable
//! substreams multiplexed inside the exchange.
//!
//! ```no_run
//! use e3x::{Endpoint, EndpointConfig, UdpConfig};
//! use e3x_cipherset::CipherSet;
//!
//! # async fn example() -> Result<(), e3x::Error> {
//! let endpoint = Endpoint::new(
//!     vec![CipherSet::generate(0x3a)?],
//!     EndpointConfig::default(),
//! )?;
//! endpoint
//!     .add_transport(UdpConfig::default().open().await?)
//!     .await;
//!
//! endpoint
//!     .listen("echo", |channel| async move {
//!         while let Ok(Some(payload)) = channel.read().await {
//!             let _ = channel.write(payload).await;
//!         }
//!     })
//!     .await;
//!
//! endpoint.start().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod channel;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod identity;
pub mod paths;
pub mod transport;
pub mod udp;

pub use bridge::Bridge;
pub use channel::{Channel, ChannelStats};
pub use endpoint::{Endpoint, EndpointConfig, Event};
pub use error::Error;
pub use exchange::{Exchange, ExchangeStats, ExchangeStatus};
pub use identity::Identity;
pub use paths::{Path, PathCategory, PathSet};
pub use transport::{Mux, Transport};
pub use udp::{UdpConfig, UdpTransport};

pub use e3x_cipherset::{CipherSet, Token};
pub use e3x_hashname::Hashname;
pub use e3x_lob::PathAddr;
