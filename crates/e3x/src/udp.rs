//! UDP transport, the reference datagram transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use e3x_lob::PathAddr;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Error;
use crate::transport::Transport;

/// Largest datagram the transport will accept.
const MAX_DATAGRAM: usize = 65_535;

/// UDP transport configuration. The zero value binds an IPv4 socket on a
/// random port.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// `udp4` or `udp6`.
    pub network: String,
    /// Bind address; empty means all interfaces on a random port.
    pub addr: String,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            network: "udp4".into(),
            addr: String::new(),
        }
    }
}

impl UdpConfig {
    /// Bind the socket and wrap it as a transport.
    pub async fn open(self) -> Result<Arc<UdpTransport>, Error> {
        let default_bind = match self.network.as_str() {
            "udp4" => "0.0.0.0:0",
            "udp6" => "[::]:0",
            other => {
                return Err(Error::ConfigInvalid(format!(
                    "unknown udp network {other:?}"
                )))
            }
        };

        let bind = if self.addr.is_empty() {
            default_bind.to_string()
        } else {
            self.addr.clone()
        };

        let socket = UdpSocket::bind(&bind).await?;
        let local = socket.local_addr()?;

        match (self.network.as_str(), local) {
            ("udp4", SocketAddr::V4(_)) | ("udp6", SocketAddr::V6(_)) => {}
            _ => {
                return Err(Error::ConfigInvalid(format!(
                    "{} is not a {} address",
                    local, self.network
                )))
            }
        }

        Ok(Arc::new(UdpTransport {
            socket,
            network: self.network,
            local,
            closed: AtomicBool::new(false),
            close_wake: Notify::new(),
        }))
    }
}

/// A bound UDP socket speaking one address family.
pub struct UdpTransport {
    socket: UdpSocket,
    network: String,
    local: SocketAddr,
    closed: AtomicBool,
    close_wake: Notify,
}

impl UdpTransport {
    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn read(&self) -> Result<(Bytes, PathAddr), Error> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if self.is_closed() {
                return Err(Error::TransportClosed);
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, src) = result?;
                    let frame = Bytes::copy_from_slice(&buf[..n]);
                    return Ok((frame, PathAddr::from_socket_addr(src)));
                }
                _ = self.close_wake.notified() => {
                    return Err(Error::TransportClosed);
                }
            }
        }
    }

    async fn write(&self, frame: Bytes, dst: &PathAddr) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        let addr = dst.socket_addr().ok_or(Error::NoPath)?;
        let n = self.socket.send_to(&frame, addr).await?;
        if n != frame.len() {
            debug!("short udp write: {n} of {}", frame.len());
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write",
            )));
        }
        Ok(())
    }

    fn claims(&self, dst: &PathAddr) -> bool {
        dst.kind() == self.network
    }

    fn local_addrs(&self) -> Vec<PathAddr> {
        if self.local.ip().is_unspecified() {
            // Wildcard binds report the loopback form; callers that need
            // interface enumeration supply a concrete bind address.
            let loopback: SocketAddr = match self.local {
                SocketAddr::V4(_) => {
                    SocketAddr::new("127.0.0.1".parse().unwrap(), self.local.port())
                }
                SocketAddr::V6(_) => SocketAddr::new("::1".parse().unwrap(), self.local.port()),
            };
            vec![PathAddr::from_socket_addr(loopback)]
        } else {
            vec![PathAddr::from_socket_addr(self.local)]
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_bind_and_roundtrip() {
        let a = UdpConfig {
            network: "udp4".into(),
            addr: "127.0.0.1:0".into(),
        }
        .open()
        .await
        .unwrap();
        let b = UdpConfig {
            network: "udp4".into(),
            addr: "127.0.0.1:0".into(),
        }
        .open()
        .await
        .unwrap();

        let dst = PathAddr::from_socket_addr(b.local_addr());
        a.write(Bytes::from_static(b"ping"), &dst).await.unwrap();

        let (frame, src) = timeout(Duration::from_secs(1), b.read())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"ping");
        assert_eq!(src, PathAddr::from_socket_addr(a.local_addr()));
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let t = UdpConfig {
            network: "udp4".into(),
            addr: "127.0.0.1:0".into(),
        }
        .open()
        .await
        .unwrap();

        let reader = {
            let t = t.clone();
            tokio::spawn(async move { t.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.close().await;

        let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_claims_by_family() {
        let t = UdpConfig {
            network: "udp4".into(),
            addr: "127.0.0.1:0".into(),
        }
        .open()
        .await
        .unwrap();

        assert!(t.claims(&PathAddr::Udp4 {
            ip: "9.9.9.9".parse().unwrap(),
            port: 1,
        }));
        assert!(!t.claims(&PathAddr::Udp6 {
            ip: "::1".parse().unwrap(),
            port: 1,
        }));
    }

    #[tokio::test]
    async fn test_bad_network_rejected() {
        let err = UdpConfig {
            network: "tcp".into(),
            addr: String::new(),
        }
        .open()
        .await;
        assert!(matches!(err, Err(Error::ConfigInvalid(_))));
    }
}
