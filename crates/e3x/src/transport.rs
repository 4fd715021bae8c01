//! Transport abstraction and the mux that unifies several transports.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use e3x_lob::PathAddr;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::Error;

/// A datagram transport.
///
/// Implementations are owned behind `Arc` and shared between the mux read
/// task and writers; none of the methods may hold internal locks across
/// I/O.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Wait for the next datagram. Returns [`Error::TransportClosed`] once
    /// the transport is gone.
    async fn read(&self) -> Result<(Bytes, PathAddr), Error>;

    /// Send one datagram to `dst`.
    async fn write(&self, frame: Bytes, dst: &PathAddr) -> Result<(), Error>;

    /// Whether this transport can deliver to `dst`.
    fn claims(&self, dst: &PathAddr) -> bool;

    /// Addresses this transport is reachable on.
    fn local_addrs(&self) -> Vec<PathAddr>;

    /// Shut the transport down, unblocking any pending read.
    async fn close(&self);
}

/// Unified front over any number of transports.
///
/// One reader task per transport feeds a shared queue; a transport that
/// reports closed is dropped from the set, and once every transport is gone
/// the mux itself reads end-of-stream.
pub struct Mux {
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    inbound: Mutex<mpsc::Receiver<(Bytes, PathAddr)>>,
}

impl Mux {
    /// Channel depth between transport readers and the dispatch loop.
    const QUEUE_DEPTH: usize = 256;

    /// Spawn reader tasks over the given transports.
    pub fn spawn(transports: Vec<Arc<dyn Transport>>) -> Arc<Mux> {
        let (tx, rx) = mpsc::channel(Self::QUEUE_DEPTH);

        let mux = Arc::new(Mux {
            transports: RwLock::new(transports.clone()),
            inbound: Mutex::new(rx),
        });

        for transport in transports {
            let tx = tx.clone();
            let mux_ref = Arc::downgrade(&mux);
            tokio::spawn(async move {
                loop {
                    match transport.read().await {
                        Ok(datagram) => {
                            if tx.send(datagram).await.is_err() {
                                break;
                            }
                        }
                        Err(Error::TransportClosed) => {
                            debug!("transport closed, removing from mux");
                            if let Some(mux) = mux_ref.upgrade() {
                                mux.remove(&transport).await;
                            }
                            break;
                        }
                        Err(e) => {
                            warn!("transport read error: {e}");
                            break;
                        }
                    }
                }
                // Dropping `tx` here lets the queue drain to end-of-stream
                // once every reader has exited.
            });
        }

        mux
    }

    async fn remove(&self, transport: &Arc<dyn Transport>) {
        let mut transports = self.transports.write().await;
        transports.retain(|t| !Arc::ptr_eq(t, transport));
    }

    /// Next inbound datagram from any transport.
    pub async fn read(&self) -> Result<(Bytes, PathAddr), Error> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(Error::TransportClosed)
    }

    /// Send a datagram out whichever transport claims the address.
    pub async fn write(&self, frame: Bytes, dst: &PathAddr) -> Result<(), Error> {
        let transport = {
            let transports = self.transports.read().await;
            transports.iter().find(|t| t.claims(dst)).cloned()
        };
        match transport {
            Some(t) => t.write(frame, dst).await,
            None => Err(Error::NoPath),
        }
    }

    /// Whether any live transport can deliver to `dst`.
    pub async fn claims(&self, dst: &PathAddr) -> bool {
        let transports = self.transports.read().await;
        transports.iter().any(|t| t.claims(dst))
    }

    /// Union of the local addresses of every live transport.
    pub async fn local_addrs(&self) -> Vec<PathAddr> {
        let transports = self.transports.read().await;
        let mut addrs = Vec::new();
        for t in transports.iter() {
            for addr in t.local_addrs() {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        addrs
    }

    /// Close every transport.
    pub async fn close(&self) {
        let transports = {
            let mut guard = self.transports.write().await;
            std::mem::take(&mut *guard)
        };
        for t in transports {
            t.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// In-memory transport for mux tests.
    struct StubTransport {
        queue: Mutex<Vec<(Bytes, PathAddr)>>,
        wake: Notify,
        closed: AtomicBool,
        kind: &'static str,
        local: PathAddr,
    }

    impl StubTransport {
        fn new(kind: &'static str, port: u16) -> Arc<Self> {
            Arc::new(StubTransport {
                queue: Mutex::new(Vec::new()),
                wake: Notify::new(),
                closed: AtomicBool::new(false),
                kind,
                local: PathAddr::Udp4 {
                    ip: "127.0.0.1".parse().unwrap(),
                    port,
                },
            })
        }

        async fn push(&self, frame: Bytes) {
            self.queue
                .lock()
                .await
                .push((frame, self.local.clone()));
            self.wake.notify_waiters();
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn read(&self) -> Result<(Bytes, PathAddr), Error> {
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(Error::TransportClosed);
                }
                let wake = self.wake.notified();
                tokio::pin!(wake);
                wake.as_mut().enable();
                if let Some(item) = self.queue.lock().await.pop() {
                    return Ok(item);
                }
                wake.await;
            }
        }

        async fn write(&self, _frame: Bytes, _dst: &PathAddr) -> Result<(), Error> {
            Ok(())
        }

        fn claims(&self, dst: &PathAddr) -> bool {
            dst.kind() == self.kind
        }

        fn local_addrs(&self) -> Vec<PathAddr> {
            vec![self.local.clone()]
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.wake.notify_waiters();
        }
    }

    #[tokio::test]
    async fn test_read_from_any_transport() {
        let a = StubTransport::new("udp4", 1);
        let b = StubTransport::new("udp4", 2);
        let mux = Mux::spawn(vec![a.clone(), b.clone()]);

        b.push(Bytes::from_static(b"hello")).await;
        let (frame, src) = mux.read().await.unwrap();
        assert_eq!(&frame[..], b"hello");
        assert_eq!(src, b.local);
    }

    #[tokio::test]
    async fn test_end_of_stream_when_all_closed() {
        let a = StubTransport::new("udp4", 1);
        let mux = Mux::spawn(vec![a.clone()]);
        mux.close().await;
        assert!(matches!(mux.read().await, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn test_write_dispatches_by_kind() {
        let a = StubTransport::new("udp4", 1);
        let mux = Mux::spawn(vec![a.clone()]);

        let udp6 = PathAddr::Udp6 {
            ip: "::1".parse().unwrap(),
            port: 9,
        };
        assert!(matches!(
            mux.write(Bytes::new(), &udp6).await,
            Err(Error::NoPath)
        ));
        assert!(mux.write(Bytes::new(), &a.local).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_addrs_union() {
        let a = StubTransport::new("udp4", 1);
        let b = StubTransport::new("udp4", 2);
        let mux = Mux::spawn(vec![a, b]);
        assert_eq!(mux.local_addrs().await.len(), 2);
    }
}
