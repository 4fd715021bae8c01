//! Token-routed relay between exchanges.
//!
//! A bridging endpoint forwards frames between two peers without ever
//! decrypting them: frames whose token matches a route are re-emitted
//! toward the mapped exchange's active path and never reach the local
//! dispatch at all.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use e3x_cipherset::{extract_token, Token};
use e3x_lob::PathAddr;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Error;
use crate::exchange::Exchange;
use crate::transport::Transport;

pub(crate) struct BridgeState {
    /// Routes for line packets (empty head).
    packet_routes: RwLock<HashMap<Token, Exchange>>,
    /// Routes for handshake packets (one-byte head).
    handshake_routes: RwLock<HashMap<Token, Exchange>>,
}

impl BridgeState {
    pub(crate) fn new() -> Self {
        BridgeState {
            packet_routes: RwLock::new(HashMap::new()),
            handshake_routes: RwLock::new(HashMap::new()),
        }
    }

    /// Look up the forwarding exchange for a frame, pruning routes whose
    /// exchange has closed.
    async fn route_for(&self, token: Token, handshake: bool) -> Option<Exchange> {
        let table = if handshake {
            &self.handshake_routes
        } else {
            &self.packet_routes
        };

        let exchange = table.read().await.get(&token).cloned()?;
        if exchange.status().await == crate::exchange::ExchangeStatus::Closed {
            self.break_route(&token).await;
            return None;
        }
        Some(exchange)
    }

    pub(crate) async fn break_route(&self, token: &Token) {
        self.packet_routes.write().await.remove(token);
        self.handshake_routes.write().await.remove(token);
    }

    /// Drop every route referencing a closed exchange.
    pub(crate) async fn purge_exchange(&self, hashname: e3x_hashname::Hashname) {
        self.packet_routes
            .write()
            .await
            .retain(|_, ex| ex.remote_hashname() != hashname);
        self.handshake_routes
            .write()
            .await
            .retain(|_, ex| ex.remote_hashname() != hashname);
    }
}

/// Handle for managing relay routes on an endpoint.
#[derive(Clone)]
pub struct Bridge {
    state: Arc<BridgeState>,
}

impl Bridge {
    pub(crate) fn from_state(state: Arc<BridgeState>) -> Self {
        Bridge { state }
    }

    /// Forward frames carrying `token`: line packets toward
    /// `packet_exchange`, handshake packets toward `handshake_exchange`
    /// (or the same exchange when `None`).
    pub async fn route_token(
        &self,
        token: Token,
        packet_exchange: &Exchange,
        handshake_exchange: Option<&Exchange>,
    ) {
        self.state
            .packet_routes
            .write()
            .await
            .insert(token, packet_exchange.clone());
        let handshake = handshake_exchange.unwrap_or(packet_exchange);
        self.state
            .handshake_routes
            .write()
            .await
            .insert(token, handshake.clone());
    }

    /// Remove both routes for a token.
    pub async fn break_route(&self, token: &Token) {
        self.state.break_route(token).await;
    }
}

/// Transport wrapper that intercepts bridged frames on the read path.
pub(crate) struct BridgeTransport {
    inner: Arc<dyn Transport>,
    state: Arc<BridgeState>,
}

impl BridgeTransport {
    pub(crate) fn new(inner: Arc<dyn Transport>, state: Arc<BridgeState>) -> Self {
        BridgeTransport { inner, state }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn read(&self) -> Result<(Bytes, PathAddr), Error> {
        loop {
            let (frame, src) = self.inner.read().await?;

            let Some(token) = extract_token(&frame) else {
                return Ok((frame, src));
            };
            let handshake = frame.len() >= 2 && frame[0] == 0 && frame[1] == 1;

            let Some(exchange) = self.state.route_for(token, handshake).await else {
                return Ok((frame, src));
            };

            // Bridged: re-emit and keep reading. The local endpoint never
            // sees this frame.
            match exchange.active_path().await {
                Some(path) => {
                    if let Err(e) = self.inner.write(frame, &path).await {
                        debug!(%token, %path, "bridge forward failed: {e}");
                    }
                }
                None => {
                    debug!(%token, "bridge route has no active path");
                }
            }
        }
    }

    async fn write(&self, frame: Bytes, dst: &PathAddr) -> Result<(), Error> {
        self.inner.write(frame, dst).await
    }

    fn claims(&self, dst: &PathAddr) -> bool {
        self.inner.claims(dst)
    }

    fn local_addrs(&self) -> Vec<PathAddr> {
        self.inner.local_addrs()
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::time::Duration;

    use e3x_cipherset::CipherSet;
    use e3x_hashname::Hashname;
    use tokio::sync::{Mutex, Notify};

    use crate::endpoint::EndpointConfig;
    use crate::exchange::ExchangeShared;
    use crate::transport::Mux;

    struct StubTransport {
        inbound: Mutex<Vec<(Bytes, PathAddr)>>,
        wake: Notify,
        written: Mutex<Vec<(Bytes, PathAddr)>>,
    }

    impl StubTransport {
        fn new(inbound: Vec<Bytes>) -> Arc<Self> {
            let src = addr(9999);
            Arc::new(StubTransport {
                inbound: Mutex::new(
                    inbound.into_iter().rev().map(|f| (f, src.clone())).collect(),
                ),
                wake: Notify::new(),
                written: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn read(&self) -> Result<(Bytes, PathAddr), Error> {
            loop {
                let wake = self.wake.notified();
                tokio::pin!(wake);
                wake.as_mut().enable();
                if let Some(item) = self.inbound.lock().await.pop() {
                    return Ok(item);
                }
                wake.await;
            }
        }

        async fn write(&self, frame: Bytes, dst: &PathAddr) -> Result<(), Error> {
            self.written.lock().await.push((frame, dst.clone()));
            Ok(())
        }

        fn claims(&self, _dst: &PathAddr) -> bool {
            true
        }

        fn local_addrs(&self) -> Vec<PathAddr> {
            Vec::new()
        }

        async fn close(&self) {}
    }

    fn addr(port: u16) -> PathAddr {
        PathAddr::Udp4 {
            ip: "127.0.0.1".parse().unwrap(),
            port,
        }
    }

    fn exchange_to(port: u16) -> Exchange {
        let shared = ExchangeShared::new(
            Hashname::from_bytes([port as u8; 32]),
            0x3a,
            CipherSet::generate(0x3a).unwrap(),
            None,
            vec![addr(port)],
            Mux::spawn(Vec::new()),
            Weak::new(),
            EndpointConfig::default(),
        );
        Exchange { shared }
    }

    fn line_frame(token: [u8; 16]) -> Bytes {
        let mut frame = vec![0u8, 0u8];
        frame.extend_from_slice(&token);
        frame.extend_from_slice(b"ciphertext");
        Bytes::from(frame)
    }

    fn handshake_frame(token: [u8; 16]) -> Bytes {
        let mut frame = vec![0u8, 1u8, 0x3a];
        frame.extend_from_slice(&token);
        frame.extend_from_slice(&[0u8; 16]); // rest of the ephemeral
        Bytes::from(frame)
    }

    #[tokio::test]
    async fn test_routed_line_frame_is_forwarded_not_delivered() {
        let token = [7u8; 16];
        let routed = line_frame(token);
        let unrouted = line_frame([8u8; 16]);
        let stub = StubTransport::new(vec![routed.clone(), unrouted.clone()]);

        let state = Arc::new(BridgeState::new());
        let bridge = Bridge::from_state(state.clone());
        let target = exchange_to(42);
        bridge
            .route_token(Token::from_bytes(token), &target, None)
            .await;

        let transport = BridgeTransport::new(stub.clone(), state);

        // The routed frame is swallowed; the unrouted one surfaces.
        let (delivered, _) = transport.read().await.unwrap();
        assert_eq!(delivered, unrouted);

        let written = stub.written.lock().await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, routed);
        assert_eq!(written[0].1, addr(42));
    }

    #[tokio::test]
    async fn test_handshake_route_table_is_separate() {
        let token = [9u8; 16];
        let stub = StubTransport::new(vec![handshake_frame(token)]);

        let state = Arc::new(BridgeState::new());
        let bridge = Bridge::from_state(state.clone());
        let packet_target = exchange_to(41);
        let handshake_target = exchange_to(43);
        bridge
            .route_token(
                Token::from_bytes(token),
                &packet_target,
                Some(&handshake_target),
            )
            .await;

        let transport = BridgeTransport::new(stub.clone(), state);
        let read = tokio::time::timeout(Duration::from_millis(200), transport.read()).await;
        assert!(read.is_err(), "handshake frame must not surface");

        let written = stub.written.lock().await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].1, addr(43));
    }

    #[tokio::test]
    async fn test_broken_route_delivers_locally() {
        let token = [5u8; 16];
        let frame = line_frame(token);
        let stub = StubTransport::new(vec![frame.clone()]);

        let state = Arc::new(BridgeState::new());
        let bridge = Bridge::from_state(state.clone());
        let target = exchange_to(42);
        bridge
            .route_token(Token::from_bytes(token), &target, None)
            .await;
        bridge.break_route(&Token::from_bytes(token)).await;

        let transport = BridgeTransport::new(stub, state);
        let (delivered, _) = transport.read().await.unwrap();
        assert_eq!(delivered, frame);
    }

    #[tokio::test]
    async fn test_closed_exchange_drops_route() {
        let token = [6u8; 16];
        let frame = line_frame(token);
        let stub = StubTransport::new(vec![frame.clone()]);

        let state = Arc::new(BridgeState::new());
        let bridge = Bridge::from_state(state.clone());
        let target = exchange_to(42);
        bridge
            .route_token(Token::from_bytes(token), &target, None)
            .await;
        target.shared.close(false).await;

        let transport = BridgeTransport::new(stub, state.clone());
        let (delivered, _) = transport.read().await.unwrap();
        assert_eq!(delivered, frame);
        assert!(state.packet_routes.read().await.is_empty());
    }
}
