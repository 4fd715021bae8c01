//! The endpoint: top-level coordinator for exchanges, channels and
//! transports.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use e3x_cipherset::{CipherSet, Token};
use e3x_hashname::{Hashname, Keys, Parts};
use e3x_lob::{HandshakeHeader, Head, Packet, PathAddr};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::{Bridge, BridgeState, BridgeTransport};
use crate::error::Error;
use crate::exchange::{Exchange, ExchangeShared, ExchangeStatus};
use crate::identity::Identity;
use crate::transport::{Mux, Transport};

/// Timer and window knobs for an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// How long `dial` waits for an exchange to open.
    pub dial_timeout: Duration,
    /// Gap between handshake resends while handshaking.
    pub handshake_retry: Duration,
    /// Idle time on the line before a rekey.
    pub rekey_interval: Duration,
    /// Idle time before the exchange is considered expired.
    pub idle_expiry: Duration,
    /// How long the post-expiry probe waits before closing.
    pub expiry_probe_timeout: Duration,
    /// Gap between NAT keepalives on WAN paths.
    pub keepalive_interval: Duration,
    /// How long pre-rekey line keys stay valid for inbound packets.
    pub line_grace: Duration,
    /// Maintenance timer period.
    pub tick_interval: Duration,
    /// Unacked packets a reliable channel tolerates before writes block.
    pub channel_window: usize,
    /// First retransmission timeout.
    pub rto_initial: Duration,
    /// Retransmission backoff cap.
    pub rto_max: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            dial_timeout: Duration::from_secs(8),
            handshake_retry: Duration::from_secs(1),
            rekey_interval: Duration::from_secs(30),
            idle_expiry: Duration::from_secs(60),
            expiry_probe_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(25),
            line_grace: Duration::from_secs(2),
            tick_interval: Duration::from_secs(1),
            channel_window: 100,
            rto_initial: Duration::from_secs(1),
            rto_max: Duration::from_secs(10),
        }
    }
}

/// Lifecycle notifications observers can subscribe to.
#[derive(Debug, Clone)]
pub enum Event {
    /// Transports are bound and the read loop is running.
    Started,
    /// The endpoint shut down.
    Stopped,
    /// An exchange reached `Open` for the first time.
    ExchangeOpened {
        /// The peer.
        hashname: Hashname,
    },
    /// An exchange closed.
    ExchangeClosed {
        /// The peer.
        hashname: Hashname,
    },
    /// An inbound channel was accepted.
    ChannelOpened {
        /// The peer that opened it.
        hashname: Hashname,
        /// The channel type.
        channel_type: String,
    },
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type Handler = Arc<dyn Fn(crate::channel::Channel) -> HandlerFuture + Send + Sync>;

pub(crate) struct EndpointShared {
    pub(crate) config: EndpointConfig,
    keys: BTreeMap<u8, CipherSet>,
    parts: Parts,
    hashname: Hashname,
    mux: RwLock<Option<Arc<Mux>>>,
    exchanges: RwLock<HashMap<Hashname, Arc<ExchangeShared>>>,
    tokens: RwLock<HashMap<Token, Hashname>>,
    handlers: RwLock<HashMap<String, Handler>>,
    events: broadcast::Sender<Event>,
    running: AtomicBool,
    pending_transports: Mutex<Vec<Arc<dyn Transport>>>,
    bridge: Mutex<Option<Arc<BridgeState>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EndpointShared {
    pub(crate) fn local_parts(&self) -> Parts {
        self.parts.clone()
    }

    pub(crate) fn local_key(&self, csid: u8) -> Vec<u8> {
        self.keys
            .get(&csid)
            .map(|cs| cs.public_key())
            .unwrap_or_default()
    }

    pub(crate) async fn local_paths(&self) -> Vec<PathAddr> {
        match self.mux.read().await.as_ref() {
            Some(mux) => mux.local_addrs().await,
            None => Vec::new(),
        }
    }

    pub(crate) async fn register_token(&self, token: Token, hashname: Hashname) {
        let mut tokens = self.tokens.write().await;
        if let Some(existing) = tokens.get(&token) {
            if *existing != hashname {
                // Token collision across peers is a protocol error; the
                // newer exchange wins and the stale entry is logged.
                debug!(%token, "token collision, replacing {} with {}", existing.short(), hashname.short());
            }
        }
        tokens.insert(token, hashname);
    }

    pub(crate) async fn unregister_token(&self, token: &Token) {
        self.tokens.write().await.remove(token);
    }

    pub(crate) async fn handler(&self, typ: &str) -> Option<Handler> {
        self.handlers.read().await.get(typ).cloned()
    }

    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Find or create the exchange for a peer.
    async fn exchange_for(
        self: &Arc<Self>,
        hashname: Hashname,
        csid: u8,
        remote_key: Option<Vec<u8>>,
        paths: Vec<PathAddr>,
    ) -> Result<Arc<ExchangeShared>, Error> {
        {
            let exchanges = self.exchanges.read().await;
            if let Some(existing) = exchanges.get(&hashname) {
                if !existing.is_closed().await {
                    return Ok(existing.clone());
                }
            }
        }

        let mux = self
            .mux
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::ConfigInvalid("endpoint not started".into()))?;
        let cs = self
            .keys
            .get(&csid)
            .cloned()
            .ok_or(Error::Crypto)?;

        let mut exchanges = self.exchanges.write().await;
        // Double-check after taking the write lock.
        if let Some(existing) = exchanges.get(&hashname) {
            if !existing.is_closed().await {
                return Ok(existing.clone());
            }
        }
        let exchange = ExchangeShared::new(
            hashname,
            csid,
            cs,
            remote_key,
            paths,
            mux,
            Arc::downgrade(self),
            self.config.clone(),
        );
        exchanges.insert(hashname, exchange.clone());
        Ok(exchange)
    }

    /// Route one datagram from the mux.
    async fn dispatch(self: &Arc<Self>, frame: Bytes, src: PathAddr) {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%src, "dropping: {}", Error::BadFrame(e));
                return;
            }
        };

        let result = match packet.head {
            Head::Csid(csid) => self.handle_handshake(csid, packet.body, src.clone()).await,
            Head::Empty => self.handle_line(packet.body, src.clone()).await,
            Head::Json(_) => {
                // A channel frame can only arrive sealed inside a line.
                Err(Error::UnknownToken)
            }
        };

        if let Err(e) = result {
            debug!(%src, "dropping: {e}");
        }
    }

    async fn handle_handshake(
        self: &Arc<Self>,
        csid: u8,
        body: Bytes,
        src: PathAddr,
    ) -> Result<(), Error> {
        let cs = self.keys.get(&csid).ok_or(Error::Crypto)?;
        let opened = cs.decrypt_handshake(&body)?;

        let inner = Packet::decode(opened.inner.clone())?;
        let header = match &inner.head {
            Head::Json(map) => HandshakeHeader::from_map(map)?,
            _ => return Err(Error::BadFrame(e3x_lob::LobError::NotJson)),
        };

        if header.to != self.hashname {
            debug!(%src, "handshake for {} is not for us", header.to.short());
            return Ok(());
        }

        // The sender key must hash to its stated part, and the parts must
        // produce the sender hashname; anything else is a forgery.
        let sender_key = inner.body.to_vec();
        let expected_part = hex::encode(Sha256::digest(&sender_key));
        if header.from.get(&csid) != Some(&expected_part) {
            return Err(Error::Crypto);
        }
        let sender = Hashname::from_intermediates(&header.from)
            .map_err(|_| Error::Crypto)?;
        if sender == self.hashname {
            return Ok(());
        }

        let exchange = self
            .exchange_for(sender, csid, Some(sender_key.clone()), vec![src.clone()])
            .await?;
        exchange
            .accept_handshake(opened, header, sender_key, src)
            .await
    }

    async fn handle_line(self: &Arc<Self>, body: Bytes, src: PathAddr) -> Result<(), Error> {
        let token =
            Token::from_prefix(&body).ok_or(Error::BadFrame(e3x_lob::LobError::ShortFrame))?;

        let hashname = {
            let tokens = self.tokens.read().await;
            tokens.get(&token).copied().ok_or(Error::UnknownToken)?
        };
        let exchange = {
            let exchanges = self.exchanges.read().await;
            exchanges.get(&hashname).cloned().ok_or(Error::UnknownToken)?
        };
        exchange.receive_line(body, src).await
    }

    async fn tick_all(self: &Arc<Self>) {
        let now = Instant::now();
        let exchanges: Vec<(Hashname, Arc<ExchangeShared>)> = {
            let guard = self.exchanges.read().await;
            guard.iter().map(|(h, e)| (*h, e.clone())).collect()
        };

        for (hashname, exchange) in exchanges {
            if exchange.tick(now).await {
                let mut guard = self.exchanges.write().await;
                if let Some(current) = guard.get(&hashname) {
                    if Arc::ptr_eq(current, &exchange) {
                        guard.remove(&hashname);
                    }
                }
            }
        }
    }
}

/// A telehash endpoint.
///
/// Owns local keys, transports, the exchange tables and the handler
/// registry. Cheap to clone; clones share the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    /// Build an endpoint from local cipher suites.
    pub fn new(suites: Vec<CipherSet>, config: EndpointConfig) -> Result<Endpoint, Error> {
        if suites.is_empty() {
            return Err(Error::ConfigInvalid("no cipher suites".into()));
        }

        let mut keys = BTreeMap::new();
        let mut pub_keys = Keys::new();
        for cs in suites {
            pub_keys.insert(cs.csid(), cs.public_key());
            keys.insert(cs.csid(), cs);
        }
        let parts = e3x_hashname::parts_from_keys(&pub_keys)?;
        let hashname = Hashname::from_intermediates(&parts)?;

        let (events, _) = broadcast::channel(64);

        Ok(Endpoint {
            shared: Arc::new(EndpointShared {
                config,
                keys,
                parts,
                hashname,
                mux: RwLock::new(None),
                exchanges: RwLock::new(HashMap::new()),
                tokens: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                events,
                running: AtomicBool::new(false),
                pending_transports: Mutex::new(Vec::new()),
                bridge: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Our own hashname.
    pub fn hashname(&self) -> Hashname {
        self.shared.hashname
    }

    /// Add a transport. Must be called before `start`.
    pub async fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.shared.pending_transports.lock().await.push(transport);
    }

    /// Enable the bridge relay module. Must be called before `start`.
    pub async fn enable_bridge(&self) -> Bridge {
        let state = Arc::new(BridgeState::new());
        *self.shared.bridge.lock().await = Some(state.clone());

        // Routes die with the exchanges they reference.
        let mut events = self.shared.events.subscribe();
        let observer_state = state.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(Event::ExchangeClosed { hashname }) => {
                        observer_state.purge_exchange(hashname).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Bridge::from_state(state)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Bind transports and spawn the read and timer loops.
    pub async fn start(&self) -> Result<(), Error> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::ConfigInvalid("already started".into()));
        }

        let mut transports = {
            let mut pending = self.shared.pending_transports.lock().await;
            std::mem::take(&mut *pending)
        };
        if transports.is_empty() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(Error::ConfigInvalid("no transports".into()));
        }

        if let Some(bridge) = self.shared.bridge.lock().await.clone() {
            transports = transports
                .into_iter()
                .map(|t| Arc::new(BridgeTransport::new(t, bridge.clone())) as Arc<dyn Transport>)
                .collect();
        }

        let mux = Mux::spawn(transports);
        *self.shared.mux.write().await = Some(mux.clone());

        let mut tasks = self.shared.tasks.lock().await;

        // Inbound dispatch loop.
        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match mux.read().await {
                    Ok((frame, src)) => shared.dispatch(frame, src).await,
                    Err(_) => break,
                }
            }
            debug!("dispatch loop ended");
        }));

        // One logical ticker drives retransmits, rekey, expiry and
        // keepalives for every exchange.
        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                shared.tick_all().await;
            }
        }));
        drop(tasks);

        info!(hashname = %self.shared.hashname.short(), "endpoint started");
        self.shared.emit(Event::Started);
        Ok(())
    }

    /// Shut down: end channels, close exchanges, close transports.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let exchanges: Vec<Arc<ExchangeShared>> = {
            let mut guard = self.shared.exchanges.write().await;
            guard.drain().map(|(_, e)| e).collect()
        };
        for exchange in exchanges {
            exchange.end_channels().await;
            exchange.close(true).await;
        }

        if let Some(mux) = self.shared.mux.write().await.take() {
            mux.close().await;
        }

        let tasks = {
            let mut guard = self.shared.tasks.lock().await;
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task.abort();
        }

        self.shared.tokens.write().await.clear();
        info!(hashname = %self.shared.hashname.short(), "endpoint stopped");
        self.shared.emit(Event::Stopped);
    }

    /// Register a handler for inbound channels of `channel_type`. Each
    /// accepted channel runs the handler on a fresh task.
    pub async fn listen<F, Fut>(&self, channel_type: &str, handler: F)
    where
        F: Fn(crate::channel::Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |channel| Box::pin(handler(channel)));
        self.shared
            .handlers
            .write()
            .await
            .insert(channel_type.to_string(), handler);
    }

    /// Get or establish an exchange with a peer.
    ///
    /// Returns the existing exchange while it is open; otherwise sends a
    /// handshake and waits up to the dial timeout.
    pub async fn dial(&self, identity: &Identity) -> Result<Exchange, Error> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::ConfigInvalid("endpoint not started".into()));
        }
        if identity.hashname() == self.shared.hashname {
            return Err(Error::ConfigInvalid("cannot dial self".into()));
        }

        let local_csids: Vec<u8> = self.shared.keys.keys().copied().collect();
        let csid = identity.best_csid(&local_csids).ok_or(Error::Crypto)?;

        // Only paths some transport claims are usable.
        let usable: Vec<PathAddr> = match self.shared.mux.read().await.as_ref() {
            Some(mux) => {
                let mut usable = Vec::new();
                for path in identity.paths() {
                    if mux.claims(path).await {
                        usable.push(path.clone());
                    }
                }
                usable
            }
            None => Vec::new(),
        };
        if usable.is_empty() {
            return Err(Error::NoPath);
        }

        let remote_key = identity.keys().get(&csid).cloned();
        let exchange = self
            .shared
            .exchange_for(identity.hashname(), csid, remote_key, usable)
            .await?;

        if exchange.status().await == ExchangeStatus::Open {
            return Ok(Exchange { shared: exchange });
        }

        exchange.send_handshake(true).await?;
        exchange.wait_open(self.shared.config.dial_timeout).await?;
        Ok(Exchange { shared: exchange })
    }

    /// The exchange for a hashname, if one exists.
    pub async fn exchange(&self, hashname: &Hashname) -> Option<Exchange> {
        let exchanges = self.shared.exchanges.read().await;
        exchanges
            .get(hashname)
            .cloned()
            .map(|shared| Exchange { shared })
    }

    /// Identity document for this endpoint: keys plus transport-reported
    /// addresses.
    pub async fn local_identity(&self) -> Result<Identity, Error> {
        let mut keys = Keys::new();
        for (csid, cs) in &self.shared.keys {
            keys.insert(*csid, cs.public_key());
        }
        let paths = self.shared.local_paths().await;
        Identity::new(keys, paths)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({})", self.shared.hashname.short())
    }
}
