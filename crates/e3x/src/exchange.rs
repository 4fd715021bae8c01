//! Per-peer exchange state machine.
//!
//! An exchange drives the handshake with one peer, owns the line keys, the
//! scored path set and the channel table, and mediates every packet in
//! either direction. The endpoint owns exchanges by hashname; channels
//! reach back through a weak handle only.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use e3x_cipherset::{generate_ephemeral, CipherSet, Line, OpenedHandshake, Token};
use e3x_hashname::Hashname;
use e3x_lob::{ChannelHeader, HandshakeHeader, Head, Packet, PathAddr};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::channel::{generate_channel_id, Channel, ChannelShared};
use crate::endpoint::{EndpointConfig, EndpointShared, Event};
use crate::error::Error;
use crate::paths::PathSet;
use crate::transport::Mux;

/// Crypto failures tolerated before the exchange closes itself.
const MAX_CRYPTO_FAILURES: u32 = 8;

/// Lifecycle of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Created but no handshake sent yet.
    Unknown,
    /// Handshake in flight, no line (or a rekey in progress).
    Handshaking,
    /// Line established; channels flow.
    Open,
    /// Idle past expiry; one last probe is out.
    Expired,
    /// Torn down. Terminal.
    Closed,
}

/// Traffic counters for one exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeStats {
    /// Line packets received and decrypted.
    pub packets_in: u64,
    /// Line packets sealed and sent.
    pub packets_out: u64,
    /// Bytes received on the wire.
    pub bytes_in: u64,
    /// Bytes sent on the wire.
    pub bytes_out: u64,
}

struct ExchangeState {
    status: ExchangeStatus,
    remote_key: Option<Vec<u8>>,
    local_eph: Option<StaticSecret>,
    remote_eph: Option<[u8; 32]>,
    /// Ephemeral pair the current line was derived from.
    line_ephs: Option<([u8; 32], [u8; 32])>,
    last_local_at: u32,
    last_remote_at: u32,
    line: Option<Line>,
    prev_line: Option<(Line, Instant)>,
    old_token: Option<Token>,
    /// We sent a handshake and expect the peer's in return.
    awaiting_line: bool,
    paths: PathSet,
    channels: HashMap<String, Arc<ChannelShared>>,
    last_rx: Instant,
    last_line_rx: Instant,
    last_handshake_tx: Option<Instant>,
    last_keepalive: Instant,
    expiry_probe_at: Option<Instant>,
    rtt: Option<Duration>,
    crypto_failures: u32,
    cancelled: bool,
    stats: ExchangeStats,
    opened_once: bool,
}

pub(crate) struct ExchangeShared {
    remote: Hashname,
    csid: u8,
    cs: CipherSet,
    mux: Arc<Mux>,
    endpoint: Weak<EndpointShared>,
    config: EndpointConfig,
    state: Mutex<ExchangeState>,
    status_tx: watch::Sender<ExchangeStatus>,
}

impl ExchangeShared {
    pub(crate) fn new(
        remote: Hashname,
        csid: u8,
        cs: CipherSet,
        remote_key: Option<Vec<u8>>,
        paths: Vec<PathAddr>,
        mux: Arc<Mux>,
        endpoint: Weak<EndpointShared>,
        config: EndpointConfig,
    ) -> Arc<Self> {
        let mut path_set = PathSet::new();
        for p in paths {
            path_set.add(p);
        }
        let (status_tx, _) = watch::channel(ExchangeStatus::Unknown);
        let now = Instant::now();

        Arc::new(ExchangeShared {
            remote,
            csid,
            cs,
            mux,
            endpoint,
            config,
            state: Mutex::new(ExchangeState {
                status: ExchangeStatus::Unknown,
                remote_key,
                local_eph: None,
                remote_eph: None,
                line_ephs: None,
                last_local_at: 0,
                last_remote_at: 0,
                line: None,
                prev_line: None,
                old_token: None,
                awaiting_line: false,
                paths: path_set,
                channels: HashMap::new(),
                last_rx: now,
                last_line_rx: now,
                last_handshake_tx: None,
                last_keepalive: now,
                expiry_probe_at: None,
                rtt: None,
                crypto_failures: 0,
                cancelled: false,
                stats: ExchangeStats::default(),
                opened_once: false,
            }),
            status_tx,
        })
    }

    fn set_status(&self, state: &mut ExchangeState, status: ExchangeStatus) {
        if state.status != status {
            debug!(peer = %self.remote.short(), ?status, "exchange status");
            state.status = status;
            let _ = self.status_tx.send(status);
        }
    }

    /// Wait until the exchange opens, fails, or the deadline passes.
    pub(crate) async fn wait_open(&self, deadline: Duration) -> Result<(), Error> {
        let mut rx = self.status_tx.subscribe();
        let wait = async {
            loop {
                let status = *rx.borrow_and_update();
                match status {
                    ExchangeStatus::Open => return Ok(()),
                    ExchangeStatus::Closed => {
                        let cancelled = self.state.lock().await.cancelled;
                        return Err(if cancelled {
                            Error::Cancelled
                        } else {
                            Error::ExchangeClosed
                        });
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(Error::ExchangeClosed);
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| Error::HandshakeTimeout)?
    }

    /// Send our handshake on every known path.
    ///
    /// `expect_reply` marks us as the side waiting for the peer's
    /// handshake to complete (or refresh) the line.
    pub(crate) async fn send_handshake(&self, expect_reply: bool) -> Result<(), Error> {
        let endpoint = self.endpoint.upgrade().ok_or(Error::ExchangeClosed)?;
        let local_paths = endpoint.local_paths().await;

        let (frame, targets) = {
            let mut state = self.state.lock().await;
            if state.status == ExchangeStatus::Closed {
                return Err(Error::ExchangeClosed);
            }
            let remote_key = state.remote_key.clone().ok_or(Error::Crypto)?;
            if state.local_eph.is_none() {
                state.local_eph = Some(generate_ephemeral());
            }
            let eph = state.local_eph.clone().expect("ephemeral just ensured");

            // `at` must be fresh per handshake or the peer's replay guard
            // rejects it.
            let at = e3x_cipherset::at_now().max(state.last_local_at + 1);
            state.last_local_at = at;

            let header = HandshakeHeader {
                to: self.remote,
                from: endpoint.local_parts(),
                at,
                paths: local_paths,
            };
            let inner = Packet::json(header.to_map(), Bytes::from(endpoint.local_key(self.csid)))
                .encode()?;
            let body = self.cs.encrypt_handshake(&remote_key, &eph, at, &inner)?;
            let frame = Packet::handshake(self.csid, body).encode()?;

            let targets = state.paths.all();
            if targets.is_empty() {
                return Err(Error::NoPath);
            }

            if expect_reply {
                state.awaiting_line = true;
            }
            state.last_handshake_tx = Some(Instant::now());
            if state.status == ExchangeStatus::Unknown {
                self.set_status(&mut state, ExchangeStatus::Handshaking);
            }
            state.stats.packets_out += 1;
            state.stats.bytes_out += frame.len() as u64;
            (frame, targets)
        };

        for target in targets {
            if let Err(e) = self.mux.write(frame.clone(), &target).await {
                debug!(peer = %self.remote.short(), path = %target, "handshake send failed: {e}");
                self.state.lock().await.paths.demote(&target);
            }
        }
        Ok(())
    }

    /// Apply a decrypted, identity-verified handshake.
    pub(crate) async fn accept_handshake(
        self: &Arc<Self>,
        opened: OpenedHandshake,
        header: HandshakeHeader,
        remote_key: Vec<u8>,
        src: PathAddr,
    ) -> Result<(), Error> {
        let now = Instant::now();
        let mut reply = false;
        let mut confirm_line = false;
        let mut registered = None;
        let mut opened_event = false;

        {
            let mut state = self.state.lock().await;
            if state.status == ExchangeStatus::Closed {
                return Err(Error::ExchangeClosed);
            }
            if opened.at <= state.last_remote_at {
                return Err(Error::ReplayedHandshake);
            }
            state.last_remote_at = opened.at;
            state.remote_key = Some(remote_key);

            state.paths.confirm(&src, now);
            for path in header.paths {
                state.paths.add(path);
            }
            state.last_rx = now;
            state.expiry_probe_at = None;

            if let (true, Some(sent_at)) = (state.awaiting_line, state.last_handshake_tx) {
                state.rtt = Some(now.duration_since(sent_at));
            }

            if state.local_eph.is_none() {
                state.local_eph = Some(generate_ephemeral());
            }
            let local_eph = state.local_eph.clone().expect("ephemeral just ensured");
            let local_pub = PublicKey::from(&local_eph).to_bytes();

            let needs_line = state.line_ephs != Some((local_pub, opened.remote_ephemeral));
            state.remote_eph = Some(opened.remote_ephemeral);

            if needs_line {
                let line = self.cs.derive_line(&local_eph, &opened.remote_ephemeral)?;
                let token = line.local_token();

                if let Some(old) = state.line.take() {
                    state.old_token = Some(old.local_token());
                    state.prev_line = Some((old, now));
                }
                state.line = Some(line);
                state.line_ephs = Some((local_pub, opened.remote_ephemeral));
                state.last_line_rx = now;
                registered = Some(token);

                opened_event = !state.opened_once;
                state.opened_once = true;
                self.set_status(&mut state, ExchangeStatus::Open);

                if state.awaiting_line {
                    // We initiated; a sealed keepalive confirms the line
                    // without another handshake round.
                    state.awaiting_line = false;
                    confirm_line = true;
                } else {
                    reply = true;
                }
            } else if state.awaiting_line {
                // Reply to a probe; nothing further owed.
                state.awaiting_line = false;
                self.set_status(&mut state, ExchangeStatus::Open);
            } else {
                // Same ephemerals again: the peer is still waiting for a
                // reply it lost. Resend ours, rate-limited.
                let due = state
                    .last_handshake_tx
                    .map(|t| now.duration_since(t) >= self.config.handshake_retry)
                    .unwrap_or(true);
                reply = due;
                self.set_status(&mut state, ExchangeStatus::Open);
            }
        }

        if let Some(token) = registered {
            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.register_token(token, self.remote).await;
            }
        }
        if opened_event {
            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.emit(Event::ExchangeOpened {
                    hashname: self.remote,
                });
            }
            info!(peer = %self.remote.short(), "exchange open");
        }
        if reply {
            self.send_handshake(false).await?;
        }
        if confirm_line {
            let _ = self.send_keepalive().await;
        }
        Ok(())
    }

    /// Seal a plaintext LOB frame and send it on the active path.
    pub(crate) async fn send_channel_frame(&self, plain: Bytes) -> Result<(), Error> {
        let (wire, path) = {
            let mut state = self.state.lock().await;
            if state.status == ExchangeStatus::Closed {
                return Err(Error::ExchangeClosed);
            }
            let line = state.line.as_ref().ok_or(Error::ExchangeClosed)?;
            let path = state.paths.active().cloned().ok_or(Error::NoPath)?;
            let sealed = line.seal(&plain)?;
            let wire = Packet::raw(sealed).encode()?;
            state.stats.packets_out += 1;
            state.stats.bytes_out += wire.len() as u64;
            (wire, path)
        };

        match self.mux.write(wire, &path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(peer = %self.remote.short(), path = %path, "send failed: {e}");
                self.state.lock().await.paths.demote(&path);
                Err(e)
            }
        }
    }

    /// Minimal sealed packet: keeps NAT state alive and confirms lines.
    async fn send_keepalive(&self) -> Result<(), Error> {
        let empty = Packet::raw(Bytes::new()).encode()?;
        self.send_channel_frame(empty).await
    }

    /// Decrypt and dispatch one inbound line packet.
    pub(crate) async fn receive_line(
        self: &Arc<Self>,
        body: Bytes,
        src: PathAddr,
    ) -> Result<(), Error> {
        let now = Instant::now();

        let plain = {
            let mut state = self.state.lock().await;
            if state.status == ExchangeStatus::Closed {
                return Err(Error::ExchangeClosed);
            }

            let opened = state
                .line
                .as_ref()
                .and_then(|line| line.open(&body).ok())
                .or_else(|| {
                    // Grace window: the peer may still seal with the
                    // pre-rekey line.
                    state.prev_line.as_ref().and_then(|(line, retired)| {
                        if now.duration_since(*retired) <= self.config.line_grace {
                            line.open(&body).ok()
                        } else {
                            None
                        }
                    })
                });

            match opened {
                Some(plain) => {
                    state.crypto_failures = 0;
                    state.last_rx = now;
                    state.last_line_rx = now;
                    state.expiry_probe_at = None;
                    state.paths.confirm(&src, now);
                    state.stats.packets_in += 1;
                    state.stats.bytes_in += body.len() as u64;
                    if state.status == ExchangeStatus::Expired {
                        self.set_status(&mut state, ExchangeStatus::Open);
                    }
                    plain
                }
                None => {
                    state.crypto_failures += 1;
                    if state.crypto_failures > MAX_CRYPTO_FAILURES {
                        drop(state);
                        warn!(peer = %self.remote.short(), "too many crypto failures, closing");
                        self.close(false).await;
                    }
                    return Err(Error::Crypto);
                }
            }
        };

        let packet = Packet::decode(plain)?;
        let header = match &packet.head {
            Head::Json(map) => ChannelHeader::from_map(map)?,
            // Bare keepalive; the receive bookkeeping above is the point.
            _ => return Ok(()),
        };

        self.dispatch_channel(header, packet.body).await
    }

    async fn dispatch_channel(
        self: &Arc<Self>,
        header: ChannelHeader,
        body: Bytes,
    ) -> Result<(), Error> {
        if header.c.is_empty() {
            return Err(Error::BadFrame(e3x_lob::LobError::NotJson));
        }

        let existing = {
            let state = self.state.lock().await;
            state.channels.get(&header.c).cloned()
        };

        if let Some(channel) = existing {
            let replies = channel.receive(header, body).await;
            for frame in replies {
                let _ = self.send_channel_frame(frame).await;
            }
            return Ok(());
        }

        // New inbound channel: only an opening packet may create one.
        let Some(typ) = header.typ.clone() else {
            debug!(peer = %self.remote.short(), channel = %header.c, "packet for unknown channel");
            return Ok(());
        };
        if header.err.is_some() {
            return Ok(());
        }

        let endpoint = self.endpoint.upgrade().ok_or(Error::ExchangeClosed)?;
        let Some(handler) = endpoint.handler(&typ).await else {
            debug!(peer = %self.remote.short(), %typ, "no handler: {}", Error::ChannelType(typ.clone()));
            let mut reject = ChannelHeader::new(header.c.clone());
            reject.err = Some(format!("unknown channel type {typ}"));
            let frame = Packet::json(reject.to_map(), Bytes::new()).encode()?;
            let _ = self.send_channel_frame(frame).await;
            return Ok(());
        };

        let reliable = header.seq.is_some();
        let shared = ChannelShared::new(
            header.c.clone(),
            typ.clone(),
            reliable,
            false,
            Arc::downgrade(self),
            &self.config,
        );
        {
            let mut state = self.state.lock().await;
            state.channels.insert(header.c.clone(), shared.clone());
        }

        let replies = shared.receive(header, body).await;
        for frame in replies {
            let _ = self.send_channel_frame(frame).await;
        }

        let channel = Channel::from_shared(shared);
        endpoint.emit(Event::ChannelOpened {
            hashname: self.remote,
            channel_type: typ,
        });
        tokio::spawn(handler(channel));
        Ok(())
    }

    /// Open a locally-initiated channel.
    pub(crate) async fn open_channel(
        self: &Arc<Self>,
        typ: &str,
        reliable: bool,
    ) -> Result<Channel, Error> {
        let shared = {
            let mut state = self.state.lock().await;
            if state.status == ExchangeStatus::Closed {
                return Err(Error::ExchangeClosed);
            }
            if state.line.is_none() {
                return Err(Error::ExchangeClosed);
            }
            let id = generate_channel_id();
            let shared = ChannelShared::new(
                id.clone(),
                typ.to_string(),
                reliable,
                true,
                Arc::downgrade(self),
                &self.config,
            );
            state.channels.insert(id, shared.clone());
            shared
        };
        Ok(Channel::from_shared(shared))
    }

    /// One maintenance pass. Returns true when the exchange has closed and
    /// the endpoint should forget it.
    pub(crate) async fn tick(self: &Arc<Self>, now: Instant) -> bool {
        let mut resend_handshake = false;
        let mut rekey = false;
        let mut expire_probe = false;
        let mut close_now = false;
        let mut keepalive_paths = Vec::new();
        let mut retire_token = None;
        let channels: Vec<Arc<ChannelShared>>;

        {
            let mut state = self.state.lock().await;
            match state.status {
                ExchangeStatus::Closed => return true,
                ExchangeStatus::Unknown => return false,
                _ => {}
            }

            // Retire the pre-rekey line once the grace window passes.
            if let Some((_, retired)) = &state.prev_line {
                if now.duration_since(*retired) > self.config.line_grace {
                    state.prev_line = None;
                    retire_token = state.old_token.take();
                }
            }

            match state.status {
                ExchangeStatus::Handshaking => {
                    let due = state
                        .last_handshake_tx
                        .map(|t| now.duration_since(t) >= self.config.handshake_retry)
                        .unwrap_or(true);
                    resend_handshake = due;
                }
                ExchangeStatus::Open => {
                    if now.duration_since(state.last_rx) >= self.config.idle_expiry {
                        self.set_status(&mut state, ExchangeStatus::Expired);
                        state.expiry_probe_at = Some(now);
                        expire_probe = true;
                    } else if now.duration_since(state.last_line_rx) >= self.config.rekey_interval
                    {
                        // Fresh ephemeral; the peer derives the new line
                        // from our next handshake.
                        state.local_eph = Some(generate_ephemeral());
                        self.set_status(&mut state, ExchangeStatus::Handshaking);
                        rekey = true;
                    } else if now.duration_since(state.last_keepalive)
                        >= self.config.keepalive_interval
                    {
                        keepalive_paths = state.paths.wan();
                        state.last_keepalive = now;
                    }
                }
                ExchangeStatus::Expired => {
                    // 3 x RTT when one is known, the configured default
                    // otherwise.
                    let probe_window = state
                        .rtt
                        .map(|rtt| rtt * 3)
                        .unwrap_or(self.config.expiry_probe_timeout);
                    let probe_at = state.expiry_probe_at.unwrap_or(now);
                    if now.duration_since(probe_at) >= probe_window {
                        close_now = true;
                    }
                }
                _ => {}
            }

            channels = state.channels.values().cloned().collect();
        }

        if close_now {
            self.close(false).await;
            return true;
        }

        if let Some(token) = retire_token {
            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.unregister_token(&token).await;
            }
        }

        if resend_handshake || rekey || expire_probe {
            let _ = self.send_handshake(true).await;
        }

        if !keepalive_paths.is_empty() {
            // NAT holes stay open with minimal traffic on every WAN path.
            if let Ok(empty) = Packet::raw(Bytes::new()).encode() {
                let sealed = {
                    let state = self.state.lock().await;
                    state.line.as_ref().and_then(|l| l.seal(&empty).ok())
                };
                if let Some(sealed) = sealed {
                    if let Ok(wire) = Packet::raw(sealed).encode() {
                        for path in keepalive_paths {
                            let _ = self.mux.write(wire.clone(), &path).await;
                        }
                    }
                }
            }
        }

        // Channel timers and cleanup of finished channels.
        let mut finished = Vec::new();
        for channel in channels {
            for frame in channel.tick(now).await {
                let _ = self.send_channel_frame(frame).await;
            }
            if channel.is_finished().await {
                finished.push(channel);
            }
        }
        if !finished.is_empty() {
            let mut state = self.state.lock().await;
            state
                .channels
                .retain(|_, ch| !finished.iter().any(|f| Arc::ptr_eq(f, ch)));
        }

        false
    }

    /// Tear the exchange down. Channels fail with `ExchangeClosed`; tokens
    /// are unregistered; pending dials fail.
    pub(crate) async fn close(self: &Arc<Self>, cancelled: bool) {
        let (channels, tokens) = {
            let mut state = self.state.lock().await;
            if state.status == ExchangeStatus::Closed {
                return;
            }
            state.cancelled = cancelled;
            self.set_status(&mut state, ExchangeStatus::Closed);

            let channels: Vec<_> = state.channels.drain().map(|(_, ch)| ch).collect();
            let mut tokens = Vec::new();
            if let Some(line) = &state.line {
                tokens.push(line.local_token());
            }
            if let Some(token) = state.old_token.take() {
                tokens.push(token);
            }
            state.line = None;
            state.prev_line = None;
            (channels, tokens)
        };

        for channel in channels {
            channel.close_by_exchange().await;
        }

        if let Some(endpoint) = self.endpoint.upgrade() {
            for token in tokens {
                endpoint.unregister_token(&token).await;
            }
            endpoint.emit(Event::ExchangeClosed {
                hashname: self.remote,
            });
        }
        info!(peer = %self.remote.short(), "exchange closed");
    }

    /// Best-effort `end` on every open channel, used by endpoint stop.
    pub(crate) async fn end_channels(self: &Arc<Self>) {
        let channels: Vec<_> = {
            let state = self.state.lock().await;
            state.channels.values().cloned().collect()
        };
        for shared in channels {
            let channel = Channel::from_shared(shared);
            channel.close().await;
        }
    }

    pub(crate) async fn status(&self) -> ExchangeStatus {
        self.state.lock().await.status
    }

    pub(crate) async fn active_path(&self) -> Option<PathAddr> {
        self.state.lock().await.paths.active().cloned()
    }

    pub(crate) async fn is_closed(&self) -> bool {
        self.status().await == ExchangeStatus::Closed
    }
}

/// Handle to a live exchange. Clones refer to the same exchange.
#[derive(Clone)]
pub struct Exchange {
    pub(crate) shared: Arc<ExchangeShared>,
}

impl Exchange {
    /// The peer this exchange talks to.
    pub fn remote_hashname(&self) -> Hashname {
        self.shared.remote
    }

    /// Current lifecycle state.
    pub async fn status(&self) -> ExchangeStatus {
        self.shared.status().await
    }

    /// Open a channel of the given type.
    pub async fn open_channel(&self, typ: &str, reliable: bool) -> Result<Channel, Error> {
        self.shared.open_channel(typ, reliable).await
    }

    /// Close this exchange. Idempotent.
    pub async fn close(&self) {
        self.shared.close(false).await;
    }

    /// The path outbound packets currently take.
    pub async fn active_path(&self) -> Option<PathAddr> {
        self.shared.active_path().await
    }

    /// Token peers use to reach us on this exchange.
    pub async fn local_token(&self) -> Option<Token> {
        let state = self.shared.state.lock().await;
        state.line.as_ref().map(|l| l.local_token())
    }

    /// Token we stamp on outbound packets.
    pub async fn remote_token(&self) -> Option<Token> {
        let state = self.shared.state.lock().await;
        state.line.as_ref().map(|l| l.remote_token())
    }

    /// Traffic counters.
    pub async fn stats(&self) -> ExchangeStats {
        self.shared.state.lock().await.stats
    }

    /// Smoothed handshake round-trip estimate, when one is known.
    pub async fn rtt(&self) -> Option<Duration> {
        self.shared.state.lock().await.rtt
    }

    /// Add another candidate path for this peer.
    pub async fn add_path(&self, addr: PathAddr) {
        self.shared.state.lock().await.paths.add(addr);
    }

    /// Replace the path set outright. Mostly useful for relays and tests.
    pub async fn replace_paths(&self, addrs: Vec<PathAddr>) {
        self.shared.state.lock().await.paths.replace(addrs);
    }

    /// Mark a path as broken, forcing fail-over.
    pub async fn break_path(&self, addr: &PathAddr) {
        self.shared.state.lock().await.paths.break_path(addr);
    }

    /// Priority of one path, if known.
    pub async fn path_priority(&self, addr: &PathAddr) -> Option<i32> {
        self.shared.state.lock().await.paths.priority_of(addr)
    }

    /// Whether two handles point at the same exchange.
    pub fn same_as(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Exchange({})", self.shared.remote.short())
    }
}
