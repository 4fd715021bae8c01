//! Multiplexed substreams over an exchange.
//!
//! Reliable channels number every packet, ack cumulatively, report gaps via
//! `miss`, and retransmit on either a reported miss or a timer. Unreliable
//! channels skip all of that and deliver best-effort. Both kinds end with
//! `end` or a terminal `err`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use e3x_lob::{ChannelHeader, Packet, MAX_MISS};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::debug;

use crate::endpoint::EndpointConfig;
use crate::error::Error;
use crate::exchange::ExchangeShared;

/// Counters for one channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    /// Packets handed to the exchange for sending, retransmits included.
    pub packets_sent: u64,
    /// Packets received from the exchange.
    pub packets_received: u64,
    /// Packets sent more than once.
    pub retransmits: u64,
}

/// One payload queued for the reader.
struct Inbound {
    body: Bytes,
    end: bool,
}

/// One unacked outbound packet.
struct InFlight {
    body: Bytes,
    end: bool,
    sent_at: Instant,
    rto: Duration,
}

struct ChannelState {
    // send side
    next_seq: u32,
    sent_type: bool,
    inflight: BTreeMap<u32, InFlight>,
    local_end_sent: bool,
    // receive side
    recv_next: u32,
    reorder: BTreeMap<u32, Inbound>,
    ready: VecDeque<Inbound>,
    ack_dirty: bool,
    end_delivered: bool,
    remote_err: Option<String>,
    // lifecycle
    closed: bool,
    closed_by_exchange: bool,
    read_deadline: Option<Duration>,
    write_deadline: Option<Duration>,
    stats: ChannelStats,
}

pub(crate) struct ChannelShared {
    id: String,
    typ: String,
    reliable: bool,
    initiator: bool,
    exchange: Weak<ExchangeShared>,
    window: usize,
    rto_initial: Duration,
    rto_max: Duration,
    state: Mutex<ChannelState>,
    readable: Notify,
    writable: Notify,
}

impl ChannelShared {
    pub(crate) fn new(
        id: String,
        typ: String,
        reliable: bool,
        initiator: bool,
        exchange: Weak<ExchangeShared>,
        config: &EndpointConfig,
    ) -> Arc<Self> {
        Arc::new(ChannelShared {
            id,
            typ,
            reliable,
            initiator,
            exchange,
            window: config.channel_window,
            rto_initial: config.rto_initial,
            rto_max: config.rto_max,
            state: Mutex::new(ChannelState {
                next_seq: 0,
                sent_type: false,
                inflight: BTreeMap::new(),
                local_end_sent: false,
                recv_next: 0,
                reorder: BTreeMap::new(),
                ready: VecDeque::new(),
                ack_dirty: false,
                end_delivered: false,
                remote_err: None,
                closed: false,
                closed_by_exchange: false,
                read_deadline: None,
                write_deadline: None,
                stats: ChannelStats::default(),
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        })
    }

    /// Header for an outbound packet, with the current ack/miss snapshot.
    fn header(&self, state: &mut ChannelState, seq: Option<u32>, end: bool) -> ChannelHeader {
        let mut hdr = ChannelHeader::new(self.id.clone());
        if self.initiator && !state.sent_type {
            hdr.typ = Some(self.typ.clone());
            state.sent_type = true;
        }
        hdr.seq = seq;
        hdr.end = end;
        if self.reliable {
            hdr.ack = state.recv_next.checked_sub(1);
            let miss = miss_list(state);
            if !miss.is_empty() {
                hdr.miss = Some(miss);
            }
            state.ack_dirty = false;
        }
        hdr
    }

    fn encode(hdr: &ChannelHeader, body: &Bytes) -> Result<Bytes, Error> {
        Ok(Packet::json(hdr.to_map(), body.clone()).encode()?)
    }

    fn terminal_error(state: &ChannelState) -> Option<Error> {
        if let Some(err) = &state.remote_err {
            return Some(Error::ChannelErr(err.clone()));
        }
        if state.closed {
            return Some(if state.closed_by_exchange {
                Error::ExchangeClosed
            } else {
                Error::ChannelClosed
            });
        }
        None
    }

    /// Process one inbound packet. Returns frames that must go out right
    /// away (miss-triggered retransmits).
    pub(crate) async fn receive(&self, hdr: ChannelHeader, body: Bytes) -> Vec<Bytes> {
        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        state.stats.packets_received += 1;

        if state.closed {
            return out;
        }

        // Cumulative ack frees the window.
        if let Some(ack) = hdr.ack {
            let before = state.inflight.len();
            state.inflight.retain(|&seq, _| seq > ack);
            if state.inflight.len() < before {
                self.writable.notify_waiters();
            }
        }

        // Reported gaps retransmit immediately.
        if let Some(miss) = &hdr.miss {
            let now = Instant::now();
            for &seq in miss {
                if let Some(frame) = self.retransmit(&mut state, seq, now) {
                    out.push(frame);
                }
            }
        }

        if let Some(err) = hdr.err {
            state.remote_err = Some(err);
            self.readable.notify_waiters();
            self.writable.notify_waiters();
            return out;
        }

        if self.reliable {
            if let Some(seq) = hdr.seq {
                self.receive_sequenced(&mut state, seq, hdr.end, body);
            }
            // Packets without seq are bare acks.
        } else if !body.is_empty() || hdr.end {
            state.ready.push_back(Inbound {
                body,
                end: hdr.end,
            });
            self.readable.notify_waiters();
        }

        out
    }

    fn receive_sequenced(&self, state: &mut ChannelState, seq: u32, end: bool, body: Bytes) {
        if seq < state.recv_next || state.reorder.contains_key(&seq) {
            // Duplicate; the next ack covers it.
            state.ack_dirty = true;
            return;
        }
        if (seq - state.recv_next) as usize > self.window * 2 {
            debug!(channel = %self.id, seq, "seq far beyond window, dropping");
            return;
        }

        state.reorder.insert(seq, Inbound { body, end });
        state.ack_dirty = true;

        let mut delivered = false;
        loop {
            let next = state.recv_next;
            match state.reorder.remove(&next) {
                Some(inbound) => {
                    state.recv_next += 1;
                    state.ready.push_back(inbound);
                    delivered = true;
                }
                None => break,
            }
        }
        if delivered {
            self.readable.notify_waiters();
        }
    }

    fn retransmit(
        &self,
        state: &mut ChannelState,
        seq: u32,
        now: Instant,
    ) -> Option<Bytes> {
        let snapshot = {
            let inflight = state.inflight.get_mut(&seq)?;
            inflight.sent_at = now;
            inflight.rto = (inflight.rto * 2).min(self.rto_max);
            (inflight.body.clone(), inflight.end)
        };
        state.stats.retransmits += 1;
        state.stats.packets_sent += 1;
        let hdr = self.header(state, Some(seq), snapshot.1);
        Self::encode(&hdr, &snapshot.0).ok()
    }

    /// Timer pass: RTO retransmits plus a standalone ack when one is owed.
    pub(crate) async fn tick(&self, now: Instant) -> Vec<Bytes> {
        let mut state = self.state.lock().await;
        let mut out = Vec::new();

        if state.closed || state.remote_err.is_some() {
            return out;
        }

        let due: Vec<u32> = state
            .inflight
            .iter()
            .filter(|(_, inf)| now.duration_since(inf.sent_at) >= inf.rto)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in due {
            if let Some(frame) = self.retransmit(&mut state, seq, now) {
                out.push(frame);
            }
        }

        if self.reliable && state.ack_dirty {
            let hdr = self.header(&mut state, None, false);
            if let Ok(frame) = Self::encode(&hdr, &Bytes::new()) {
                out.push(frame);
            }
        }

        out
    }

    /// Both directions are finished and nothing is awaiting an ack.
    pub(crate) async fn is_finished(&self) -> bool {
        let state = self.state.lock().await;
        let remote_done = state.end_delivered || state.remote_err.is_some();
        state.closed || (remote_done && state.local_end_sent && state.inflight.is_empty())
    }

    /// Tear down on exchange close. Pending reads and writes fail with
    /// `ExchangeClosed`.
    pub(crate) async fn close_by_exchange(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.closed_by_exchange = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    async fn send(
        self: &Arc<Self>,
        body: Bytes,
        end: bool,
        wait: bool,
    ) -> Result<(), Error> {
        let frame = {
            let mut state = self.acquire_window(wait).await?;

            let seq = if self.reliable {
                let seq = state.next_seq;
                state.next_seq += 1;
                Some(seq)
            } else {
                None
            };
            let hdr = self.header(&mut state, seq, end);
            let frame = Self::encode(&hdr, &body)?;

            if let Some(seq) = seq {
                state.inflight.insert(
                    seq,
                    InFlight {
                        body,
                        end,
                        sent_at: Instant::now(),
                        rto: self.rto_initial,
                    },
                );
            }
            if end {
                state.local_end_sent = true;
            }
            state.stats.packets_sent += 1;
            frame
        };

        let exchange = self.exchange.upgrade().ok_or(Error::ExchangeClosed)?;
        match exchange.send_channel_frame(frame).await {
            Ok(()) => Ok(()),
            Err(e @ Error::ExchangeClosed) | Err(e @ Error::ChannelClosed) => Err(e),
            Err(e) if self.reliable => {
                // Transient send failures are the retransmit timer's
                // problem; the packet is already in flight state.
                debug!(channel = %self.id, "send deferred to retransmit: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Lock the state with a free window slot, blocking if asked to.
    async fn acquire_window(&self, wait: bool) -> Result<MutexGuard<'_, ChannelState>, Error> {
        let deadline = {
            let state = self.state.lock().await;
            state.write_deadline.map(|d| Instant::now() + d)
        };

        loop {
            let guard = self.state.lock().await;
            if let Some(err) = Self::terminal_error(&guard) {
                return Err(err);
            }
            if guard.local_end_sent {
                return Err(Error::ChannelClosed);
            }
            if !self.reliable || guard.inflight.len() < self.window {
                return Ok(guard);
            }
            if !wait {
                return Err(Error::Backpressure);
            }

            let wake = self.writable.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            drop(guard);

            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline.into(), wake)
                        .await
                        .map_err(|_| Error::Timeout)?;
                }
                None => wake.await,
            }
        }
    }
}

fn miss_list(state: &ChannelState) -> Vec<u32> {
    let Some((&highest, _)) = state.reorder.iter().next_back() else {
        return Vec::new();
    };
    (state.recv_next..highest)
        .filter(|seq| !state.reorder.contains_key(seq))
        .take(MAX_MISS)
        .collect()
}

/// A bidirectional substream over an exchange.
///
/// Clones share the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Self {
        Channel { shared }
    }

    /// Channel id, 16 hex chars.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Channel type named by the initiator.
    pub fn channel_type(&self) -> &str {
        &self.shared.typ
    }

    /// Whether this channel sequences and retransmits.
    pub fn is_reliable(&self) -> bool {
        self.shared.reliable
    }

    /// Whether the local side opened this channel.
    pub fn is_initiator(&self) -> bool {
        self.shared.initiator
    }

    /// Counters so far.
    pub async fn stats(&self) -> ChannelStats {
        self.shared.state.lock().await.stats
    }

    /// Limit how long a single `read` may wait. `None` waits forever.
    pub async fn set_read_deadline(&self, deadline: Option<Duration>) {
        self.shared.state.lock().await.read_deadline = deadline;
    }

    /// Limit how long a single `write` may wait on a full window.
    pub async fn set_write_deadline(&self, deadline: Option<Duration>) {
        self.shared.state.lock().await.write_deadline = deadline;
    }

    /// Send one payload packet, waiting for window space if needed.
    pub async fn write(&self, body: Bytes) -> Result<(), Error> {
        self.shared.send(body, false, true).await
    }

    /// Like `write`, but fails with `Backpressure` instead of waiting.
    pub async fn try_write(&self, body: Bytes) -> Result<(), Error> {
        self.shared.send(body, false, false).await
    }

    /// Send the final packet. Further writes fail.
    pub async fn write_end(&self) -> Result<(), Error> {
        self.shared.send(Bytes::new(), true, true).await
    }

    /// Terminate the channel with an error the peer will observe.
    pub async fn send_err(&self, reason: &str) -> Result<(), Error> {
        let frame = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Ok(());
            }
            let mut hdr = self.shared.header(&mut state, None, false);
            hdr.err = Some(reason.to_string());
            state.closed = true;
            ChannelShared::encode(&hdr, &Bytes::new())?
        };
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();

        let exchange = self.shared.exchange.upgrade().ok_or(Error::ExchangeClosed)?;
        exchange.send_channel_frame(frame).await
    }

    /// Next in-order payload. `Ok(None)` means the peer sent `end`.
    ///
    /// A missed read deadline returns [`Error::Timeout`] and leaves the
    /// channel usable.
    pub async fn read(&self) -> Result<Option<Bytes>, Error> {
        let deadline = {
            let state = self.shared.state.lock().await;
            state.read_deadline.map(|d| Instant::now() + d)
        };

        loop {
            let mut state = self.shared.state.lock().await;

            if let Some(inbound) = state.ready.pop_front() {
                if inbound.end {
                    state.end_delivered = true;
                    if inbound.body.is_empty() {
                        return Ok(None);
                    }
                }
                return Ok(Some(inbound.body));
            }
            if state.end_delivered {
                return Ok(None);
            }
            if let Some(err) = ChannelShared::terminal_error(&state) {
                return Err(err);
            }

            let wake = self.shared.readable.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            drop(state);

            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline.into(), wake)
                        .await
                        .map_err(|_| Error::Timeout)?;
                }
                None => wake.await,
            }
        }
    }

    /// Close the local side. Sends a best-effort `end` if none was sent;
    /// inbound payload can still be read until the peer ends. Idempotent.
    pub async fn close(&self) {
        let already_ended = {
            let state = self.shared.state.lock().await;
            state.local_end_sent || state.closed
        };
        if !already_ended {
            let _ = self.write_end().await;
        }
        self.shared.writable.notify_waiters();
    }
}

/// Fresh channel id: 8 random bytes, hex encoded.
pub(crate) fn generate_channel_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}
