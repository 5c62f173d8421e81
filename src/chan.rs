//! remux/src/chan.rs
//! The buffered, statistics-tracking channel each Agent uses to move messages
//! to and from its transport. One `Channel` drains an `mpsc` queue onto
//! a writer (`sender_loop`) or pumps a reader into a queue (`receiver_loop`);
//! `TrafficStats` tracks byte/packet counters, per-connection pending-send
//! bookkeeping, and a rolling one-minute send rate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RemuxError, Result};
use crate::message::{self, Message};

const CHANNEL_CAPACITY: usize = 1024;
const RATE_WINDOW_SECS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanMod {
    Sender,
    Receiver,
}

/// Per-channel traffic counters, grounded on the pending-bookkeeping and
/// meter fields kept alongside a Channel in the design notes.
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes: AtomicU64,
    packets: AtomicU64,
    pending_count: AtomicI64,
    pending_size: AtomicI64,
    pending: DashMap<u64, i64>,
    rate_buckets: Mutex<RateBuckets>,
}

#[derive(Debug)]
struct RateBuckets {
    buckets: VecDeque<(Instant, u64)>,
}

impl Default for RateBuckets {
    fn default() -> Self {
        RateBuckets { buckets: VecDeque::with_capacity(RATE_WINDOW_SECS) }
    }
}

impl TrafficStats {
    pub fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
        let mut buckets = self.rate_buckets.lock().unwrap();
        let now = Instant::now();
        buckets.buckets.push_back((now, bytes));
        while let Some((t, _)) = buckets.buckets.front() {
            if now.duration_since(*t) > Duration::from_secs(RATE_WINDOW_SECS as u64) {
                buckets.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Increments the in-flight send count for `id`. Each call must be
    /// matched by exactly one `remove_pending(id)` once that specific message
    /// leaves the sender loop — `pending`'s value is a count of outstanding
    /// sends for `id`, not an accumulated byte size, so two overlapping sends
    /// for the same id don't let the first flush zero out the second's count.
    pub fn add_pending(&self, id: u64, size: i64) {
        self.pending.entry(id).and_modify(|v| *v += 1).or_insert(1);
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        self.pending_size.fetch_add(size, Ordering::Relaxed);
    }

    pub fn remove_pending(&self, id: u64) {
        let mut emptied = false;
        if let Some(mut entry) = self.pending.get_mut(&id) {
            *entry -= 1;
            emptied = *entry <= 0;
        }
        if emptied {
            self.pending.remove(&id);
        }
        self.pending_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_pending_count(&self, id: u64) -> i64 {
        self.pending.get(&id).map(|v| *v).unwrap_or(0)
    }

    pub fn clear_pending(&self) {
        self.pending.clear();
        self.pending_count.store(0, Ordering::Relaxed);
        self.pending_size.store(0, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Bytes/sec averaged over the trailing minute.
    pub fn rate_per_sec(&self) -> f64 {
        let buckets = self.rate_buckets.lock().unwrap();
        let total: u64 = buckets.buckets.iter().map(|(_, b)| *b).sum();
        total as f64 / RATE_WINDOW_SECS as f64
    }
}

/// A buffered, statistics-tracking conduit between an Agent and its
/// transport. Construct one per direction (`ChanMod::Sender` drains outgoing
/// messages, `ChanMod::Receiver` holds inbound ones awaiting dispatch).
pub struct Channel {
    pub r#mod: ChanMod,
    pub name: String,
    tx: mpsc::Sender<(u64, Message)>,
    rx: Mutex<Option<mpsc::Receiver<(u64, Message)>>>,
    stop: CancellationToken,
    pub stats: TrafficStats,
}

impl Channel {
    pub fn new(r#mod: ChanMod, name: impl Into<String>) -> Channel {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Channel {
            r#mod,
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            stop: CancellationToken::new(),
            stats: TrafficStats::default(),
        }
    }

    /// Enqueues `(id, msg)`, tracking it as pending when this is a Sender
    /// channel, so `get_pending_count` reflects in-flight writes until the
    /// sender loop confirms the message left the wire.
    pub async fn send(&self, id: u64, msg: Message) -> Result<()> {
        if self.stop.is_cancelled() {
            return Err(RemuxError::ChannelClosed);
        }
        if self.r#mod == ChanMod::Sender {
            let size = bincode::serialized_size(&id).unwrap_or(0) as i64;
            self.stats.add_pending(id, size.max(1));
        }
        tokio::select! {
            _ = self.stop.cancelled() => Err(RemuxError::ChannelClosed),
            res = self.tx.send((id, msg)) => res.map_err(|_| RemuxError::ChannelClosed),
        }
    }

    /// Drains the internal queue onto `writer` until the channel is closed.
    pub async fn sender_loop<W: AsyncWrite + Unpin>(&self, mut writer: W) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or(RemuxError::ChannelClosed)?;
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                item = rx.recv() => {
                    let Some((id, msg)) = item else { return Ok(()) };
                    let result = message::write_message(&mut writer, &msg).await;
                    self.stats.remove_pending(id);
                    match result {
                        Ok(()) => self.stats.record(1),
                        Err(e) => {
                            warn!(channel = %self.name, error = %e, "sender_loop write failed");
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Reads messages off `reader` and forwards them onto `internal`, which
    /// application code then drains via `internal`'s own queue — the
    /// receive-then-redispatch shape used to decouple wire reads from
    /// message handling.
    pub async fn receiver_loop<R: AsyncRead + Unpin>(
        &self,
        mut reader: R,
        internal: &Channel,
    ) -> Result<()> {
        loop {
            if self.stop.is_cancelled() {
                return Ok(());
            }
            let msg = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                res = message::read_message(&mut reader) => res?,
            };
            self.stats.record(1);
            debug!(channel = %self.name, msg_type = msg.msg_type(), "received");
            internal.send(0, msg).await?;
        }
    }

    pub fn get_pending_count(&self, id: u64) -> i64 {
        self.stats.get_pending_count(id)
    }

    /// Takes ownership of the receiving half of the internal queue, for a
    /// caller that wants to drain enqueued messages directly instead of
    /// going through `sender_loop`. Returns `None` if already taken.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<(u64, Message)>> {
        self.rx.lock().unwrap().take()
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Idempotent; cancels in-flight sends/receives and clears pending stats.
    pub fn close(&self) {
        if !self.stop.is_cancelled() {
            self.stop.cancel();
            self.stats.clear_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Ping};

    #[tokio::test]
    async fn send_then_sender_loop_writes_to_transport() {
        let chan = Channel::new(ChanMod::Sender, "test-sender");
        let (a, mut b) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            let msg = Message::Ping(Ping { ping: "ping".into() });
            chan.send(1, msg).await.unwrap();
            chan.close();
            let _ = chan.sender_loop(a).await;
        });
        let got = message::read_message(&mut b).await.unwrap();
        assert!(matches!(got, Message::Ping(_)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn receiver_loop_forwards_into_internal_channel() {
        let recv_chan = Channel::new(ChanMod::Receiver, "test-receiver");
        let internal = Channel::new(ChanMod::Receiver, "test-internal");
        let (mut a, b) = tokio::io::duplex(4096);
        message::write_message(&mut a, &Message::Ping(Ping { ping: "ping".into() }))
            .await
            .unwrap();

        let internal_rx = internal.rx.lock().unwrap().take().unwrap();
        tokio::spawn(async move {
            let _ = recv_chan.receiver_loop(b, &internal).await;
        });

        let mut internal_rx = internal_rx;
        let (_, msg) = internal_rx.recv().await.unwrap();
        assert!(matches!(msg, Message::Ping(_)));
    }

    #[test]
    fn pending_count_tracks_add_and_remove() {
        let stats = TrafficStats::default();
        stats.add_pending(7, 128);
        assert_eq!(stats.get_pending_count(7), 1);
        stats.remove_pending(7);
        assert_eq!(stats.get_pending_count(7), 0);
    }

    #[test]
    fn overlapping_sends_for_same_id_dont_clear_on_first_flush() {
        let stats = TrafficStats::default();
        stats.add_pending(9, 64);
        stats.add_pending(9, 64);
        stats.remove_pending(9);
        assert_eq!(stats.get_pending_count(9), 1, "second in-flight send must still be counted");
        stats.remove_pending(9);
        assert_eq!(stats.get_pending_count(9), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let chan = Channel::new(ChanMod::Sender, "idempotent");
        chan.close();
        chan.close();
        assert!(chan.is_closed());
    }
}
