//! remux/src/bridge.rs
//! A Bridge is one proxied connection multiplexed onto an Agent's message
//! channel. Bytes arriving as `Packet`s are pushed into an internal
//! buffer that the local side drains; bytes read from the local side are
//! wrapped as `Packet`s and handed to a `MessageSink` for delivery. Closing a
//! bridge drains both directions before emitting `ConnEnd`, so neither peer
//! sees a dropped tail.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use governor::DefaultDirectRateLimiter;
use nonzero_ext::nonzero;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{RemuxError, Result};
use crate::message::{self, ConnEnd, ConnStart, Message, Packet};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const PUMP_CHUNK: usize = 16 * 1024;

/// The part of an Agent a Bridge needs: somewhere to post outbound messages
/// and a way to ask how many of this bridge's sends are still in flight.
/// Narrowing to a trait here, rather than taking `Arc<Agent>` directly, keeps
/// this module buildable and testable without the rest of the agent machinery.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, id: u64, msg: Message) -> Result<()>;
    fn pending_count(&self, id: u64) -> i64;
    fn agent_id(&self) -> &str;
}

pub struct Bridge {
    pub id: u64,
    pub source: String,
    pub destination: String,
    sink: Arc<dyn MessageSink>,
    recv_sum: AtomicU64,
    drained: AtomicU64,
    send_sum: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    fill: AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    drain: AsyncMutex<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    rate_limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl Bridge {
    fn new(id: u64, sink: Arc<dyn MessageSink>, source: String, destination: String) -> Bridge {
        let (a, b) = tokio::io::duplex(message::MAX_PACKET_SIZE as usize * 4);
        let (_, fill) = tokio::io::split(a);
        let (drain, _) = tokio::io::split(b);
        Bridge {
            id,
            source,
            destination,
            sink,
            recv_sum: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            send_sum: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            fill: AsyncMutex::new(fill),
            drain: AsyncMutex::new(drain),
            rate_limiter: None,
        }
    }

    /// Bridge representing the connection that originated locally (this
    /// process dialed out or accepted a client); `source`/`destination` are
    /// resolved by the caller from the owning agent's id and redirect target.
    /// Announces itself to the peer by sending `ConnStart` before returning,
    /// so a local-side bridge always exists on the wire before any `Packet`
    /// referencing its id can follow.
    pub async fn new_local_side(
        id: u64,
        sink: Arc<dyn MessageSink>,
        source: String,
        destination: String,
    ) -> Result<Arc<Bridge>> {
        let start = Message::ConnStart(ConnStart { id, source: source.clone(), destination: destination.clone() });
        let wrapped = message::wrap(&source, &destination, start);
        sink.send(id, wrapped).await?;
        Ok(Arc::new(Bridge::new(id, sink, source, destination)))
    }

    /// Bridge representing the remote end of a connection started by a peer's
    /// `ConnStart`; `id` and addressing come straight from that message.
    pub fn new_remote_side(msg_id: u64, sink: Arc<dyn MessageSink>, source: String) -> Arc<Bridge> {
        let destination = source.clone();
        let own_id = sink_agent_id(&sink);
        Arc::new(Bridge::new(msg_id, sink, own_id, destination))
    }

    pub fn with_rate_limiter(mut self: Arc<Self>, limiter: Arc<DefaultDirectRateLimiter>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .map(|b| b.rate_limiter = Some(limiter));
        self
    }

    pub fn send_sum(&self) -> u64 {
        self.send_sum.load(Ordering::Relaxed)
    }

    pub fn recv_sum(&self) -> u64 {
        self.recv_sum.load(Ordering::Relaxed)
    }

    /// Feeds bytes that arrived as a `Packet` into the internal buffer for
    /// this bridge's local side to drain via `read`.
    pub async fn push_data(&self, data: &[u8]) -> Result<()> {
        let mut w = self.fill.lock().await;
        w.write_all(data).await?;
        self.recv_sum.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Drains bytes pushed in by `push_data`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut r = self.drain.lock().await;
        let n = r.read(buf).await?;
        self.drained.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Wraps `data` as a `Packet` addressed `source -> destination` and hands
    /// it to the sink.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if let Some(limiter) = &self.rate_limiter {
            let n = u32::try_from(data.len()).unwrap_or(u32::MAX).max(1);
            let n = std::num::NonZeroU32::new(n).unwrap_or(nonzero!(1u32));
            limiter
                .until_n_ready(n)
                .await
                .map_err(|e| RemuxError::Hook(format!("rate limit burst exceeded: {e}")))?;
        }
        let packet = Message::Packet(Packet { id: self.id, data: data.to_vec() });
        let wrapped = message::wrap(&self.source, &self.destination, packet);
        self.sink.send(self.id, wrapped).await?;
        self.send_sum.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Bidirectionally splices `local` against this bridge's wire-facing
    /// read/write pair with a biased select loop, until either side closes
    /// or the bridge cancels.
    pub async fn pump<S>(&self, local: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut local_r, mut local_w) = tokio::io::split(local);
        let to_wire = async {
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                let n = local_r.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                self.write(&buf[..n]).await?;
            }
            Ok::<(), RemuxError>(())
        };
        let from_wire = async {
            let mut buf = vec![0u8; PUMP_CHUNK];
            loop {
                let n = self.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                local_w.write_all(&buf[..n]).await?;
            }
            Ok::<(), RemuxError>(())
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(()),
            r = to_wire => r,
            r = from_wire => r,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain-then-close: polls every 100ms, up to 60s, until every byte
    /// pushed in has been drained out and no send on this bridge's id is
    /// still pending, then emits `ConnEnd` and tears down the buffer.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let drained = self.drained.load(Ordering::Relaxed);
            let recv = self.recv_sum.load(Ordering::Relaxed);
            let pending = self.sink.pending_count(self.id);
            if drained == recv && pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(bridge = self.id, "safe close timed out, forcing close");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        let end = Message::ConnEnd(ConnEnd { id: self.id, msg: String::new() });
        let wrapped = message::wrap(&self.source, &self.destination, end);
        if let Err(e) = self.sink.send(self.id, wrapped).await {
            warn!(bridge = self.id, error = %e, "failed to send ConnEnd");
        }
        self.cancel.cancel();
        Ok(())
    }
}

fn sink_agent_id(sink: &Arc<dyn MessageSink>) -> String {
    sink.agent_id().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        agent_id: String,
        sent: Mutex<Vec<(u64, Message)>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send(&self, id: u64, msg: Message) -> Result<()> {
            self.sent.lock().unwrap().push((id, msg));
            Ok(())
        }
        fn pending_count(&self, _id: u64) -> i64 {
            0
        }
        fn agent_id(&self) -> &str {
            &self.agent_id
        }
    }

    #[tokio::test]
    async fn new_local_side_emits_conn_start() {
        let sink = Arc::new(RecordingSink { agent_id: "a1".into(), sent: Mutex::new(vec![]) });
        let _bridge = Bridge::new_local_side(1, sink.clone(), "a1".to_string(), "a1".to_string())
            .await
            .unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            Message::ConnStart(cs) => {
                assert_eq!(cs.id, 1);
                assert_eq!(cs.source, "a1");
                assert_eq!(cs.destination, "a1");
            }
            _ => panic!("expected ConnStart"),
        }
    }

    #[tokio::test]
    async fn write_wraps_data_as_redirected_packet() {
        let sink = Arc::new(RecordingSink { agent_id: "a1".into(), sent: Mutex::new(vec![]) });
        let bridge = Bridge::new_local_side(1, sink.clone(), "a1".to_string(), "b1".to_string())
            .await
            .unwrap();
        bridge.write(b"hello").await.unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        match &sent[1].1 {
            Message::Redirect(r) => {
                assert_eq!(r.source, "a1");
                assert_eq!(r.destination, "b1");
            }
            _ => panic!("expected Redirect"),
        }
    }

    #[tokio::test]
    async fn push_data_then_read_drains_in_order() {
        let sink = Arc::new(RecordingSink { agent_id: "a1".into(), sent: Mutex::new(vec![]) });
        let bridge = Bridge::new_local_side(1, sink, "a1".to_string(), "a1".to_string())
            .await
            .unwrap();
        bridge.push_data(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        let n = bridge.read(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn close_sends_conn_end_and_is_idempotent() {
        let sink = Arc::new(RecordingSink { agent_id: "a1".into(), sent: Mutex::new(vec![]) });
        let bridge = Bridge::new_local_side(5, sink.clone(), "a1".to_string(), "a1".to_string())
            .await
            .unwrap();
        bridge.close().await.unwrap();
        bridge.close().await.unwrap();
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[1].1, Message::ConnEnd(_)));
    }
}
