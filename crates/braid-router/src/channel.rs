//! Channels and session endpoints
//!
//! A [`Channel`] is one authenticated framed connection to a peer. Its write
//! path is a bounded queue drained by a dedicated task, so frames never
//! interleave; its read loop lives in the router, which owns frame dispatch.
//!
//! A session endpoint is either a channel or a raw byte stream ([`Link`]).
//! Raw links front the terminal hop of a path (a dialed TCP connection, the
//! in-process echo sink) or the local stream handed to `Router::dial`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::debug;

use braid_common::{BraidError, Frame, FrameCodec, Result};

/// Unique identity of a session endpoint within one router
///
/// Identities are never reused during a run, so `(ChannelId, sid)` session
/// keys stay unambiguous even when sids collide across channels.
pub type ChannelId = u64;

pub(crate) type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;

/// One authenticated peer connection
pub(crate) struct Channel {
    id: ChannelId,
    /// Authenticated peer name (the bond this channel belongs to)
    name: String,
    /// Slot within the bond
    index: u32,
    /// Remote socket address, for diagnostics and the state snapshot
    remote: String,
    connected_at: DateTime<Utc>,
    /// Concurrent session halves riding this channel
    used: AtomicU64,
    /// Stamped on every inbound frame; the heartbeat reaper compares it
    /// against the configured timeout
    last_recv: Mutex<Instant>,
    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
    removed: AtomicBool,
}

impl Channel {
    /// Build a channel and hand back the receivers its two loops run on.
    pub(crate) fn new(
        id: ChannelId,
        name: String,
        index: u32,
        remote: String,
        queue: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>, watch::Receiver<bool>) {
        let (outbound, outbound_rx) = mpsc::channel(queue);
        let (closed, closed_rx) = watch::channel(false);
        let chan = Arc::new(Self {
            id,
            name,
            index,
            remote,
            connected_at: Utc::now(),
            used: AtomicU64::new(0),
            last_recv: Mutex::new(Instant::now()),
            outbound,
            closed,
            removed: AtomicBool::new(false),
        });
        (chan, outbound_rx, closed_rx)
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn remote(&self) -> &str {
        &self.remote
    }

    pub(crate) fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a frame for the writer task.
    ///
    /// Awaiting queue space is what propagates backpressure from a slow hop
    /// to the session feeding it.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BraidError::ConnectionClosed)
    }

    /// Non-blocking enqueue, used for heartbeats.
    ///
    /// A channel too congested to take a heartbeat is already heading for
    /// the reaper, so the frame is simply dropped.
    pub(crate) fn try_send(&self, frame: Frame) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BraidError::ChannelOverloaded,
            mpsc::error::TrySendError::Closed(_) => BraidError::ConnectionClosed,
        })
    }

    /// Stamp liveness; called for every inbound frame.
    pub(crate) fn touch(&self) {
        *self.last_recv.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_recv.lock().elapsed()
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_used(&self) {
        self.used.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_used(&self) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Signal both loops to stop; safe to call repeatedly.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    /// First caller wins the right to run cascade removal.
    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::SeqCst)
    }
}

/// Writer task: drains the outbound queue into the framed sink.
///
/// Ends when the channel is closed or the queue's senders are gone; either
/// way the sink is closed so the peer sees EOF.
pub(crate) async fn write_loop(
    chan: Arc<Channel>,
    mut outbound: mpsc::Receiver<Frame>,
    mut closed: watch::Receiver<bool>,
    mut sink: FrameSink,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    debug!(channel = chan.id(), peer = chan.name(), "write failed: {}", e);
                    break;
                }
            }
            _ = closed.changed() => break,
        }
    }
    let _ = sink.close().await;
}

/// A raw byte stream acting as one session endpoint
///
/// Writes go through a bounded queue to a writer task owning the stream's
/// write half; the read half is pumped by a task that frames bytes as Data
/// toward the session peer.
#[derive(Clone)]
pub(crate) struct RawLink {
    id: ChannelId,
    /// Target URI (or a label for locally attached streams)
    uri: String,
    outbound: mpsc::Sender<Bytes>,
    closed: Arc<watch::Sender<bool>>,
}

impl RawLink {
    pub(crate) fn new(id: ChannelId, uri: String, queue: usize) -> (Self, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        let (outbound, outbound_rx) = mpsc::channel(queue);
        let (closed, closed_rx) = watch::channel(false);
        (
            Self {
                id,
                uri,
                outbound,
                closed: Arc::new(closed),
            },
            outbound_rx,
            closed_rx,
        )
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) async fn send(&self, bytes: Bytes) -> Result<()> {
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| BraidError::ConnectionClosed)
    }

    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// One session endpoint: a peer channel or a raw stream
///
/// The forwarding path branches on the variant; nothing else distinguishes
/// the terminal hop from a relay hop.
#[derive(Clone)]
pub(crate) enum Link {
    Channel(Arc<Channel>),
    Raw(RawLink),
}

impl Link {
    pub(crate) fn id(&self) -> ChannelId {
        match self {
            Link::Channel(c) => c.id(),
            Link::Raw(r) => r.id(),
        }
    }

    /// Human-readable endpoint label for the state snapshot
    pub(crate) fn label(&self) -> String {
        match self {
            Link::Channel(c) => c.name().to_string(),
            Link::Raw(r) => r.uri().to_string(),
        }
    }

    pub(crate) fn is_channel(&self) -> bool {
        matches!(self, Link::Channel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_used_counter() {
        let (chan, _rx, _closed) = Channel::new(1, "peer".into(), 0, "127.0.0.1:1".into(), 8);
        assert_eq!(chan.used(), 0);
        chan.inc_used();
        chan.inc_used();
        assert_eq!(chan.used(), 2);
        chan.dec_used();
        assert_eq!(chan.used(), 1);
        // never underflows
        chan.dec_used();
        chan.dec_used();
        assert_eq!(chan.used(), 0);
    }

    #[tokio::test]
    async fn test_mark_removed_once() {
        let (chan, _rx, _closed) = Channel::new(1, "peer".into(), 0, "127.0.0.1:1".into(), 8);
        assert!(chan.mark_removed());
        assert!(!chan.mark_removed());
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let (chan, rx, _closed) = Channel::new(1, "peer".into(), 0, "127.0.0.1:1".into(), 8);
        drop(rx);
        assert!(matches!(
            chan.send(Frame::heartbeat()).await,
            Err(BraidError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_touch_resets_idle() {
        let (chan, _rx, _closed) = Channel::new(1, "peer".into(), 0, "127.0.0.1:1".into(), 8);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(chan.idle_for() >= Duration::from_millis(10));
        chan.touch();
        assert!(chan.idle_for() < Duration::from_millis(10));
    }
}
