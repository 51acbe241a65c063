//! The router: accept, login, dial, forward, reap
//!
//! One router owns the bond set, the session tables, and the sid allocator.
//! Channels feed it frames from their read loops; it forwards them by table
//! lookup and keeps the two tables consistent with channel lifetime.
//!
//! Locking: the bond map and the session tables are guarded by parking_lot
//! locks taken only for table operations; no lock is ever held across I/O.
//! Frame writes go through each channel's bounded queue, which is where
//! backpressure lives.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use braid_common::protocol::DEFAULT_MAX_FRAME_LEN;
use braid_common::{path, BraidError, Command, Frame, FrameCodec, LoginReply, LoginRequest, Result};

use crate::bond::Bond;
use crate::channel::{write_loop, Channel, ChannelId, Link, RawLink};
use crate::dialer::{BoxedStream, RawDialer, RawStream, TcpRawDialer};
use crate::state::{BondState, ChannelState, EndpointState, RouterState, SessionState};
use crate::table::{PendingDial, PendingOrigin, SessionHalf, Tables};

/// Read size for raw terminal streams
const RAW_READ_BUF: usize = 32 * 1024;

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Local peer name, announced in LoginBack
    pub name: String,
    /// Peer name → expected token
    pub acl: HashMap<String, String>,
    /// Interval between outgoing Heartbeat frames
    pub heartbeat_period: Duration,
    /// Silence after which a channel is reaped; defaults to 5x the period
    pub heartbeat_timeout: Option<Duration>,
    /// Upper bound on a frame body; an oversized frame reaps its channel
    pub max_frame_len: usize,
    /// How long an accepted connection may take to present its Login
    pub login_window: Duration,
    /// Bound of each channel's outbound frame queue
    pub outbound_queue: usize,
}

impl RouterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            acl: HashMap::new(),
            heartbeat_period: Duration::from_secs(5),
            heartbeat_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            login_window: Duration::from_secs(10),
            outbound_queue: 256,
        }
    }
}

/// Options for one outbound channel, used by [`Router::login_channels`]
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Remote `host:port` to connect to
    pub remote: String,
    /// Token presented for the local name
    pub token: String,
    /// Requested slot within the bond
    pub index: u32,
}

/// A multi-hop tunneling router
///
/// Cheap to clone; all clones share one router.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

pub(crate) struct RouterInner {
    name: String,
    acl: RwLock<HashMap<String, String>>,
    bonds: RwLock<HashMap<String, Bond>>,
    tables: Mutex<Tables>,
    /// Endpoint identities; never reused during a run
    id_alloc: AtomicU64,
    /// Session ids for frames this router sends; strictly monotonic
    sid_alloc: AtomicU64,
    dialer: Arc<dyn RawDialer>,
    heartbeat_period: Duration,
    heartbeat_timeout: Duration,
    max_frame_len: usize,
    login_window: Duration,
    outbound_queue: usize,
    closed: AtomicBool,
    heartbeat_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Build a router with the default `tcp://`/echo terminal dialer.
    pub fn new(config: RouterConfig) -> Self {
        Self::with_dialer(config, Arc::new(TcpRawDialer))
    }

    /// Build a router with a custom terminal-hop dialer.
    pub fn with_dialer(config: RouterConfig, dialer: Arc<dyn RawDialer>) -> Self {
        let heartbeat_timeout = config
            .heartbeat_timeout
            .unwrap_or(config.heartbeat_period * 5);
        Self {
            inner: Arc::new(RouterInner {
                name: config.name,
                acl: RwLock::new(config.acl),
                bonds: RwLock::new(HashMap::new()),
                tables: Mutex::new(Tables::default()),
                id_alloc: AtomicU64::new(1),
                sid_alloc: AtomicU64::new(1),
                dialer,
                heartbeat_period: config.heartbeat_period,
                heartbeat_timeout,
                max_frame_len: config.max_frame_len,
                login_window: config.login_window,
                outbound_queue: config.outbound_queue,
                closed: AtomicBool::new(false),
                heartbeat_started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Local peer name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add or replace one ACL entry.
    pub fn add_acl(&self, name: impl Into<String>, token: impl Into<String>) {
        self.inner.acl.write().insert(name.into(), token.into());
    }

    /// Accept authenticated peers on `addr`; returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        self.inner.ensure_open()?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(name = %self.inner.name, %local, "listening for peers");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            handle_accept(inner, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        self.inner.tasks.lock().push(handle);
        self.ensure_heartbeat();
        Ok(local)
    }

    /// Establish one outbound channel; returns the accepting peer's name.
    pub async fn login(&self, remote: &str, token: &str, index: u32) -> Result<String> {
        self.inner.ensure_open()?;
        let stream = TcpStream::connect(remote).await?;
        let peer_addr = stream.peer_addr()?.to_string();
        let mut framed = Framed::new(
            stream,
            FrameCodec::with_max_frame_len(self.inner.max_frame_len),
        );

        let request = LoginRequest::new(&self.inner.name, token, index);
        framed.send(request.to_frame()?).await?;

        let frame = match timeout(self.inner.login_window, framed.next()).await {
            Err(_) => return Err(BraidError::LoginTimeout),
            Ok(None) => return Err(BraidError::ConnectionClosed),
            Ok(Some(item)) => item?,
        };
        if frame.cmd != Command::LoginBack {
            return Err(BraidError::UnexpectedCommand {
                expected: "LoginBack",
                actual: frame.cmd.name(),
            });
        }
        let reply = LoginReply::from_payload(&frame.payload)?;
        if let Some(message) = reply.error {
            return Err(BraidError::AuthFailed(message));
        }
        let peer_name = reply
            .name
            .ok_or_else(|| BraidError::MalformedPayload("login reply without name".into()))?;

        let chan = self.inner.install_channel(&peer_name, peer_addr, framed);
        info!(
            name = %self.inner.name,
            peer = %peer_name,
            index = chan.index(),
            %remote,
            "logged in to peer"
        );
        self.ensure_heartbeat();
        Ok(peer_name)
    }

    /// Establish several bonded channels in parallel.
    pub async fn login_channels(&self, options: &[ChannelOptions]) -> Result<()> {
        let logins = options
            .iter()
            .map(|opt| self.login(&opt.remote, &opt.token, opt.index));
        futures::future::try_join_all(logins).await?;
        Ok(())
    }

    /// Initiate a session for a local stream; returns the allocated sid.
    ///
    /// Resolution errors and remote dial failures surface here; the stream
    /// is attached (and bytes start flowing) only after a successful
    /// DialBack.
    pub async fn dial<S>(&self, dial_path: &str, stream: S) -> Result<u64>
    where
        S: RawStream + 'static,
    {
        self.inner.dial(dial_path, Box::new(stream)).await
    }

    /// Dial and get back an in-process stream for the session.
    pub async fn dial_stream(&self, dial_path: &str) -> Result<tokio::io::DuplexStream> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        self.inner.dial(dial_path, Box::new(far)).await?;
        Ok(near)
    }

    /// Handle to the bond for `name`, if one exists.
    pub fn select_bond(&self, name: &str) -> Option<BondHandle> {
        if !self.inner.bonds.read().contains_key(name) {
            return None;
        }
        Some(BondHandle {
            inner: self.inner.clone(),
            name: name.to_string(),
        })
    }

    /// Read-only snapshot of bonds and sessions.
    pub fn state(&self) -> RouterState {
        self.inner.state()
    }

    /// Shut down every channel and session; idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(name = %self.inner.name, "closing router");

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let channels: Vec<Arc<Channel>> = {
            let bonds = self.inner.bonds.read();
            bonds
                .values()
                .flat_map(|bond| bond.channels().cloned())
                .collect()
        };
        // Stop every channel's loops first so no cascade write can block on
        // a stalled peer queue
        for chan in &channels {
            chan.close();
        }
        for chan in channels {
            self.inner.remove_channel(&chan, "router closed").await;
        }

        // Anything left is raw-to-raw or a local pending
        let cascade = { self.inner.tables.lock().drain() };
        for half in cascade.peers {
            RouterInner::notify_closed(&half, "router closed").await;
        }
        for (_, pending) in cascade.pendings_via {
            RouterInner::fail_pending(pending.origin, "router closed").await;
        }
    }

    fn ensure_heartbeat(&self) {
        if self.inner.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            heartbeat_loop(inner).await;
        });
        self.inner.tasks.lock().push(handle);
    }
}

/// Handle to one bond, mainly for tearing it down
pub struct BondHandle {
    inner: Arc<RouterInner>,
    name: String,
}

impl BondHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channels currently in the bond
    pub fn channel_count(&self) -> usize {
        self.inner
            .bonds
            .read()
            .get(&self.name)
            .map(|bond| bond.channels().count())
            .unwrap_or(0)
    }

    /// Close every channel in the bond, cascading their sessions.
    pub async fn close(&self) {
        let channels: Vec<Arc<Channel>> = {
            let bonds = self.inner.bonds.read();
            match bonds.get(&self.name) {
                Some(bond) => bond.channels().cloned().collect(),
                None => return,
            }
        };
        for chan in channels {
            self.inner.remove_channel(&chan, "bond closed").await;
        }
    }
}

impl RouterInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BraidError::RouterClosed);
        }
        Ok(())
    }

    fn alloc_id(&self) -> ChannelId {
        self.id_alloc.fetch_add(1, Ordering::SeqCst)
    }

    fn alloc_sid(&self) -> u64 {
        self.sid_alloc.fetch_add(1, Ordering::SeqCst)
    }

    fn select_channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.bonds.read().get(name)?.select()
    }

    /// Register an authenticated connection as a channel and start its loops.
    ///
    /// The channel takes the next free slot in its bond.
    fn install_channel(
        self: &Arc<Self>,
        peer_name: &str,
        remote: String,
        framed: Framed<TcpStream, FrameCodec>,
    ) -> Arc<Channel> {
        let (chan, outbound_rx, closed_rx) = {
            let mut bonds = self.bonds.write();
            let bond = bonds.entry(peer_name.to_string()).or_default();
            let index = bond.assign_index();
            let (chan, outbound_rx, closed_rx) = Channel::new(
                self.alloc_id(),
                peer_name.to_string(),
                index,
                remote,
                self.outbound_queue,
            );
            bond.insert(chan.clone());
            (chan, outbound_rx, closed_rx)
        };

        let (sink, frames) = framed.split();
        tokio::spawn(write_loop(
            chan.clone(),
            outbound_rx,
            closed_rx.clone(),
            sink,
        ));
        let inner = self.clone();
        let read_chan = chan.clone();
        tokio::spawn(async move {
            read_loop(inner, read_chan, frames, closed_rx).await;
        });
        chan
    }

    /// Local dial: resolve the path here, then either dial the terminal
    /// target or forward a Dial frame and wait for its DialBack.
    async fn dial(self: &Arc<Self>, dial_path: &str, stream: BoxedStream) -> Result<u64> {
        self.ensure_open()?;
        path::validate(dial_path)?;

        let mut rest = dial_path.to_string();
        let (head, tail) = loop {
            let (head, tail) = {
                let (h, t) = path::split_head(&rest);
                (h.to_string(), t.map(str::to_string))
            };
            if path::is_terminal(&head) {
                if tail.is_some() {
                    return Err(BraidError::DialFailed(format!(
                        "unexpected hops after terminal uri {}",
                        head
                    )));
                }
                // Purely local session: caller stream <-> dialed target
                let sid = self.alloc_sid();
                let remote = self.dialer.dial(sid, &head).await?;
                self.attach_local_pair(stream, dial_path, remote, &head, sid);
                return Ok(sid);
            }
            if path::hop_name(&head) == self.name {
                match tail {
                    Some(t) => {
                        rest = t;
                        continue;
                    }
                    None => {
                        return Err(BraidError::DialFailed("path ends at local node".into()))
                    }
                }
            }
            break (head, tail);
        };

        let name = path::hop_name(&head).to_string();
        let tail = tail
            .ok_or_else(|| BraidError::DialFailed(format!("no target after {}", name)))?;
        let next = self
            .select_channel(&name)
            .ok_or_else(|| BraidError::ChannelNotFound(name))?;

        let sid = self.alloc_sid();
        let (notify, acked) = oneshot::channel();
        {
            self.tables.lock().insert_pending(
                sid,
                PendingDial {
                    next: next.clone(),
                    origin: PendingOrigin::Local {
                        stream,
                        label: dial_path.to_string(),
                        notify,
                    },
                },
            );
        }
        next.inc_used();
        debug!(name = %self.name, sid, path = %dial_path, "dial forwarded");

        if next.send(Frame::dial(sid, &tail)).await.is_err() {
            if self.tables.lock().remove_pending(next.id(), sid).is_some() {
                next.dec_used();
            }
            return Err(BraidError::ConnectionClosed);
        }

        match acked.await {
            Ok(Ok(())) => Ok(sid),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BraidError::RouterClosed),
        }
    }

    /// Pair a local stream with a locally dialed terminal stream.
    fn attach_local_pair(
        self: &Arc<Self>,
        local: BoxedStream,
        local_label: &str,
        remote: BoxedStream,
        remote_label: &str,
        sid: u64,
    ) {
        let (local_raw, local_rx, local_closed) = self.make_raw(local_label);
        let (remote_raw, remote_rx, remote_closed) = self.make_raw(remote_label);
        {
            self.tables.lock().insert_session(
                Link::Raw(local_raw.clone()),
                sid,
                Link::Raw(remote_raw.clone()),
                sid,
            );
        }
        self.spawn_raw_pumps(local_raw, local, sid, local_rx, local_closed);
        self.spawn_raw_pumps(remote_raw, remote, sid, remote_rx, remote_closed);
    }

    fn make_raw(&self, label: &str) -> (RawLink, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        RawLink::new(self.alloc_id(), label.to_string(), self.outbound_queue)
    }

    /// Start the two pump tasks of a raw endpoint.
    ///
    /// Callers install the session entries (and queue any DialBack) first,
    /// so a fast first read cannot outrun session establishment.
    fn spawn_raw_pumps(
        self: &Arc<Self>,
        raw: RawLink,
        stream: BoxedStream,
        sid: u64,
        mut outbound: mpsc::Receiver<Bytes>,
        closed: watch::Receiver<bool>,
    ) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let mut writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = outbound.recv() => {
                        let Some(bytes) = item else { break };
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    _ = writer_closed.changed() => break,
                }
            }
            let _ = write_half.shutdown().await;
        });

        let inner = self.clone();
        let mut reader_closed = closed;
        tokio::spawn(async move {
            let mut buf = vec![0u8; RAW_READ_BUF];
            loop {
                tokio::select! {
                    read = read_half.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        let half = { inner.tables.lock().lookup_peer(raw.id(), sid) };
                        let Some(half) = half else { break };
                        let sent = match &half.peer {
                            Link::Channel(c) => {
                                c.send(Frame::data(half.peer_sid, Bytes::copy_from_slice(&buf[..n]))).await
                            }
                            Link::Raw(r) => r.send(Bytes::copy_from_slice(&buf[..n])).await,
                        };
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = reader_closed.changed() => break,
                }
            }
            inner.close_raw_session(&raw, sid, "raw endpoint closed").await;
        });
    }

    /// Tear down the session anchored at a raw endpoint.
    async fn close_raw_session(self: &Arc<Self>, raw: &RawLink, sid: u64, reason: &str) {
        raw.close();
        let removed = { self.tables.lock().remove_session(raw.id(), sid) };
        if let Some(half) = removed {
            Self::dec_if_channel(&half.peer);
            Self::notify_closed(&half, reason).await;
        }
    }

    fn dec_if_channel(link: &Link) {
        if let Link::Channel(chan) = link {
            chan.dec_used();
        }
    }

    /// Tell one endpoint its session is gone; best effort.
    async fn notify_closed(half: &SessionHalf, reason: &str) {
        match &half.peer {
            Link::Channel(chan) => {
                let _ = chan.send(Frame::closed(half.peer_sid, reason)).await;
            }
            Link::Raw(raw) => raw.close(),
        }
    }

    /// Report a failed dial to whoever asked for it.
    async fn fail_pending(origin: PendingOrigin, message: &str) {
        match origin {
            PendingOrigin::Channel { chan, sid } => {
                let _ = chan.send(Frame::dial_back_err(sid, message)).await;
            }
            PendingOrigin::Local { notify, .. } => {
                let _ = notify.send(Err(BraidError::DialFailed(message.to_string())));
            }
        }
    }

    /// Frame dispatch; an error reaps the channel.
    async fn handle_frame(self: &Arc<Self>, chan: &Arc<Channel>, frame: Frame) -> Result<()> {
        match frame.cmd {
            Command::Heartbeat => Ok(()),
            Command::Data => {
                self.proc_data(chan, frame).await;
                Ok(())
            }
            Command::Dial => {
                self.proc_dial(chan, frame).await;
                Ok(())
            }
            Command::DialBack => {
                self.proc_dial_back(chan, frame).await;
                Ok(())
            }
            Command::Closed => {
                self.proc_closed(chan, frame).await;
                Ok(())
            }
            // A second handshake on a live channel is a protocol violation
            Command::Login | Command::LoginBack => Err(BraidError::UnexpectedCommand {
                expected: "session command",
                actual: frame.cmd.name(),
            }),
        }
    }

    /// Resolve an inbound Dial: terminal dial here, or forward down-path.
    async fn proc_dial(self: &Arc<Self>, chan: &Arc<Channel>, frame: Frame) {
        let inbound_sid = frame.sid;
        let dial_path = frame.payload_str();
        debug!(name = %self.name, sid = inbound_sid, path = %dial_path, "dial received");

        if let Err(e) = path::validate(&dial_path) {
            let _ = chan
                .send(Frame::dial_back_err(inbound_sid, &e.to_string()))
                .await;
            return;
        }

        let mut rest = dial_path.clone();
        let (head, tail) = loop {
            let (head, tail) = {
                let (h, t) = path::split_head(&rest);
                (h.to_string(), t.map(str::to_string))
            };
            if path::is_terminal(&head) {
                if tail.is_some() {
                    let _ = chan
                        .send(Frame::dial_back_err(
                            inbound_sid,
                            &format!("unexpected hops after terminal uri {}", head),
                        ))
                        .await;
                    return;
                }
                self.dial_terminal(chan, inbound_sid, &head).await;
                return;
            }
            if path::hop_name(&head) == self.name {
                match tail {
                    Some(t) => {
                        rest = t;
                        continue;
                    }
                    None => {
                        let _ = chan
                            .send(Frame::dial_back_err(inbound_sid, "path ends at this node"))
                            .await;
                        return;
                    }
                }
            }
            break (head, tail);
        };

        let name = path::hop_name(&head).to_string();
        let Some(tail) = tail else {
            let _ = chan
                .send(Frame::dial_back_err(
                    inbound_sid,
                    &format!("no target after {}", name),
                ))
                .await;
            return;
        };
        let Some(next) = self.select_channel(&name) else {
            let _ = chan
                .send(Frame::dial_back_err(
                    inbound_sid,
                    &format!("channel not found: {}", name),
                ))
                .await;
            return;
        };

        let local_sid = self.alloc_sid();
        {
            self.tables.lock().insert_pending(
                local_sid,
                PendingDial {
                    next: next.clone(),
                    origin: PendingOrigin::Channel {
                        chan: chan.clone(),
                        sid: inbound_sid,
                    },
                },
            );
        }
        next.inc_used();

        if next.send(Frame::dial(local_sid, &tail)).await.is_err() {
            if self
                .tables
                .lock()
                .remove_pending(next.id(), local_sid)
                .is_some()
            {
                next.dec_used();
            }
            let _ = chan
                .send(Frame::dial_back_err(inbound_sid, "channel closed"))
                .await;
        }
    }

    /// Dial the terminal target of a path on behalf of an inbound channel.
    async fn dial_terminal(self: &Arc<Self>, chan: &Arc<Channel>, inbound_sid: u64, uri: &str) {
        match self.dialer.dial(inbound_sid, uri).await {
            Err(e) => {
                debug!(name = %self.name, uri, "terminal dial failed: {}", e);
                let _ = chan
                    .send(Frame::dial_back_err(inbound_sid, &e.to_string()))
                    .await;
            }
            Ok(stream) => {
                let (raw, outbound_rx, closed_rx) = self.make_raw(uri);
                {
                    self.tables.lock().insert_session(
                        Link::Raw(raw.clone()),
                        inbound_sid,
                        Link::Channel(chan.clone()),
                        inbound_sid,
                    );
                }
                chan.inc_used();
                // DialBack must be queued before the pumps can frame any
                // bytes, or the origin would see Data for an unknown sid.
                if chan.send(Frame::dial_back_ok(inbound_sid)).await.is_ok() {
                    self.spawn_raw_pumps(raw, stream, inbound_sid, outbound_rx, closed_rx);
                } else {
                    raw.close();
                    if self
                        .tables
                        .lock()
                        .remove_session(raw.id(), inbound_sid)
                        .is_some()
                    {
                        chan.dec_used();
                    }
                }
            }
        }
    }

    /// Pair a DialBack with its pending dial.
    async fn proc_dial_back(self: &Arc<Self>, chan: &Arc<Channel>, frame: Frame) {
        let pending = { self.tables.lock().remove_pending(chan.id(), frame.sid) };
        let Some(pending) = pending else {
            // Stale acknowledgement; tell the sender that session is dead
            debug!(name = %self.name, sid = frame.sid, "stale dial-back");
            let _ = chan
                .send(Frame::closed(frame.sid, "no pending dial"))
                .await;
            return;
        };

        if frame.is_dial_back_ok() {
            match pending.origin {
                PendingOrigin::Channel { chan: origin, sid: origin_sid } => {
                    {
                        self.tables.lock().insert_session(
                            Link::Channel(origin.clone()),
                            origin_sid,
                            Link::Channel(chan.clone()),
                            frame.sid,
                        );
                    }
                    origin.inc_used();
                    if origin.send(Frame::dial_back_ok(origin_sid)).await.is_err() {
                        // Origin died first; its read loop will cascade
                        debug!(name = %self.name, "origin closed before dial-back relay");
                    }
                }
                PendingOrigin::Local { stream, label, notify } => {
                    let (raw, outbound_rx, closed_rx) = self.make_raw(&label);
                    {
                        self.tables.lock().insert_session(
                            Link::Raw(raw.clone()),
                            frame.sid,
                            Link::Channel(chan.clone()),
                            frame.sid,
                        );
                    }
                    let _ = notify.send(Ok(()));
                    self.spawn_raw_pumps(raw, stream, frame.sid, outbound_rx, closed_rx);
                }
            }
        } else {
            chan.dec_used();
            let message = frame.payload_str();
            debug!(name = %self.name, sid = frame.sid, "dial failed: {}", message);
            Self::fail_pending(pending.origin, &message).await;
        }
    }

    /// Forward Data along the session, or answer Closed for a stale sid.
    async fn proc_data(self: &Arc<Self>, chan: &Arc<Channel>, frame: Frame) {
        let half = { self.tables.lock().lookup_peer(chan.id(), frame.sid) };
        let Some(half) = half else {
            let _ = chan.send(Frame::closed(frame.sid, "no session")).await;
            return;
        };

        let sent = match &half.peer {
            Link::Channel(peer) => peer.send(Frame::data(half.peer_sid, frame.payload)).await,
            Link::Raw(raw) => raw.send(frame.payload).await,
        };
        if sent.is_err() {
            // Peer endpoint is gone; drop the session and tell the sender
            let removed = { self.tables.lock().remove_session(chan.id(), frame.sid) };
            if let Some(half) = removed {
                chan.dec_used();
                Self::dec_if_channel(&half.peer);
                Self::notify_closed(&half, "peer endpoint closed").await;
            }
            let _ = chan
                .send(Frame::closed(frame.sid, "peer endpoint closed"))
                .await;
        }
    }

    /// Half-close: drop both session halves and pass the close along.
    async fn proc_closed(self: &Arc<Self>, chan: &Arc<Channel>, frame: Frame) {
        let reason = frame.payload_str();

        let removed = { self.tables.lock().remove_session(chan.id(), frame.sid) };
        if let Some(half) = removed {
            chan.dec_used();
            Self::dec_if_channel(&half.peer);
            Self::notify_closed(&half, &reason).await;
            return;
        }

        // A pending forwarded on this channel: downstream gave up early
        let pending = { self.tables.lock().remove_pending(chan.id(), frame.sid) };
        if let Some(pending) = pending {
            chan.dec_used();
            Self::fail_pending(pending.origin, "closed before dial-back").await;
            return;
        }

        // A pending this channel originated: cancel it downstream
        let by_origin = {
            self.tables
                .lock()
                .remove_pending_by_origin(chan.id(), frame.sid)
        };
        if let Some((local_sid, pending)) = by_origin {
            pending.next.dec_used();
            let _ = pending
                .next
                .send(Frame::closed(local_sid, "origin closed"))
                .await;
            return;
        }

        // Duplicate close; drop it
        debug!(name = %self.name, sid = frame.sid, "close for unknown session");
    }

    /// Remove a channel and cascade: sessions get Closed, pendings fail.
    async fn remove_channel(self: &Arc<Self>, chan: &Arc<Channel>, reason: &str) {
        if !chan.mark_removed() {
            return;
        }
        info!(
            name = %self.name,
            peer = chan.name(),
            index = chan.index(),
            reason,
            "removing channel"
        );
        chan.close();

        {
            let mut bonds = self.bonds.write();
            if let Some(bond) = bonds.get_mut(chan.name()) {
                bond.remove(chan);
                if bond.is_empty() {
                    bonds.remove(chan.name());
                }
            }
        }

        let cascade = { self.tables.lock().remove_by_link(chan.id()) };

        // One Closed per session half, deduplicated per destination
        let mut notified: HashSet<(ChannelId, u64)> = HashSet::new();
        for half in cascade.peers {
            Self::dec_if_channel(&half.peer);
            if notified.insert((half.peer.id(), half.peer_sid)) {
                Self::notify_closed(&half, reason).await;
            }
        }
        for (_, pending) in cascade.pendings_via {
            Self::fail_pending(pending.origin, "channel closed").await;
        }
        for (local_sid, pending) in cascade.pendings_from {
            pending.next.dec_used();
            let _ = pending
                .next
                .send(Frame::closed(local_sid, reason))
                .await;
        }
    }

    fn state(&self) -> RouterState {
        let mut bonds: Vec<BondState> = {
            let guard = self.bonds.read();
            guard
                .iter()
                .map(|(name, bond)| {
                    let mut channels: Vec<ChannelState> = bond
                        .channels()
                        .map(|chan| ChannelState {
                            index: chan.index(),
                            used: chan.used(),
                            remote: chan.remote().to_string(),
                            connected_at: chan.connected_at(),
                            idle_ms: chan.idle_for().as_millis() as u64,
                        })
                        .collect();
                    channels.sort_by_key(|c| c.index);
                    BondState {
                        name: name.clone(),
                        channels,
                    }
                })
                .collect()
        };
        bonds.sort_by(|a, b| a.name.cmp(&b.name));

        let sessions = {
            let tables = self.tables.lock();
            tables
                .session_pairs()
                .into_iter()
                .map(|((from, from_sid), (to, to_sid))| SessionState {
                    from: endpoint_state(&from, from_sid),
                    to: endpoint_state(&to, to_sid),
                })
                .collect()
        };

        RouterState {
            name: self.name.clone(),
            bonds,
            sessions,
        }
    }
}

fn endpoint_state(link: &Link, sid: u64) -> EndpointState {
    EndpointState {
        kind: if link.is_channel() { "channel" } else { "raw" }.to_string(),
        id: link.id(),
        sid,
        label: link.label(),
    }
}

/// Accept-side handshake: one Login frame within the window, checked
/// against the ACL, answered with LoginBack.
async fn handle_accept(inner: Arc<RouterInner>, stream: TcpStream, peer: SocketAddr) {
    let mut framed = Framed::new(stream, FrameCodec::with_max_frame_len(inner.max_frame_len));

    let first = match timeout(inner.login_window, framed.next()).await {
        Err(_) => {
            debug!(name = %inner.name, %peer, "login window expired");
            return;
        }
        Ok(None) => return,
        Ok(Some(Err(e))) => {
            debug!(name = %inner.name, %peer, "handshake frame error: {}", e);
            return;
        }
        Ok(Some(Ok(frame))) => frame,
    };

    if first.cmd != Command::Login {
        let _ = send_login_error(&mut framed, "expected Login").await;
        return;
    }
    let request = match LoginRequest::from_payload(&first.payload) {
        Ok(request) => request,
        Err(e) => {
            let _ = send_login_error(&mut framed, &format!("error: {}", e)).await;
            return;
        }
    };
    if request.name.is_empty() || request.token.is_empty() {
        let _ = send_login_error(&mut framed, "error: name and token required").await;
        return;
    }

    let authorized = {
        let acl = inner.acl.read();
        acl.get(&request.name)
            .map(|token| token == &request.token)
            .unwrap_or(false)
    };
    if !authorized {
        warn!(name = %inner.name, peer_name = %request.name, %peer, "login rejected");
        let _ = send_login_error(&mut framed, "auth failed").await;
        return;
    }

    let reply = match LoginReply::ok(&inner.name).to_frame() {
        Ok(frame) => frame,
        Err(_) => return,
    };
    if framed.send(reply).await.is_err() {
        return;
    }

    let chan = inner.install_channel(&request.name, peer.to_string(), framed);
    info!(
        name = %inner.name,
        peer_name = %request.name,
        index = chan.index(),
        %peer,
        "peer logged in"
    );
}

async fn send_login_error(
    framed: &mut Framed<TcpStream, FrameCodec>,
    message: &str,
) -> Result<()> {
    let frame = LoginReply::err(message).to_frame()?;
    framed.send(frame).await
}

/// Channel read loop: stamp liveness, dispatch, reap on any failure.
async fn read_loop(
    inner: Arc<RouterInner>,
    chan: Arc<Channel>,
    mut frames: SplitStream<Framed<TcpStream, FrameCodec>>,
    mut closed: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            item = frames.next() => match item {
                Some(Ok(frame)) => {
                    chan.touch();
                    if let Err(e) = inner.handle_frame(&chan, frame).await {
                        warn!(name = %inner.name, peer = chan.name(), "protocol violation: {}", e);
                        break "protocol violation";
                    }
                }
                Some(Err(e)) => {
                    debug!(name = %inner.name, peer = chan.name(), "read failed: {}", e);
                    break "transport error";
                }
                None => break "connection closed",
            },
            _ = closed.changed() => break "channel closed",
        }
    };
    inner.remove_channel(&chan, reason).await;
}

/// Send heartbeats every period; reap channels silent past the timeout.
async fn heartbeat_loop(inner: Arc<RouterInner>) {
    let mut ticker = tokio::time::interval(inner.heartbeat_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let channels: Vec<Arc<Channel>> = {
            let bonds = inner.bonds.read();
            bonds
                .values()
                .flat_map(|bond| bond.channels().cloned())
                .collect()
        };
        for chan in channels {
            if chan.idle_for() > inner.heartbeat_timeout {
                warn!(
                    name = %inner.name,
                    peer = chan.name(),
                    index = chan.index(),
                    "heartbeat timeout"
                );
                inner.remove_channel(&chan, "heartbeat timeout").await;
                continue;
            }
            let _ = chan.try_send(Frame::heartbeat());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RouterConfig::new("master");
        assert_eq!(config.name, "master");
        assert!(config.acl.is_empty());
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert!(config.heartbeat_timeout.is_none());
    }

    #[tokio::test]
    async fn test_sid_alloc_monotonic() {
        let router = Router::new(RouterConfig::new("m"));
        let a = router.inner.alloc_sid();
        let b = router.inner.alloc_sid();
        let c = router.inner.alloc_sid();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_select_bond_missing() {
        let router = Router::new(RouterConfig::new("m"));
        assert!(router.select_bond("nope").is_none());
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let router = Router::new(RouterConfig::new("m"));
        router.close().await;
        router.close().await;
        assert!(matches!(
            router.dial_stream("tcp://echo").await,
            Err(BraidError::RouterClosed)
        ));
    }

    #[tokio::test]
    async fn test_local_echo_dial() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let router = Router::new(RouterConfig::new("m"));
        let mut stream = router.dial_stream("tcp://echo").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        router.close().await;
    }

    #[tokio::test]
    async fn test_dial_empty_path() {
        let router = Router::new(RouterConfig::new("m"));
        assert!(matches!(
            router.dial_stream("").await,
            Err(BraidError::EmptyPath)
        ));
    }

    #[tokio::test]
    async fn test_dial_unknown_bond() {
        let router = Router::new(RouterConfig::new("m"));
        let result = router.dial_stream("UNKNOWN->tcp://x:1").await;
        assert!(matches!(result, Err(BraidError::ChannelNotFound(name)) if name == "UNKNOWN"));
        assert!(router.state().sessions.is_empty());
    }

    #[tokio::test]
    async fn test_dial_path_ending_at_self() {
        let router = Router::new(RouterConfig::new("m"));
        assert!(matches!(
            router.dial_stream("m").await,
            Err(BraidError::DialFailed(_))
        ));
    }
}
