//! Tunnel session engine
//!
//! A [`Tunnel`] owns one control connection. A reader task decodes frames
//! and dispatches them one at a time; a writer task drains an unbounded
//! queue of outbound frames, so sending never blocks the caller.
//!
//! Per-stream state machine:
//!
//! ```text
//! INIT_SENT ----EST----> READY ----FIN/RST/close----> (removed)
//! INIT_RECEIVED --set_ready--> READY
//! ```
//!
//! Frames for ids that are not in the table are answered with STREAM_RST,
//! except STREAM_RST itself.

use crate::deferred::Deferred;
use crate::stream::{CloseReason, StreamSink, VirtualStream};
use crate::TunnelError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use gank_proto::{now_millis, Frame, FrameCodec, ProtoError, Status, StreamId, TunnelRequest};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Tunnel timing configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Time allowed for AUTH_RES and TUNNEL_RES
    pub handshake_timeout: Duration,
    /// Time allowed between STREAM_INIT and STREAM_EST
    pub stream_open_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            stream_open_timeout: Duration::from_secs(20),
        }
    }
}

impl TunnelConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_stream_open_timeout(mut self, timeout: Duration) -> Self {
        self.stream_open_timeout = timeout;
        self
    }
}

/// Answers AUTH_REQ frames. `Err` carries the failure message for the peer.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    async fn authenticate(&self, tunnel: &Tunnel, token: &str) -> Result<String, String>;
}

/// Answers TUNNEL_REQ frames. `Ok` carries the public URL.
#[async_trait]
pub trait TunnelRequestHandler: Send + Sync {
    async fn handle_tunnel_request(
        &self,
        tunnel: &Tunnel,
        request: TunnelRequest,
    ) -> Result<String, String>;
}

/// Handler registration
#[derive(Clone)]
pub enum Handler {
    Auth(Arc<dyn AuthHandler>),
    TunnelRequest(Arc<dyn TunnelRequestHandler>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    InitSent,
    InitReceived,
    Ready,
}

struct StreamSlot {
    stream: VirtualStream,
    state: StreamState,
    pending: Option<Arc<Deferred<()>>>,
}

#[derive(Default)]
struct Handlers {
    auth: Option<Arc<dyn AuthHandler>>,
    tunnel_request: Option<Arc<dyn TunnelRequestHandler>>,
}

struct Inner {
    id: String,
    config: TunnelConfig,
    outbound: mpsc::UnboundedSender<Frame>,
    incoming: mpsc::UnboundedSender<VirtualStream>,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
    auth: Mutex<Option<Arc<Deferred<String>>>>,
    prepare: Mutex<Option<Arc<Deferred<String>>>>,
    handlers: Mutex<Handlers>,
    authenticated: AtomicBool,
    closing: AtomicBool,
    rtt: watch::Sender<Option<Duration>>,
    last_seen: Mutex<Instant>,
    shutdown: CancellationToken,
}

impl Inner {
    fn send(&self, frame: Frame) -> bool {
        if self.closing.load(Ordering::Acquire) {
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    fn send_reset(&self, id: StreamId, reason: &str) {
        self.send(Frame::StreamReset {
            id,
            reason: reason.to_string(),
        });
    }

    fn remove_slot(&self, id: StreamId) -> Option<StreamSlot> {
        self.streams.lock().ok()?.remove(&id)
    }

    fn take_handshake(slot: &Mutex<Option<Arc<Deferred<String>>>>) -> Option<Arc<Deferred<String>>> {
        slot.lock().ok()?.take()
    }
}

/// Sink handed to every stream of a tunnel
struct SessionSink(Weak<Inner>);

impl StreamSink for SessionSink {
    fn send(&self, frame: Frame) -> bool {
        self.0.upgrade().map(|inner| inner.send(frame)).unwrap_or(false)
    }

    fn release(&self, id: StreamId) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if let Some(pending) = inner.remove_slot(id).and_then(|slot| slot.pending) {
            pending.reject(TunnelError::StreamClosed);
        }
    }
}

/// Peer-initiated streams of a tunnel
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<VirtualStream>,
    shutdown: CancellationToken,
}

impl Incoming {
    /// Next stream opened by the peer, or `None` once the tunnel is closed.
    ///
    /// Streams are delivered unconfirmed: answer with [`Tunnel::set_ready`]
    /// or reset them.
    pub async fn next_stream(&mut self) -> Option<VirtualStream> {
        tokio::select! {
            biased;
            stream = self.rx.recv() => stream,
            _ = self.shutdown.cancelled() => None,
        }
    }
}

/// A session built by [`Tunnel::build`] whose tasks are not running yet
pub struct Unstarted<T> {
    tunnel: Tunnel,
    read_half: ReadHalf<T>,
    write_half: WriteHalf<T>,
    outbound_rx: mpsc::UnboundedReceiver<Frame>,
}

impl<T> Unstarted<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Spawn the reader and writer tasks
    pub fn start(self) -> Tunnel {
        let Unstarted {
            tunnel,
            read_half,
            write_half,
            outbound_rx,
        } = self;
        debug!("Tunnel {} started", tunnel.id());

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, FrameCodec::new()),
            outbound_rx,
            Arc::downgrade(&tunnel.inner),
            tunnel.inner.shutdown.clone(),
        ));
        tokio::spawn(read_loop(
            tunnel.clone(),
            FramedRead::new(read_half, FrameCodec::new()),
        ));
        tunnel
    }
}

/// Handle to a tunnel session. Clones share the session.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Tunnel {
    /// Start a session over `io`
    pub fn spawn<T>(io: T, config: TunnelConfig) -> (Tunnel, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with(io, config, [])
    }

    /// Start a session with handlers installed before the first frame is read
    pub fn spawn_with<T, H>(io: T, config: TunnelConfig, handlers: H) -> (Tunnel, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        H: IntoIterator<Item = Handler>,
    {
        let (unstarted, incoming) = Self::build(io, config);
        for handler in handlers {
            unstarted.tunnel().register_handler(handler);
        }
        (unstarted.start(), incoming)
    }

    /// Set up a session without reading or writing yet.
    ///
    /// Nothing is read from `io` until [`Unstarted::start`], so callers can
    /// record the tunnel elsewhere first. Frames sent before that are queued.
    pub fn build<T>(io: T, config: TunnelConfig) -> (Unstarted<T>, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (rtt_tx, _) = watch::channel(None);
        let shutdown = CancellationToken::new();

        let tunnel = Tunnel {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().to_string(),
                config,
                outbound: outbound_tx,
                incoming: incoming_tx,
                streams: Mutex::new(HashMap::new()),
                auth: Mutex::new(None),
                prepare: Mutex::new(None),
                handlers: Mutex::new(Handlers::default()),
                authenticated: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                rtt: rtt_tx,
                last_seen: Mutex::new(Instant::now()),
                shutdown: shutdown.clone(),
            }),
        };

        let unstarted = Unstarted {
            tunnel,
            read_half,
            write_half,
            outbound_rx,
        };
        let incoming = Incoming {
            rx: incoming_rx,
            shutdown,
        };
        (unstarted, incoming)
    }

    /// Session identifier, unique per control connection
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::Acquire)
    }

    /// Resolves once the session has shut down
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// When the last frame arrived from the peer
    pub fn last_seen(&self) -> Instant {
        self.inner
            .last_seen
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Instant::now())
    }

    /// Most recent round-trip time measured by PING/PONG
    pub fn rtt(&self) -> Option<Duration> {
        *self.inner.rtt.borrow()
    }

    /// Observe round-trip time updates, one per PONG
    pub fn subscribe_rtt(&self) -> watch::Receiver<Option<Duration>> {
        self.inner.rtt.subscribe()
    }

    /// Number of live streams
    pub fn stream_count(&self) -> usize {
        self.inner.streams.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn register_handler(&self, handler: Handler) {
        if let Ok(mut handlers) = self.inner.handlers.lock() {
            match handler {
                Handler::Auth(h) => handlers.auth = Some(h),
                Handler::TunnelRequest(h) => handlers.tunnel_request = Some(h),
            }
        }
    }

    /// Send AUTH_REQ and wait for the verdict
    pub async fn start_auth(&self, token: &str) -> Result<String, TunnelError> {
        let frame = Frame::AuthRequest {
            token: token.to_string(),
        };
        frame.check()?;
        let pending = self.begin_handshake(&self.inner.auth, "auth")?;
        self.inner.send(frame);
        pending.await
    }

    /// Send TUNNEL_REQ and wait for the public URL
    pub async fn prepare_tunnel(&self, request: TunnelRequest) -> Result<String, TunnelError> {
        let frame = Frame::TunnelRequest(request);
        frame.check()?;
        let pending = self.begin_handshake(&self.inner.prepare, "tunnel response")?;
        self.inner.send(frame);
        pending.await
    }

    fn begin_handshake(
        &self,
        slot: &Mutex<Option<Arc<Deferred<String>>>>,
        what: &'static str,
    ) -> Result<crate::deferred::Pending<String>, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        let (deferred, pending) = Deferred::new();
        deferred.arm_timeout(
            self.inner.config.handshake_timeout,
            TunnelError::HandshakeTimeout(what),
            || {},
        );
        let previous = slot
            .lock()
            .map_err(|_| TunnelError::Closed)?
            .replace(deferred);
        if let Some(previous) = previous {
            previous.reject(TunnelError::Closed);
        }
        Ok(pending)
    }

    /// Open a stream towards the peer and wait for STREAM_EST
    pub async fn create_stream(&self) -> Result<VirtualStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let id = StreamId::new();
        let stream = VirtualStream::new(id, self.sink());
        let (deferred, pending) = Deferred::new();

        self.inner
            .streams
            .lock()
            .map_err(|_| TunnelError::Closed)?
            .insert(
                id,
                StreamSlot {
                    stream: stream.clone(),
                    state: StreamState::InitSent,
                    pending: Some(deferred.clone()),
                },
            );

        // close() may have drained the table before the insert
        if self.is_closed() {
            self.inner.remove_slot(id);
            return Err(TunnelError::Closed);
        }

        let weak = Arc::downgrade(&self.inner);
        deferred.arm_timeout(
            self.inner.config.stream_open_timeout,
            TunnelError::HandshakeTimeout("stream open"),
            move || {
                if let Some(inner) = weak.upgrade() {
                    Tunnel { inner }.abort_stream(id, "stream open timeout");
                }
            },
        );

        trace!("Tunnel {} opening stream {}", self.id(), id);
        self.inner.send(Frame::StreamInit { id });
        pending.await?;
        Ok(stream)
    }

    /// Confirm a peer-initiated stream with STREAM_EST
    pub fn set_ready(&self, stream: &VirtualStream) -> Result<(), TunnelError> {
        let id = stream.id();
        {
            let mut streams = self.inner.streams.lock().map_err(|_| TunnelError::Closed)?;
            let slot = streams.get_mut(&id).ok_or(TunnelError::StreamClosed)?;
            match slot.state {
                StreamState::Ready => return Ok(()),
                StreamState::InitSent => return Err(TunnelError::StreamNotReady),
                StreamState::InitReceived => slot.state = StreamState::Ready,
            }
        }
        stream.mark_ready();
        self.inner.send(Frame::StreamEstablished { id });
        Ok(())
    }

    /// Abort a stream with STREAM_RST
    pub fn reset_stream(&self, stream: &VirtualStream, reason: &str) {
        stream.reset(reason);
    }

    /// Send a PING carrying the current time
    pub fn ping(&self) -> bool {
        self.inner.send(Frame::Ping {
            sent_at: now_millis(),
        })
    }

    /// Shut the session down
    ///
    /// Every stream is force-closed and every pending handshake fails with
    /// [`TunnelError::Closed`]. Later calls do nothing.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing tunnel {}", self.id());

        let slots: Vec<StreamSlot> = match self.inner.streams.lock() {
            Ok(mut streams) => streams.drain().map(|(_, slot)| slot).collect(),
            Err(_) => Vec::new(),
        };
        for slot in slots {
            slot.stream.terminate(CloseReason::TunnelClosed);
            if let Some(pending) = slot.pending {
                pending.reject(TunnelError::Closed);
            }
        }

        for handshake in [
            Inner::take_handshake(&self.inner.auth),
            Inner::take_handshake(&self.inner.prepare),
        ]
        .into_iter()
        .flatten()
        {
            handshake.reject(TunnelError::Closed);
        }

        self.inner.shutdown.cancel();
    }

    /// Route one inbound frame
    pub fn dispatch_frame(&self, frame: Frame) {
        if let Ok(mut last_seen) = self.inner.last_seen.lock() {
            *last_seen = Instant::now();
        }
        trace!("Tunnel {} <- {}", self.id(), frame.frame_type());

        match frame {
            Frame::AuthRequest { token } => self.on_auth_request(token),
            Frame::AuthResponse { status, message } => self.on_auth_response(status, message),
            Frame::Ping { sent_at } => {
                self.inner.send(Frame::Pong {
                    sent_at,
                    answered_at: now_millis(),
                });
            }
            Frame::Pong { sent_at, .. } => {
                let rtt = Duration::from_millis(now_millis().saturating_sub(sent_at));
                self.inner.rtt.send_replace(Some(rtt));
            }
            Frame::TunnelRequest(request) => self.on_tunnel_request(request),
            Frame::TunnelResponse { status, message } => {
                self.on_tunnel_response(status, message)
            }
            Frame::StreamInit { id } => self.on_stream_init(id),
            Frame::StreamEstablished { id } => self.on_stream_established(id),
            Frame::StreamData { id, data } => self.on_stream_data(id, data),
            Frame::StreamFin { id } => self.on_stream_fin(id),
            Frame::StreamReset { id, reason } => self.on_stream_reset(id, reason),
        }
    }

    fn sink(&self) -> Arc<dyn StreamSink> {
        Arc::new(SessionSink(Arc::downgrade(&self.inner)))
    }

    fn abort_stream(&self, id: StreamId, reason: &str) {
        if let Some(slot) = self.inner.remove_slot(id) {
            debug!("Tunnel {} aborting stream {}: {}", self.id(), id, reason);
            slot.stream.terminate(CloseReason::Reset(reason.to_string()));
            self.inner.send_reset(id, reason);
        }
    }

    fn on_auth_request(&self, token: String) {
        let handler = self
            .inner
            .handlers
            .lock()
            .ok()
            .and_then(|h| h.auth.clone());

        let Some(handler) = handler else {
            self.inner.authenticated.store(true, Ordering::Release);
            self.inner.send(Frame::AuthResponse {
                status: Status::Ok,
                message: "ok".to_string(),
            });
            return;
        };

        let tunnel = self.clone();
        tokio::spawn(async move {
            let response = match handler.authenticate(&tunnel, &token).await {
                Ok(message) => {
                    tunnel.inner.authenticated.store(true, Ordering::Release);
                    Frame::AuthResponse {
                        status: Status::Ok,
                        message,
                    }
                }
                Err(message) => {
                    debug!("Tunnel {} failed authentication: {}", tunnel.id(), message);
                    Frame::AuthResponse {
                        status: Status::Fail,
                        message,
                    }
                }
            };
            tunnel.inner.send(response);
        });
    }

    fn on_auth_response(&self, status: Status, message: String) {
        let Some(pending) = Inner::take_handshake(&self.inner.auth) else {
            debug!("Tunnel {} ignoring unsolicited AUTH_RES", self.id());
            return;
        };
        if status == Status::Ok {
            self.inner.authenticated.store(true, Ordering::Release);
            pending.resolve(message);
        } else {
            pending.reject(TunnelError::Auth(message));
        }
    }

    fn on_tunnel_request(&self, request: TunnelRequest) {
        if !self.is_authenticated() {
            self.inner.send(Frame::TunnelResponse {
                status: Status::Fail,
                message: "not authenticated".to_string(),
            });
            return;
        }

        let handler = self
            .inner
            .handlers
            .lock()
            .ok()
            .and_then(|h| h.tunnel_request.clone());
        let Some(handler) = handler else {
            self.inner.send(Frame::TunnelResponse {
                status: Status::Fail,
                message: "tunnel requests are not accepted".to_string(),
            });
            return;
        };

        let tunnel = self.clone();
        tokio::spawn(async move {
            let response = match handler.handle_tunnel_request(&tunnel, request).await {
                Ok(url) => Frame::TunnelResponse {
                    status: Status::Ok,
                    message: url,
                },
                Err(message) => Frame::TunnelResponse {
                    status: Status::Fail,
                    message,
                },
            };
            tunnel.inner.send(response);
        });
    }

    fn on_tunnel_response(&self, status: Status, message: String) {
        let Some(pending) = Inner::take_handshake(&self.inner.prepare) else {
            debug!("Tunnel {} ignoring unsolicited TUNNEL_RES", self.id());
            return;
        };
        if status == Status::Ok {
            pending.resolve(message);
        } else {
            pending.reject(TunnelError::Negotiation(message));
        }
    }

    fn on_stream_init(&self, id: StreamId) {
        let stream = {
            let Ok(mut streams) = self.inner.streams.lock() else {
                return;
            };
            if streams.contains_key(&id) {
                None
            } else {
                let stream = VirtualStream::new(id, self.sink());
                streams.insert(
                    id,
                    StreamSlot {
                        stream: stream.clone(),
                        state: StreamState::InitReceived,
                        pending: None,
                    },
                );
                Some(stream)
            }
        };

        match stream {
            Some(stream) => {
                if let Err(rejected) = self.inner.incoming.send(stream) {
                    rejected.0.reset("no stream handler");
                }
            }
            None => {
                warn!("Tunnel {} got duplicate STREAM_INIT for {}", self.id(), id);
                self.inner.send_reset(id, "duplicate stream id");
            }
        }
    }

    fn on_stream_established(&self, id: StreamId) {
        enum Outcome {
            Resolve(VirtualStream, Option<Arc<Deferred<()>>>),
            Ignore,
            Violation(Option<VirtualStream>),
        }

        let outcome = {
            let Ok(mut streams) = self.inner.streams.lock() else {
                return;
            };
            let state = streams.get(&id).map(|slot| slot.state);
            match state {
                Some(StreamState::InitSent) => match streams.get_mut(&id) {
                    Some(slot) => {
                        slot.state = StreamState::Ready;
                        Outcome::Resolve(slot.stream.clone(), slot.pending.take())
                    }
                    None => Outcome::Ignore,
                },
                Some(StreamState::Ready) => Outcome::Ignore,
                Some(StreamState::InitReceived) => {
                    Outcome::Violation(streams.remove(&id).map(|slot| slot.stream))
                }
                None => Outcome::Violation(None),
            }
        };

        match outcome {
            Outcome::Resolve(stream, pending) => {
                stream.mark_ready();
                if let Some(pending) = pending {
                    pending.resolve(());
                }
            }
            Outcome::Ignore => {}
            Outcome::Violation(stream) => {
                let reason = "unexpected STREAM_EST";
                if let Some(stream) = stream {
                    stream.terminate(CloseReason::Reset(reason.to_string()));
                }
                self.inner.send_reset(id, reason);
            }
        }
    }

    fn on_stream_data(&self, id: StreamId, data: Bytes) {
        let stream = self
            .inner
            .streams
            .lock()
            .ok()
            .and_then(|streams| streams.get(&id).map(|slot| slot.stream.clone()));

        match stream {
            Some(stream) => {
                stream.produce(data);
            }
            None => {
                trace!("Tunnel {} got data for unknown stream {}", self.id(), id);
                self.inner.send_reset(id, "unknown stream");
            }
        }
    }

    fn on_stream_fin(&self, id: StreamId) {
        match self.inner.remove_slot(id) {
            Some(slot) => {
                slot.stream.terminate(CloseReason::Finished);
                if let Some(pending) = slot.pending {
                    pending.reject(TunnelError::StreamClosed);
                }
            }
            None => self.inner.send_reset(id, "unknown stream"),
        }
    }

    fn on_stream_reset(&self, id: StreamId, reason: String) {
        match self.inner.remove_slot(id) {
            Some(slot) => {
                debug!("Tunnel {} stream {} reset by peer: {}", self.id(), id, reason);
                slot.stream.terminate(CloseReason::Reset(reason.clone()));
                if let Some(pending) = slot.pending {
                    pending.reject(TunnelError::StreamReset(reason));
                }
            }
            // Never answer a reset with a reset
            None => trace!("Tunnel {} ignoring reset for unknown stream {}", self.id(), id),
        }
    }
}

async fn read_loop<R>(tunnel: Tunnel, mut frames: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Unpin,
{
    let shutdown = tunnel.inner.shutdown.clone();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => tunnel.dispatch_frame(frame),
            Some(Err(ProtoError::Io(e))) => {
                debug!("Tunnel {} transport error: {}", tunnel.id(), e);
                break;
            }
            Some(Err(e)) => {
                warn!("Tunnel {} protocol error: {}", tunnel.id(), e);
                break;
            }
            None => {
                debug!("Tunnel {} control connection closed by peer", tunnel.id());
                break;
            }
        }
    }
    tunnel.close();
}

async fn write_loop<W>(
    mut frames: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    inner: Weak<Inner>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        // Queued frames go out before shutdown is honoured
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };

        if let Err(e) = write_batch(&mut frames, &mut rx, frame).await {
            debug!("Tunnel write failed: {}", e);
            if let Some(inner) = inner.upgrade() {
                Tunnel { inner }.close();
            }
            return;
        }
    }

    let _ = frames.close().await;
}

/// Write everything queued, then flush once.
///
/// Frames that cannot be encoded are dropped without holding back the rest of
/// the batch; only transport errors are returned.
async fn write_batch<W>(
    frames: &mut FramedWrite<W, FrameCodec>,
    rx: &mut mpsc::UnboundedReceiver<Frame>,
    first: Frame,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    feed_frame(frames, first).await?;
    while let Ok(frame) = rx.try_recv() {
        feed_frame(frames, frame).await?;
    }
    frames.flush().await.map_err(into_io)
}

async fn feed_frame<W>(frames: &mut FramedWrite<W, FrameCodec>, frame: Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match frames.feed(frame).await {
        Ok(()) => Ok(()),
        Err(ProtoError::Io(e)) => Err(e),
        Err(e) => {
            warn!("Dropping unencodable frame: {}", e);
            Ok(())
        }
    }
}

fn into_io(e: ProtoError) -> io::Error {
    match e {
        ProtoError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.stream_open_timeout, Duration::from_secs(20));

        let config = config.with_stream_open_timeout(Duration::from_millis(50));
        assert_eq!(config.stream_open_timeout, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = tokio::io::duplex(1024);
        let (tunnel, mut incoming) = Tunnel::spawn(a, TunnelConfig::default());
        tunnel.close();
        tunnel.close();
        tunnel.closed().await;
        assert!(tunnel.is_closed());
        assert!(incoming.next_stream().await.is_none());
        assert!(matches!(
            tunnel.create_stream().await,
            Err(TunnelError::Closed)
        ));
    }
}
