//! Virtual streams multiplexed over a tunnel
//!
//! A [`VirtualStream`] is a cheap, clonable handle. Every clone refers to the
//! same buffer and state, so one task can read while another writes.
//!
//! Reads drain an unbounded FIFO filled by the tunnel as DATA frames arrive.
//! Writes turn into one DATA message each and are handed to the stream's
//! [`StreamSink`] without waiting for the network.

use bytes::{Bytes, BytesMut};
use gank_proto::{Frame, StreamId};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Where a stream sends its outbound frames
pub trait StreamSink: Send + Sync {
    /// Queue a frame for the peer. Returns `false` once the tunnel is gone.
    fn send(&self, frame: Frame) -> bool;

    /// Drop the stream from the tunnel's table after a local close
    fn release(&self, id: StreamId);
}

/// Why a stream closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close from either side
    Finished,
    /// Aborted from either side
    Reset(String),
    /// The control connection went away
    TunnelClosed,
}

#[derive(Default)]
struct ReadState {
    buffer: BytesMut,
    waker: Option<Waker>,
    closed: Option<CloseReason>,
}

struct Shared {
    id: StreamId,
    sink: Arc<dyn StreamSink>,
    ready: AtomicBool,
    read: Mutex<ReadState>,
    closed: CancellationToken,
}

/// Duplex byte channel carried by a tunnel
#[derive(Clone)]
pub struct VirtualStream {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("id", &self.shared.id)
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl VirtualStream {
    pub fn new(id: StreamId, sink: Arc<dyn StreamSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                sink,
                ready: AtomicBool::new(false),
                read: Mutex::new(ReadState::default()),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Why the stream closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.read.lock().ok().and_then(|s| s.closed.clone())
    }

    /// Resolves once the stream is closed, whichever side closed it
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Append bytes received from the peer. Ignored after close.
    pub fn produce(&self, data: Bytes) -> bool {
        let Ok(mut state) = self.shared.read.lock() else {
            return false;
        };
        if state.closed.is_some() {
            return false;
        }
        state.buffer.extend_from_slice(&data);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    /// Send `data` to the peer as one message
    ///
    /// The peer receives the bytes in one piece, which keeps records intact
    /// for datagram framing.
    pub fn send(&self, data: Bytes) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        if !self.is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream not established",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        if !self.shared.sink.send(Frame::StreamData {
            id: self.shared.id,
            data,
        }) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed"));
        }
        Ok(())
    }

    /// Close the stream and tell the peer with STREAM_FIN
    pub fn close(&self) {
        if self.finish(CloseReason::Finished) {
            trace!("Stream {} closed locally", self.shared.id);
            self.shared.sink.send(Frame::StreamFin { id: self.shared.id });
            self.shared.sink.release(self.shared.id);
        }
    }

    /// Abort the stream and tell the peer with STREAM_RST
    pub fn reset(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.finish(CloseReason::Reset(reason.clone())) {
            trace!("Stream {} reset locally: {}", self.shared.id, reason);
            self.shared.sink.send(Frame::StreamReset {
                id: self.shared.id,
                reason,
            });
            self.shared.sink.release(self.shared.id);
        }
    }

    pub(crate) fn mark_ready(&self) {
        self.shared.ready.store(true, Ordering::Release);
    }

    /// Close without notifying the peer, for closes the peer started
    pub(crate) fn terminate(&self, reason: CloseReason) {
        if self.finish(reason) {
            trace!("Stream {} terminated", self.shared.id);
        }
    }

    /// Record the close. Returns `true` for the first close only.
    fn finish(&self, reason: CloseReason) -> bool {
        let waker = {
            let Ok(mut state) = self.shared.read.lock() else {
                return false;
            };
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.shared.closed.cancel();
        true
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self
            .shared
            .read
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stream state poisoned"))?;

        if !state.buffer.is_empty() {
            let n = state.buffer.len().min(buf.remaining());
            let chunk = state.buffer.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        let Some(reason) = state.closed.clone() else {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        };

        match reason {
            CloseReason::Finished => Poll::Ready(Ok(())),
            CloseReason::Reset(reason) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                reason,
            ))),
            CloseReason::TunnelClosed => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "tunnel closed",
            ))),
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.send(Bytes::copy_from_slice(buf)).map(|_| buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
        released: Mutex<Vec<StreamId>>,
    }

    impl StreamSink for RecordingSink {
        fn send(&self, frame: Frame) -> bool {
            self.frames.lock().unwrap().push(frame);
            true
        }

        fn release(&self, id: StreamId) {
            self.released.lock().unwrap().push(id);
        }
    }

    fn stream() -> (VirtualStream, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (VirtualStream::new(StreamId::new(), sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_reads_in_order_bounded_by_buffer() {
        let (mut s, _) = stream();
        s.produce(Bytes::from_static(b"hello "));
        s.produce(Bytes::from_static(b"world"));

        let mut small = [0u8; 4];
        let n = s.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"hell");

        let mut rest = vec![0u8; 64];
        let n = s.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"o world");
    }

    #[tokio::test]
    async fn test_write_before_ready_fails() {
        let (mut s, sink) = stream();
        let err = s.write_all(b"early").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_forwards_data_frame() {
        let (mut s, sink) = stream();
        s.mark_ready();
        s.write_all(b"payload").await.unwrap();

        let frames = sink.frames.lock().unwrap();
        assert_eq!(
            frames[0],
            Frame::StreamData {
                id: s.id(),
                data: Bytes::from_static(b"payload")
            }
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (s, sink) = stream();
        s.close();
        s.close();
        s.reset("late");

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::StreamFin { .. }));
        assert_eq!(sink.released.lock().unwrap().len(), 1);
        assert_eq!(s.close_reason(), Some(CloseReason::Finished));
    }

    #[tokio::test]
    async fn test_remote_fin_drains_then_eof() {
        let (mut s, sink) = stream();
        s.produce(Bytes::from_static(b"last words"));
        s.terminate(CloseReason::Finished);
        assert!(!s.produce(Bytes::from_static(b"ignored")));

        let mut out = Vec::new();
        s.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last words");
        // A remote close sends nothing back
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_surfaces_reason() {
        let (mut s, _) = stream();
        s.terminate(CloseReason::Reset("connection refused".into()));
        let err = s.read(&mut [0u8; 8]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_pending_read_wakes_on_produce() {
        let (s, _) = stream();
        let mut reader = s.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = reader.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });
        tokio::task::yield_now().await;
        s.produce(Bytes::from_static(b"wake"));
        assert_eq!(task.await.unwrap(), b"wake");
    }

    #[tokio::test]
    async fn test_closed_notifies_once() {
        let (s, _) = stream();
        let watcher = s.clone();
        let task = tokio::spawn(async move { watcher.closed().await });
        s.reset("bye");
        task.await.unwrap();
        assert!(s.is_closed());
    }
}
