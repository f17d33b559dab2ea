//! Transport abstraction for courier RPC.
//!
//! A [`Transport`] carries whole [`Frame`]s over one persistent
//! connection. The production implementation is [`FramedTransport`]:
//! 4-byte big-endian length prefix + MessagePack body over any async
//! stream. [`MockTransport`] scripts both directions for tests.

use async_trait::async_trait;
use courier_types::{CodecError, Frame, MAX_FRAME_SIZE};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::TransportError;

/// Frame-level transport over one persistent connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame; returns once it is flushed locally.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Receive the next frame, waiting until one arrives or the
    /// connection closes.
    async fn recv(&self) -> Result<Frame, TransportError>;

    /// True until the connection is closed.
    fn is_open(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Establishes transports from a URI, e.g. `tcp://broker.example.com:9911`.
///
/// Abstracted so the push client's reconnect loop can be driven by a
/// scripted dialer in tests.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the given URI and return an open transport.
    async fn dial(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Length-prefixed MessagePack framing over an async byte stream pair.
pub struct FramedTransport<R, W> {
    reader: tokio::sync::Mutex<R>,
    writer: tokio::sync::Mutex<W>,
    closed: CancellationToken,
}

impl<R, W> FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a read/write half pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }
}

impl
    FramedTransport<
        tokio::net::tcp::OwnedReadHalf,
        tokio::net::tcp::OwnedWriteHalf,
    >
{
    /// Frame a TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self::new(r, w)
    }
}

impl
    FramedTransport<
        tokio::net::unix::OwnedReadHalf,
        tokio::net::unix::OwnedWriteHalf,
    >
{
    /// Frame a Unix-domain stream.
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        let (r, w) = stream.into_split();
        Self::new(r, w)
    }
}

#[async_trait]
impl<R, W> Transport for FramedTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let bytes = frame.to_bytes()?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Codec(CodecError::FrameTooLarge {
                len: bytes.len(),
                max: MAX_FRAME_SIZE,
            }));
        }

        let mut writer = self.writer.lock().await;
        let len = (bytes.len() as u32).to_be_bytes();
        writer
            .write_all(&len)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = read_frame(&mut *reader) => result,
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        // Best effort: the peer sees EOF either way.
        let _ = writer.shutdown().await;
        Ok(())
    }
}

async fn read_frame<R>(reader: &mut R) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_read_err)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Codec(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        }));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(map_read_err)?;
    Ok(Frame::from_bytes(&buf)?)
}

fn map_read_err(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::RecvFailed(err.to_string())
    }
}

/// Production dialer: `tcp://host:port` (or a bare `host:port`).
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let addr = uri.strip_prefix("tcp://").unwrap_or(uri);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{addr}: {e}")))?;
        Ok(Arc::new(FramedTransport::from_tcp(stream)))
    }
}

/// Mock transport for testing.
///
/// Queues frames for `recv()`, captures everything sent, and supports
/// injected failures and simulated remote close. Clones share state.
#[derive(Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
    incoming_ready: Arc<tokio::sync::Notify>,
    sent_ready: Arc<tokio::sync::Notify>,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct MockInner {
    sent: Vec<Frame>,
    taken: usize,
    incoming: VecDeque<Frame>,
    fail_next_send: Option<String>,
}

impl MockTransport {
    /// Create an open mock transport.
    pub fn new() -> Self {
        let t = Self::default();
        t.open.store(true, Ordering::SeqCst);
        t
    }

    /// Queue a frame to be returned by a later `recv()`.
    pub fn push_incoming(&self, frame: Frame) {
        self.inner.lock().unwrap().incoming.push_back(frame);
        self.incoming_ready.notify_one();
    }

    /// All frames sent so far.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Wait for the next not-yet-observed sent frame.
    pub async fn next_sent(&self) -> Frame {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.taken < inner.sent.len() {
                    let frame = inner.sent[inner.taken].clone();
                    inner.taken += 1;
                    return frame;
                }
            }
            self.sent_ready.notified().await;
        }
    }

    /// Cause the next `send()` to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_send = Some(error.to_string());
    }

    /// Simulate the remote side dropping the connection: pending and
    /// future `recv()` calls return `Closed`.
    pub fn close_remote(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.incoming_ready.notify_waiters();
        self.incoming_ready.notify_one();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            incoming_ready: Arc::clone(&self.incoming_ready),
            sent_ready: Arc::clone(&self.sent_ready),
            open: Arc::clone(&self.open),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }
        inner.sent.push(frame);
        drop(inner);
        self.sent_ready.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.incoming.pop_front() {
                    return Ok(frame);
                }
            }
            if !self.open.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.incoming_ready.notified().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.incoming_ready.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn notify_frame(method: &str) -> Frame {
        Frame::Notify {
            method: method.into(),
            arg: vec![],
        }
    }

    fn call_frame(seq: u64, method: &str) -> Frame {
        Frame::Call {
            seq,
            method: method.into(),
            arg: vec![1, 2, 3],
            tags: BTreeMap::new(),
        }
    }

    // ===========================================
    // FramedTransport
    // ===========================================

    fn framed_pair() -> (
        FramedTransport<
            tokio::io::ReadHalf<tokio::io::DuplexStream>,
            tokio::io::WriteHalf<tokio::io::DuplexStream>,
        >,
        FramedTransport<
            tokio::io::ReadHalf<tokio::io::DuplexStream>,
            tokio::io::WriteHalf<tokio::io::DuplexStream>,
        >,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (FramedTransport::new(ar, aw), FramedTransport::new(br, bw))
    }

    #[tokio::test]
    async fn framed_roundtrip() {
        let (left, right) = framed_pair();
        left.send(call_frame(1, "ctl.ping")).await.unwrap();
        let got = right.recv().await.unwrap();
        assert_eq!(got, call_frame(1, "ctl.ping"));
    }

    #[tokio::test]
    async fn framed_preserves_frame_order() {
        let (left, right) = framed_pair();
        for i in 0..5 {
            left.send(call_frame(i, "ctl.ping")).await.unwrap();
        }
        for i in 0..5 {
            match right.recv().await.unwrap() {
                Frame::Call { seq, .. } => assert_eq!(seq, i),
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn framed_recv_after_close_errors() {
        let (left, right) = framed_pair();
        left.close().await.unwrap();
        assert!(matches!(right.recv().await, Err(TransportError::Closed)));
        assert!(matches!(left.recv().await, Err(TransportError::Closed)));
        assert!(!left.is_open());
    }

    #[tokio::test]
    async fn framed_rejects_oversized_length_prefix() {
        let (a, b) = tokio::io::duplex(1024);
        let (br, bw) = tokio::io::split(b);
        let right = FramedTransport::new(br, bw);

        // Hand-write a length prefix far above the limit.
        let (_ar, mut aw) = tokio::io::split(a);
        let len = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        aw.write_all(&len).await.unwrap();

        match right.recv().await {
            Err(TransportError::Codec(CodecError::FrameTooLarge { len, .. })) => {
                assert_eq!(len, MAX_FRAME_SIZE + 1);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn framed_close_is_idempotent() {
        let (left, _right) = framed_pair();
        left.close().await.unwrap();
        left.close().await.unwrap();
    }

    // ===========================================
    // MockTransport
    // ===========================================

    #[tokio::test]
    async fn mock_queues_and_receives() {
        let t = MockTransport::new();
        t.push_incoming(notify_frame("a"));
        t.push_incoming(notify_frame("b"));
        assert_eq!(t.recv().await.unwrap(), notify_frame("a"));
        assert_eq!(t.recv().await.unwrap(), notify_frame("b"));
    }

    #[tokio::test]
    async fn mock_recv_blocks_until_push() {
        let t = MockTransport::new();
        let t2 = t.clone();
        let handle = tokio::spawn(async move { t2.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.push_incoming(notify_frame("late"));
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got, notify_frame("late"));
    }

    #[tokio::test]
    async fn mock_close_remote_unblocks_recv() {
        let t = MockTransport::new();
        let t2 = t.clone();
        let handle = tokio::spawn(async move { t2.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        t.close_remote();
        assert!(matches!(
            handle.await.unwrap(),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn mock_captures_sent_frames() {
        let t = MockTransport::new();
        t.send(notify_frame("x")).await.unwrap();
        t.send(notify_frame("y")).await.unwrap();
        assert_eq!(t.sent_frames().len(), 2);
        assert_eq!(t.next_sent().await, notify_frame("x"));
        assert_eq!(t.next_sent().await, notify_frame("y"));
    }

    #[tokio::test]
    async fn mock_forced_send_failure_is_one_shot() {
        let t = MockTransport::new();
        t.fail_next_send("buffer full");
        assert!(matches!(
            t.send(notify_frame("x")).await,
            Err(TransportError::SendFailed(_))
        ));
        t.send(notify_frame("x")).await.unwrap();
    }

    #[tokio::test]
    async fn mock_send_after_close_errors() {
        let t = MockTransport::new();
        t.close().await.unwrap();
        assert!(matches!(
            t.send(notify_frame("x")).await,
            Err(TransportError::Closed)
        ));
    }
}
