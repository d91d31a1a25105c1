//! Length-prefixed frame transport over any async byte stream
//!
//! Each envelope travels as one JSON-encoded data frame. A close frame ends
//! the connection in an orderly way; heartbeats are skipped.

use super::frame::{Frame, FrameType};
use super::Transport;
use crate::error::{Result, RuntimeError};
use crate::types::Envelope;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

const INITIAL_BUF_CAPACITY: usize = 8 * 1024;

/// Buffers incoming bytes and yields complete [`Frame`]s
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
        }
    }

    /// Read the next frame. Returns `None` on clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some((frame, consumed)) = Frame::decode(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some(frame));
            }

            let n = self
                .inner
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| RuntimeError::Transport(e.to_string()))?;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RuntimeError::Transport(
                    "Connection closed with incomplete frame".to_string(),
                ));
            }
        }
    }
}

/// Writes [`Frame`]s, flushing after each one
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode()?;
        self.inner
            .write_all(&encoded)
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))
    }
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// [`Transport`] carrying JSON envelopes in length-prefixed frames
pub struct FramedTransport {
    reader: Mutex<FrameReader<BoxedReader>>,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    connected: AtomicBool,
}

impl FramedTransport {
    /// Build from separate read and write halves
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Mutex::new(FrameReader::new(Box::new(reader))),
            writer: Mutex::new(FrameWriter::new(Box::new(writer))),
            connected: AtomicBool::new(true),
        }
    }

    /// Build from a bidirectional stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::new(r, w)
    }

    /// Connect to a Unix domain socket
    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| RuntimeError::Transport(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "Connected to unix socket");
        Ok(Self::from_stream(stream))
    }

    /// Send a heartbeat frame
    pub async fn heartbeat(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(RuntimeError::TransportClosed);
        }
        self.writer.lock().await.write_frame(&Frame::heartbeat()).await
    }
}

#[async_trait]
impl Transport for FramedTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_connected() {
            return Err(RuntimeError::TransportClosed);
        }
        let payload = serde_json::to_vec(&envelope)?;
        self.writer
            .lock()
            .await
            .write_frame(&Frame::data(payload))
            .await
    }

    async fn recv(&self) -> Result<Option<Envelope>> {
        let mut reader = self.reader.lock().await;
        loop {
            if !self.is_connected() {
                return Ok(None);
            }
            let Some(frame) = reader.read_frame().await? else {
                self.connected.store(false, Ordering::SeqCst);
                return Ok(None);
            };
            match frame.frame_type {
                FrameType::Data => match serde_json::from_slice::<Envelope>(&frame.payload) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(e) => {
                        tracing::warn!(error = %e, len = frame.payload.len(), "Dropping malformed envelope");
                    }
                },
                FrameType::Heartbeat => {}
                FrameType::Close => {
                    tracing::debug!("Peer sent close frame");
                    self.connected.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        // Best effort: the peer may already be gone
        let _ = writer.write_frame(&Frame::close()).await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Accepts [`FramedTransport`] connections on a Unix domain socket
#[cfg(unix)]
pub struct FramedListener {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl FramedListener {
    /// Bind to a socket path, removing a stale socket file first
    pub fn bind(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = tokio::net::UnixListener::bind(&path)
            .map_err(|e| RuntimeError::Transport(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "Listening on unix socket");
        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<FramedTransport> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        Ok(FramedTransport::from_stream(stream))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}
