//! Frame transport: handshake and length-prefixed framing over one HDC socket.
//!
//! [`HdcConnection`] owns a single stream to the HDC daemon. It performs the
//! banner exchange (see [`crate::protocol`]), then sends commands and raw data
//! chunks and reads back chunked responses.
//!
//! A connection never reconnects on its own. Any read or write error drops the
//! underlying stream; later calls return [`TransportError::Closed`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use hdckit_core::transport::{Endpoint, HdcConnection};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint = Endpoint::new("127.0.0.1", 8710);
//! let mut conn = HdcConnection::open(&endpoint, false, "", Duration::from_secs(5)).await?;
//! conn.send_command("list targets -v").await?;
//! let reply = conn.read_all().await?;
//! println!("{}", String::from_utf8_lossy(&reply));
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use tracing::{debug, trace};

use crate::protocol::{
    self, ProtocolError, ALIVE_COMMAND, DAEMON_GREETING_SIZE, MAX_CHUNK_SIZE,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default timeout for reading one chunk from the daemon.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// HdcStream trait
// ---------------------------------------------------------------------------

/// A bidirectional async stream that can carry HDC frames.
///
/// [`TcpStream`] is the production transport; tests use in-memory duplex
/// pipes.
pub trait HdcStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> HdcStream for T {}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the frame transport and the connection pool.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Dialing the daemon failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The daemon greeting was malformed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] ProtocolError),

    /// The peer closed the stream in the middle of a chunk.
    #[error("truncated chunk: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    /// A chunk header announced an impossible length.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An I/O error occurred on the stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A connect or read exceeded its timeout.
    #[error("operation timed out")]
    Timeout,

    /// The connection was already closed or invalidated by an earlier error.
    #[error("connection closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Host and port of an HDC daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve the endpoint to a socket address.
    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let host_port = self.to_string();
        let addr = tokio::net::lookup_host(&host_port)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("could not resolve {host_port}")));
        addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Dial a raw TCP connection to the endpoint, without handshaking.
pub async fn dial(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let addr = endpoint.resolve().await?;
    debug!(%addr, "dialing hdc daemon");
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// HdcConnection
// ---------------------------------------------------------------------------

/// One framed connection to the HDC daemon.
pub struct HdcConnection {
    stream: Option<Box<dyn HdcStream>>,
    read_timeout: Duration,
}

impl HdcConnection {
    /// Dial the endpoint and complete the handshake.
    pub async fn open(
        endpoint: &Endpoint,
        keep_alive: bool,
        identity: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = dial(endpoint, connect_timeout).await?;
        Self::handshake(stream, identity, keep_alive).await
    }

    /// Complete the handshake on an already-dialed stream.
    ///
    /// Reads and verifies the daemon greeting, answers with the connect
    /// packet carrying `identity`, and optionally marks the session as
    /// long-lived.
    pub async fn handshake(
        stream: impl HdcStream + 'static,
        identity: &str,
        keep_alive: bool,
    ) -> Result<Self, TransportError> {
        let mut stream: Box<dyn HdcStream> = Box::new(stream);

        let mut greeting = [0u8; DAEMON_GREETING_SIZE];
        timeout(DEFAULT_READ_TIMEOUT, stream.read_exact(&mut greeting))
            .await
            .map_err(|_| TransportError::Timeout)??;
        protocol::verify_banner(&greeting).map_err(TransportError::Handshake)?;

        stream.write_all(&protocol::encode_connect_packet(identity)).await?;
        stream.flush().await?;
        trace!(identity, keep_alive, "handshake complete");

        let mut conn = Self {
            stream: Some(stream),
            read_timeout: DEFAULT_READ_TIMEOUT,
        };
        if keep_alive {
            conn.send_command(ALIVE_COMMAND).await?;
        }
        Ok(conn)
    }

    /// Wrap a stream that needs no handshake (the peer side in tests, or a
    /// stream whose handshake was done elsewhere).
    pub fn from_stream(stream: impl HdcStream + 'static) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Override the per-chunk read timeout.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Returns `true` while the connection has not been closed or invalidated.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Send a NUL-terminated text command.
    pub async fn send_command(&mut self, text: &str) -> Result<(), TransportError> {
        trace!(command = text, "sending command");
        self.write(&protocol::encode_command(text)).await
    }

    /// Send one length-prefixed data chunk.
    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > MAX_CHUNK_SIZE {
            return Err(ProtocolError::FrameTooLarge(data.len()).into());
        }
        trace!(chunk_bytes = data.len(), "sending chunk");
        self.write(&protocol::encode_frame(data)).await
    }

    /// Send the zero-length chunk that marks the end of a data stream.
    pub async fn send_eof(&mut self) -> Result<(), TransportError> {
        self.write(&0u32.to_be_bytes()).await
    }

    /// Read one chunk. Returns `None` on a zero-length chunk or on a clean
    /// EOF at a chunk boundary.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;

        let result = match timeout(read_timeout, read_chunk_from(stream)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        if result.is_err() {
            // Stream state is unknown after a failed read.
            self.stream.take();
        }
        result
    }

    /// Read chunks until the end-of-stream marker and concatenate them.
    pub async fn read_all(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        trace!(total_bytes = out.len(), "read complete response");
        Ok(out)
    }

    /// Shut down the write half and drop the stream.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let result = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.stream.take();
            return Err(TransportError::Io(e));
        }
        Ok(())
    }
}

/// Read one chunk: a 4-byte BE length followed by that many bytes.
async fn read_chunk_from<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TransportError::Truncated {
                expected: header.len(),
                received: filled,
            });
        }
        filled += n;
    }

    let len = protocol::read_frame_length(&header) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_CHUNK_SIZE {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }

    let mut payload = vec![0u8; len];
    let mut received = 0;
    while received < len {
        let n = reader.read(&mut payload[received..]).await?;
        if n == 0 {
            return Err(TransportError::Truncated {
                expected: len,
                received,
            });
        }
        received += n;
    }
    trace!(chunk_bytes = len, "read chunk");
    Ok(Some(payload))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
