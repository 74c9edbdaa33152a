//! Transport abstraction layer for peer connections
//!
//! Provides a unified interface for framed message I/O so the peer engine
//! does not care what carries its bytes, plus the TCP implementation used
//! for real connections.

use anyhow::Result;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::network::protocol::{Message, MessageCodec, HEADER_LEN};

/// A framed, bidirectional peer connection.
///
/// Reads and writes may run concurrently from different tasks; `close` is
/// synchronous and hard: a blocked read or write fails immediately.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Read the next message from the remote end.
    async fn read_message(&self) -> Result<Message>;

    /// Write a message to the remote end.
    async fn write_message(&self, msg: &Message) -> Result<()>;

    /// The remote end's socket address.
    fn remote_addr(&self) -> SocketAddr;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Total bytes read from the remote end.
    fn bytes_read(&self) -> u64;

    /// Total bytes written to the remote end.
    fn bytes_written(&self) -> u64;
}

/// Establishes outbound connections.
///
/// Injected into the server context so tests can substitute their own.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to the given "host:port" address.
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Connection>>;
}

/// TCP dialer used for real outbound connections.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Connection>> {
        debug!("Connecting to peer: {}", addr);
        let stream = TcpStream::connect(addr).await?;
        Ok(Arc::new(TcpConnection::new(stream)?))
    }
}

/// TCP connection implementation
///
/// The stream is split so the dispatcher can read while the writer writes.
/// A cloned std handle backs the synchronous `close`.
pub struct TcpConnection {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    control: std::net::TcpStream,
    remote: SocketAddr,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl TcpConnection {
    /// Wrap an established TCP stream.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let remote = stream.peer_addr()?;

        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        std_stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std_stream)?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control,
            remote,
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Connection for TcpConnection {
    async fn read_message(&self) -> Result<Message> {
        let mut reader = self.reader.lock().await;

        let mut header_bytes = [0u8; HEADER_LEN];
        reader.read_exact(&mut header_bytes).await?;
        let header = MessageCodec::decode_header(&header_bytes)?;

        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload).await?;

        self.bytes_read
            .fetch_add((HEADER_LEN + payload.len()) as u64, Ordering::Relaxed);

        Ok(MessageCodec::decode_payload(&header, &payload)?)
    }

    async fn write_message(&self, msg: &Message) -> Result<()> {
        let frame = MessageCodec::encode(msg)?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;

        self.bytes_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn close(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}
