//! Frame transport seam between a [`crate::ConnectorChannel`] and its socket.
//!
//! The relay adapts axum WebSockets, the agent adapts tokio-tungstenite, and
//! [`memory_pair`] connects two channels in-process.

use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One read from a [`FrameSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameChunk {
    /// Part of a binary message; the message is complete once
    /// `end_of_message` is set.
    Data { bytes: Vec<u8>, end_of_message: bool },
    /// A frame the tunnel cannot carry, such as a text frame.
    Unsupported,
    /// The peer closed the connection.
    Close,
}

impl FrameChunk {
    /// A complete binary message in one chunk.
    pub fn message(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Data { bytes: bytes.into(), end_of_message: true }
    }
}

/// Write half of a frame transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one complete binary message.
    async fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()>;

    /// Initiate a graceful close. Repeated calls must not fail loudly.
    async fn close(&mut self) -> io::Result<()>;
}

/// Read half of a frame transport.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_chunk(&mut self) -> io::Result<FrameChunk>;
}

/// Depth of each direction of an in-memory pair.
const MEMORY_QUEUE_DEPTH: usize = 64;

/// Sending half of an in-memory transport.
#[derive(Debug, Clone)]
pub struct MemorySink {
    tx: mpsc::Sender<FrameChunk>,
}

impl MemorySink {
    /// Push a raw chunk to the peer, e.g. a fragment or a text frame.
    pub async fn send_chunk(&self, chunk: FrameChunk) -> io::Result<()> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory peer dropped"))
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()> {
        self.send_chunk(FrameChunk::message(frame)).await
    }

    async fn close(&mut self) -> io::Result<()> {
        // The peer may already be gone.
        let _ = self.tx.send(FrameChunk::Close).await;
        Ok(())
    }
}

/// Receiving half of an in-memory transport.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<FrameChunk>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_chunk(&mut self) -> io::Result<FrameChunk> {
        Ok(self.rx.recv().await.unwrap_or(FrameChunk::Close))
    }
}

/// One side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryEndpoint {
    pub sink: MemorySink,
    pub source: MemorySource,
}

/// Two connected endpoints: frames sent on one side arrive at the other.
pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, a_rx) = mpsc::channel(MEMORY_QUEUE_DEPTH);
    let (b_tx, b_rx) = mpsc::channel(MEMORY_QUEUE_DEPTH);
    (
        MemoryEndpoint { sink: MemorySink { tx: a_tx }, source: MemorySource { rx: b_rx } },
        MemoryEndpoint { sink: MemorySink { tx: b_tx }, source: MemorySource { rx: a_rx } },
    )
}
