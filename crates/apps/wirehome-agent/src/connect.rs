//! Outbound WebSocket transport to the relay.

use std::io;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wirehome_cloud_channel::{FrameChunk, FrameSink, FrameSource};

pub type Transport = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Opens a fresh transport to the relay for every connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<Transport>;
}

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> io::Result<Transport> {
        let (socket, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(io::Error::other)?;
        log::debug!("connect: upgraded {} ({})", self.url, response.status());
        let (sink, stream) = socket.split();
        Ok((Box::new(TungsteniteSink(sink)), Box::new(TungsteniteSource(stream))))
    }
}

struct TungsteniteSink(SplitSink<Socket, Message>);

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()> {
        self.0.send(Message::Binary(frame.into())).await.map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        // The relay may already be gone.
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
        Ok(())
    }
}

struct TungsteniteSource(SplitStream<Socket>);

#[async_trait]
impl FrameSource for TungsteniteSource {
    async fn next_chunk(&mut self) -> io::Result<FrameChunk> {
        loop {
            match self.0.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(FrameChunk::Close),
                Some(Ok(Message::Binary(bytes))) => return Ok(FrameChunk::message(bytes.to_vec())),
                Some(Ok(Message::Text(_))) => return Ok(FrameChunk::Unsupported),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }
}
