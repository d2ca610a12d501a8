use tokio::sync::Mutex;
use wirehome_cloud_protocol::{wire, CloudMessage, MAX_DECOMPRESSED_SIZE};

use crate::error::ChannelError;
use crate::statistics::{ChannelStatistics, ChannelStatisticsSnapshot};
use crate::transport::{FrameChunk, FrameSink, FrameSource};

/// Outcome of [`ConnectorChannel::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveResult {
    Message(CloudMessage),
    /// The peer closed the connection or sent something undecodable.
    Close,
}

/// Frames [`CloudMessage`]s over one transport.
///
/// Sends are serialized by an internal lock so concurrent callers never
/// interleave frames. There must be a single reader.
pub struct ConnectorChannel {
    sink: Mutex<Box<dyn FrameSink>>,
    source: Mutex<Box<dyn FrameSource>>,
    statistics: ChannelStatistics,
}

impl ConnectorChannel {
    pub fn new(sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self { sink: Mutex::new(sink), source: Mutex::new(source), statistics: ChannelStatistics::new() }
    }

    pub async fn send(&self, message: &CloudMessage) -> Result<(), ChannelError> {
        let frame = wire::encode(message).inspect_err(|_| self.statistics.record_send_error())?;
        let len = frame.len();

        let mut sink = self.sink.lock().await;
        if let Err(err) = sink.send_frame(frame).await {
            self.statistics.record_send_error();
            return Err(err.into());
        }
        self.statistics.record_sent(len);
        Ok(())
    }

    /// Read the next complete message, reassembling fragments.
    ///
    /// An undecodable message is counted and reported as [`ReceiveResult::Close`];
    /// the connection cannot be trusted after it.
    pub async fn receive(&self) -> Result<ReceiveResult, ChannelError> {
        let mut source = self.source.lock().await;
        let mut buffer = Vec::new();

        loop {
            let chunk = match source.next_chunk().await {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.statistics.record_receive_error();
                    return Err(err.into());
                }
            };

            match chunk {
                FrameChunk::Close => return Ok(ReceiveResult::Close),
                FrameChunk::Unsupported => {
                    return Ok(self.malformed("unsupported frame type"));
                }
                FrameChunk::Data { bytes, end_of_message } => {
                    self.statistics.record_bytes_received(bytes.len());
                    buffer.extend_from_slice(&bytes);
                    if buffer.len() as u64 > MAX_DECOMPRESSED_SIZE {
                        return Ok(self.malformed("frame exceeds size limit"));
                    }
                    if end_of_message {
                        break;
                    }
                }
            }
        }

        match wire::decode(&buffer) {
            Ok(message) => {
                self.statistics.record_message_received();
                Ok(ReceiveResult::Message(message))
            }
            Err(err) => Ok(self.malformed(&err.to_string())),
        }
    }

    fn malformed(&self, reason: &str) -> ReceiveResult {
        self.statistics.record_malformed();
        log::warn!("channel: received malformed message ({reason}), closing");
        ReceiveResult::Close
    }

    pub async fn close(&self) {
        if let Err(err) = self.sink.lock().await.close().await {
            log::debug!("channel: close failed: {err}");
        }
    }

    pub fn statistics(&self) -> ChannelStatisticsSnapshot {
        self.statistics.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.statistics.reset();
    }
}

impl std::fmt::Debug for ConnectorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorChannel").field("statistics", &self.statistics).finish_non_exhaustive()
    }
}
