//! # wirehome-cloud-channel
//!
//! Connection-level machinery shared by the relay and the device agent:
//!
//! - [`ConnectorChannel`] frames [`wirehome_cloud_protocol::CloudMessage`]s
//!   over a [`FrameSink`]/[`FrameSource`] pair and keeps traffic statistics.
//! - [`OpenChannel`] multiplexes concurrent request/reply exchanges over one
//!   channel by correlation ID and hands everything else to
//!   [`InboundHandler`]s.

pub mod channel;
pub mod error;
pub mod session;
pub mod statistics;
pub mod transport;

pub use channel::{ConnectorChannel, ReceiveResult};
pub use error::{ChannelError, InvokeError};
pub use session::{Dispatch, InboundHandler, OpenChannel};
pub use statistics::{ChannelStatistics, ChannelStatisticsSnapshot};
pub use transport::{memory_pair, FrameChunk, FrameSink, FrameSource, MemoryEndpoint};
