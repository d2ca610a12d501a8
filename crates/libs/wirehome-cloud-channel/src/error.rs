use wirehome_cloud_protocol::{ChannelIdentifier, WireError};

/// Errors from a single [`crate::ConnectorChannel`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Errors returned to a caller awaiting a correlated reply.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("channel {0} is not connected")]
    NotConnected(ChannelIdentifier),

    #[error("invocation cancelled")]
    Cancelled,

    #[error("channel disconnected before a reply arrived")]
    Disconnected,

    #[error("failed to send request: {0}")]
    Send(#[from] ChannelError),
}
