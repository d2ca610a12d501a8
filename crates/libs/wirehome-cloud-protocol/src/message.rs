use std::collections::BTreeMap;
use std::fmt;

use rand_core::{OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// Tunnel message types.
///
/// On the wire the type is a plain string, so types this build does not know
/// survive a round trip as [`CloudMessageType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CloudMessageType {
    /// First message on a new connection, carries [`crate::AuthorizeContent`].
    Authorize,
    Ping,
    /// Tunneled HTTP request, carries [`crate::HttpRequestContent`].
    HttpInvoke,
    /// JSON document dispatched to a named handler on the device.
    Raw,
    /// Failure reply, carries [`crate::ErrorContent`].
    Error,
    /// Plain reply to a correlated request.
    Response,
    Other(String),
}

impl CloudMessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Authorize => "wirehome.cloud.message.authorize",
            Self::Ping => "wirehome.cloud.message.ping",
            Self::HttpInvoke => "wirehome.cloud.message.http_invoke",
            Self::Raw => "wirehome.cloud.message.raw",
            Self::Error => "wirehome.cloud.message.error",
            Self::Response => "wirehome.cloud.message.response",
            Self::Other(value) => value.as_str(),
        }
    }
}

impl From<String> for CloudMessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "wirehome.cloud.message.authorize" => Self::Authorize,
            "wirehome.cloud.message.ping" => Self::Ping,
            "wirehome.cloud.message.http_invoke" => Self::HttpInvoke,
            "wirehome.cloud.message.raw" => Self::Raw,
            "wirehome.cloud.message.error" => Self::Error,
            "wirehome.cloud.message.response" => Self::Response,
            _ => Self::Other(value),
        }
    }
}

impl From<CloudMessageType> for String {
    fn from(value: CloudMessageType) -> Self {
        match value {
            CloudMessageType::Other(value) => value,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for CloudMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical tunnel message.
///
/// `correlation_id` is set on requests that await a reply and on the replies
/// themselves; unsolicited messages leave it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudMessage {
    pub message_type: CloudMessageType,
    pub correlation_id: Option<String>,
    pub payload: Vec<u8>,
    pub properties: BTreeMap<String, String>,
}

impl CloudMessage {
    pub fn new(message_type: CloudMessageType) -> Self {
        Self { message_type, correlation_id: None, payload: Vec::new(), properties: BTreeMap::new() }
    }

    /// Create a message whose payload is the msgpack encoding of `content`.
    pub fn with_content<T: Serialize>(
        message_type: CloudMessageType,
        content: &T,
    ) -> Result<Self, WireError> {
        let mut message = Self::new(message_type);
        message.payload = rmp_serde::to_vec(content)?;
        Ok(message)
    }

    /// Create a reply carrying the correlation ID of `request`.
    pub fn reply_to(request: &CloudMessage, message_type: CloudMessageType) -> Self {
        let mut reply = Self::new(message_type);
        reply.correlation_id = request.correlation_id.clone();
        reply
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_new_correlation_id(self) -> Self {
        self.with_correlation_id(new_correlation_id())
    }

    /// Decode the msgpack payload into `T`.
    pub fn content<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        if self.payload.is_empty() {
            return Err(WireError::EmptyPayload);
        }
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// 16 random bytes, hex encoded.
pub fn new_correlation_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
