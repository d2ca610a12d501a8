//! Typed payloads carried inside [`crate::CloudMessage`]s.
//!
//! All contents are msgpack encoded as positional arrays, so field order is
//! part of the wire contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Credentials sent by a device as the first message of a connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeContent {
    pub identity_uid: String,
    pub password: String,
    pub channel_uid: String,
}

impl std::fmt::Debug for AuthorizeContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizeContent")
            .field("identity_uid", &self.identity_uid)
            .field("password", &"<redacted>")
            .field("channel_uid", &self.channel_uid)
            .finish()
    }
}

/// Snapshot of an inbound HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestContent {
    pub method: String,
    /// Path plus query string, e.g. `/status?x=1`.
    pub uri: String,
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

/// The device's answer to an [`HttpRequestContent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseContent {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl HttpResponseContent {
    pub fn new(status_code: u16) -> Self {
        Self { status_code, headers: BTreeMap::new(), content: Vec::new() }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub message: String,
}
