//! # wirehome-cloud-protocol
//!
//! Wire envelope and message contents of the Wirehome cloud relay tunnel.
//!
//! A device keeps one outbound WebSocket open to the relay. Every binary
//! frame on that socket carries exactly one [`CloudMessage`], encoded as a
//! msgpack array:
//!
//! ```text
//! [type:str][correlation_id:str|nil][payload:bin][compressed:bool][properties:map]
//! ```
//!
//! Payloads above [`COMPRESSION_THRESHOLD`] bytes are bzip2 compressed by the
//! sender and transparently decompressed by the receiver.
//!
//! ## Example
//!
//! ```rust
//! use wirehome_cloud_protocol::{wire, CloudMessage, CloudMessageType};
//!
//! let msg = CloudMessage::new(CloudMessageType::Ping).with_new_correlation_id();
//! let encoded = wire::encode(&msg).unwrap();
//! let decoded = wire::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod content;
pub mod identifier;
pub mod message;
pub mod wire;

pub use content::{AuthorizeContent, ErrorContent, HttpRequestContent, HttpResponseContent};
pub use identifier::{ChannelIdentifier, DEFAULT_CHANNEL_UID};
pub use message::{new_correlation_id, CloudMessage, CloudMessageType};
pub use wire::WireError;

/// Payloads larger than this many bytes are compressed on the wire.
pub const COMPRESSION_THRESHOLD: usize = 4096;

/// Upper bound for a decompressed payload.
pub const MAX_DECOMPRESSED_SIZE: u64 = 64 * 1024 * 1024;

/// Header a device or browser may use to select the addressed channel.
pub const CHANNEL_UID_HEADER: &str = "WirehomeCloud-ChannelUid";

/// Cookie carrying the selected channel of an authenticated caller.
pub const CHANNEL_UID_COOKIE: &str = "wirehome-channel-uid";

/// Cookie carrying the signed session token of an authenticated caller.
pub const SESSION_COOKIE: &str = "wirehome-session";
