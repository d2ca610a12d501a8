//! Frame encode/decode for [`CloudMessage`]s.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use serde::{Deserialize, Serialize};

use crate::message::{CloudMessage, CloudMessageType};
use crate::{COMPRESSION_THRESHOLD, MAX_DECOMPRESSED_SIZE};

/// Errors from wire operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("payload compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("payload decompression failed: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("decompressed payload exceeds {MAX_DECOMPRESSED_SIZE} bytes")]
    PayloadTooLarge,

    #[error("message has no payload")]
    EmptyPayload,
}

/// The envelope as it travels inside one binary WebSocket message.
#[derive(Debug, Serialize, Deserialize)]
struct TransportCloudMessage {
    message_type: String,
    correlation_id: Option<String>,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    payload_is_compressed: bool,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

/// Encode `message` into a single frame, compressing large payloads.
pub fn encode(message: &CloudMessage) -> Result<Vec<u8>, WireError> {
    let (payload, payload_is_compressed) = if message.payload.len() > COMPRESSION_THRESHOLD {
        (compress(&message.payload)?, true)
    } else {
        (message.payload.clone(), false)
    };

    let transport = TransportCloudMessage {
        message_type: message.message_type.as_str().to_string(),
        correlation_id: message.correlation_id.clone(),
        payload,
        payload_is_compressed,
        properties: message.properties.clone(),
    };
    Ok(rmp_serde::to_vec(&transport)?)
}

/// Decode one frame produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<CloudMessage, WireError> {
    let transport: TransportCloudMessage = rmp_serde::from_slice(data)?;
    let payload = if transport.payload_is_compressed {
        decompress(&transport.payload)?
    } else {
        transport.payload
    };

    Ok(CloudMessage {
        message_type: CloudMessageType::from(transport.message_type),
        correlation_id: transport.correlation_id.filter(|id| !id.is_empty()),
        payload,
        properties: transport.properties,
    })
}

fn compress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(WireError::Compression)?;
    encoder.finish().map_err(WireError::Compression)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    // One byte past the limit tells an oversized payload apart from an exact fit.
    BzDecoder::new(data)
        .take(MAX_DECOMPRESSED_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(WireError::Decompression)?;
    if out.len() as u64 > MAX_DECOMPRESSED_SIZE {
        return Err(WireError::PayloadTooLarge);
    }
    Ok(out)
}
