//! Translation between relay-side HTTP exchanges and tunneled `http_invoke`
//! messages.

use std::collections::BTreeMap;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use wirehome_cloud_channel::InvokeError;
use wirehome_cloud_protocol::{
    ChannelIdentifier, CloudMessage, CloudMessageType, ErrorContent, HttpRequestContent,
    HttpResponseContent, WireError, CHANNEL_UID_COOKIE, CHANNEL_UID_HEADER, SESSION_COOKIE,
};

use crate::auth::{AuthError, AuthorizationContext};
use crate::connector::DeviceConnectorService;
use crate::headers::set_cookie;

pub const ENTER_HEADER: &str = "Wirehome-Cloud-Enter";
pub const EXIT_HEADER: &str = "Wirehome-Cloud-Exit";

/// Hop-by-hop headers plus those the relay consumes itself.
const REQUEST_HEADER_DENYLIST: &[&str] = &[
    "authorization",
    "connection",
    "content-length",
    "cookie",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const RESPONSE_HEADER_DENYLIST: &[&str] =
    &["connection", "content-length", "keep-alive", "trailer", "transfer-encoding", "upgrade"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundHttpRequest {
    pub method: String,
    /// Path plus query string.
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundHttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl OutboundHttpResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            body: body.into().into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::headers::header_value(&self.headers, name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error("device reported an error: {0}")]
    Device(String),

    #[error("unreadable device response: {0}")]
    Content(#[from] WireError),
}

impl BridgeError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Invoke(InvokeError::NotConnected(_)) => 504,
            Self::Invoke(InvokeError::Cancelled) => 503,
            Self::Invoke(_) | Self::Device(_) | Self::Content(_) => 502,
        }
    }
}

/// Response for a failed authorization.
pub fn auth_failure(err: &AuthError) -> OutboundHttpResponse {
    if err.is_internal() {
        log::error!("bridge: identity store failure: {err}");
        return OutboundHttpResponse::text(500, "internal error");
    }
    if err.is_forbidden() {
        return OutboundHttpResponse::text(403, err.to_string());
    }
    log::debug!("bridge: unauthorized request: {err}");
    let mut response = OutboundHttpResponse::text(401, "unauthorized");
    response.headers.push(("WWW-Authenticate".into(), "Basic realm=\"Wirehome Cloud\"".into()));
    response
}

/// Session and channel cookies for a caller that just presented a password.
pub fn session_cookies(context: &AuthorizationContext, max_age_secs: u64) -> Vec<(String, String)> {
    let Some(token) = context.session_token.as_deref() else {
        return Vec::new();
    };
    let selector = if context.channel.identity_uid == context.identity_uid {
        context.channel.channel_uid.clone()
    } else {
        context.channel.to_string()
    };
    vec![
        ("Set-Cookie".into(), set_cookie(SESSION_COOKIE, token, Some(max_age_secs))),
        ("Set-Cookie".into(), set_cookie(CHANNEL_UID_COOKIE, &selector, Some(max_age_secs))),
    ]
}

pub fn timestamp() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Snapshot of `request` as carried to the device.
pub fn to_request_content(request: InboundHttpRequest) -> HttpRequestContent {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in request.headers {
        let lower = name.to_ascii_lowercase();
        if REQUEST_HEADER_DENYLIST.contains(&lower.as_str())
            || name.eq_ignore_ascii_case(CHANNEL_UID_HEADER)
        {
            continue;
        }
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    HttpRequestContent { method: request.method, uri: request.uri, headers, content: request.body }
}

/// Translate the device's reply back into an HTTP response.
pub fn from_reply(reply: &CloudMessage) -> Result<OutboundHttpResponse, BridgeError> {
    if reply.message_type == CloudMessageType::Error {
        let message = reply
            .content::<ErrorContent>()
            .map(|content| content.message)
            .unwrap_or_else(|_| "unspecified device error".to_string());
        return Err(BridgeError::Device(message));
    }

    let content: HttpResponseContent = reply.content()?;
    let headers = content
        .headers
        .into_iter()
        .filter(|(name, _)| !RESPONSE_HEADER_DENYLIST.contains(&name.to_ascii_lowercase().as_str()))
        .collect();
    Ok(OutboundHttpResponse { status: content.status_code, headers, body: content.content })
}

impl DeviceConnectorService {
    /// Authenticate `request`, tunnel it to the addressed device and return
    /// the device's answer. Failures become error responses.
    pub async fn dispatch_http_request(
        &self,
        request: InboundHttpRequest,
        cancel: &CancellationToken,
    ) -> OutboundHttpResponse {
        let entered = timestamp();
        let context = match self.authorization().authorize_request(&request.headers).await {
            Ok(context) => context,
            Err(err) => return auth_failure(&err),
        };

        let mut response = match self.forward_http(&context.channel, request, cancel).await {
            Ok(response) => response,
            Err(err) => {
                log::debug!("bridge({}): {err}", context.channel);
                OutboundHttpResponse::text(err.status(), err.to_string())
            }
        };

        let max_age = self.authorization().session_tokens().ttl().as_secs();
        response.headers.extend(session_cookies(&context, max_age));
        response.headers.push((ENTER_HEADER.into(), entered));
        response.headers.push((EXIT_HEADER.into(), timestamp()));
        response
    }

    pub async fn forward_http(
        &self,
        channel: &ChannelIdentifier,
        request: InboundHttpRequest,
        cancel: &CancellationToken,
    ) -> Result<OutboundHttpResponse, BridgeError> {
        let content = to_request_content(request);
        log::trace!("bridge({channel}): {} {}", content.method, content.uri);
        let message = CloudMessage::with_content(CloudMessageType::HttpInvoke, &content)?;
        let reply = self.invoke(channel, message, cancel).await?;
        from_reply(&reply)
    }
}
