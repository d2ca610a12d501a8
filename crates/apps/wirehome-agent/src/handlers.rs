//! Device-side handling of requests arriving from the relay.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use wirehome_cloud_channel::{Dispatch, InboundHandler, OpenChannel};
use wirehome_cloud_protocol::{
    CloudMessage, CloudMessageType, ErrorContent, HttpRequestContent, HttpResponseContent,
    WireError,
};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid request content: {0}")]
    Content(#[from] WireError),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("raw request has no \"type\"")]
    MissingRawType,

    #[error("no raw handler registered for '{0}'")]
    UnknownRawType(String),

    #[error("invalid HTTP request: {0}")]
    InvalidHttpRequest(String),

    #[error("local HTTP request failed: {0}")]
    LocalHttp(#[from] reqwest::Error),

    #[error("{0}")]
    Failed(String),
}

/// Executes a tunneled HTTP request against the device's own API.
#[async_trait]
pub trait LocalHttpHandler: Send + Sync {
    async fn invoke(&self, request: HttpRequestContent) -> Result<HttpResponseContent, HandlerError>;
}

/// Forwards tunneled requests to a local HTTP server.
pub struct ReqwestHttpHandler {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestHttpHandler {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    fn url_for(&self, uri: &str) -> String {
        if uri.starts_with('/') {
            format!("{}{uri}", self.base_url)
        } else {
            format!("{}/{uri}", self.base_url)
        }
    }
}

#[async_trait]
impl LocalHttpHandler for ReqwestHttpHandler {
    async fn invoke(&self, request: HttpRequestContent) -> Result<HttpResponseContent, HandlerError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HandlerError::InvalidHttpRequest(format!("method '{}'", request.method)))?;
        let mut builder = self.client.request(method, self.url_for(&request.uri));
        for (name, value) in &request.headers {
            // Host and length belong to the local hop.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.content).send().await?;
        let mut content = HttpResponseContent::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                merge_header(&mut content.headers, name.as_str(), value);
            }
        }
        content.content = response.bytes().await?.to_vec();
        Ok(content)
    }
}

/// Fold a repeated response header into one value. `Set-Cookie` cannot be
/// comma-joined (cookie dates contain commas), so only its first value is kept.
fn merge_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    match headers.get_mut(name) {
        None => {
            headers.insert(name.to_string(), value.to_string());
        }
        Some(_) if name.eq_ignore_ascii_case("set-cookie") => {
            log::debug!("agent: dropping additional Set-Cookie header");
        }
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(value);
        }
    }
}

/// Handler for one kind of raw JSON request.
#[async_trait]
pub trait RawHandler: Send + Sync {
    async fn invoke(&self, request: Value) -> Result<Value, HandlerError>;
}

/// Raw handlers keyed by the request's `"type"` field.
#[derive(Default)]
pub struct RawHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn RawHandler>>>,
}

impl RawHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_type: impl Into<String>, handler: Arc<dyn RawHandler>) {
        let request_type = request_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(|poison| poison.into_inner());
        if handlers.insert(request_type.clone(), handler).is_some() {
            log::debug!("agent: replaced raw handler '{request_type}'");
        }
    }

    pub fn unregister(&self, request_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|poison| poison.into_inner())
            .remove(request_type)
            .is_some()
    }

    fn get(&self, request_type: &str) -> Option<Arc<dyn RawHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(request_type)
            .cloned()
    }

    pub async fn dispatch(&self, payload: &[u8]) -> Result<Value, HandlerError> {
        let request: Value = serde_json::from_slice(payload)?;
        let request_type = request
            .get("type")
            .and_then(Value::as_str)
            .ok_or(HandlerError::MissingRawType)?
            .to_string();
        let handler =
            self.get(&request_type).ok_or_else(|| HandlerError::UnknownRawType(request_type))?;
        handler.invoke(request).await
    }
}

/// Answers pings, HTTP invocations and raw requests sent by the relay.
///
/// Each request runs on its own task so a slow local call never holds up the
/// session's receive loop.
#[derive(Clone)]
pub struct AgentRequestHandler {
    local_http: Arc<dyn LocalHttpHandler>,
    raw: Arc<RawHandlerRegistry>,
}

impl AgentRequestHandler {
    pub fn new(local_http: Arc<dyn LocalHttpHandler>, raw: Arc<RawHandlerRegistry>) -> Self {
        Self { local_http, raw }
    }

    pub async fn process(&self, request: &CloudMessage) -> CloudMessage {
        match self.reply_for(request).await {
            Ok(reply) => reply,
            Err(err) => {
                log::warn!("agent: {} failed: {err}", request.message_type);
                let content = ErrorContent { message: err.to_string() };
                reply_with(request, CloudMessageType::Error, &content)
                    .unwrap_or_else(|_| CloudMessage::reply_to(request, CloudMessageType::Error))
            }
        }
    }

    async fn reply_for(&self, request: &CloudMessage) -> Result<CloudMessage, HandlerError> {
        match &request.message_type {
            CloudMessageType::Ping => Ok(CloudMessage::reply_to(request, CloudMessageType::Response)),
            CloudMessageType::HttpInvoke => {
                let content: HttpRequestContent = request.content()?;
                log::debug!("agent: {} {}", content.method, content.uri);
                let response = self.local_http.invoke(content).await?;
                Ok(reply_with(request, CloudMessageType::Response, &response)?)
            }
            CloudMessageType::Raw => {
                let result = self.raw.dispatch(&request.payload).await?;
                Ok(CloudMessage::reply_to(request, CloudMessageType::Response)
                    .with_payload(serde_json::to_vec(&result)?))
            }
            other => Err(HandlerError::Failed(format!("unsupported message type {other}"))),
        }
    }
}

fn reply_with<T: Serialize>(
    request: &CloudMessage,
    message_type: CloudMessageType,
    content: &T,
) -> Result<CloudMessage, WireError> {
    let mut reply = CloudMessage::with_content(message_type, content)?;
    reply.correlation_id = request.correlation_id.clone();
    Ok(reply)
}

fn is_request(message_type: &CloudMessageType) -> bool {
    matches!(
        message_type,
        CloudMessageType::Ping | CloudMessageType::HttpInvoke | CloudMessageType::Raw
    )
}

#[async_trait]
impl InboundHandler for AgentRequestHandler {
    async fn handle(&self, session: &Arc<OpenChannel>, message: CloudMessage) -> Dispatch {
        if !is_request(&message.message_type) {
            return Dispatch::Declined(message);
        }
        if message.correlation_id.is_none() {
            log::trace!("agent: ignoring uncorrelated {}", message.message_type);
            return Dispatch::Handled;
        }

        let handler = self.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let reply = tokio::select! {
                reply = handler.process(&message) => reply,
                _ = session.closed() => return,
            };
            if let Err(err) = session.send(&reply).await {
                log::debug!("agent: reply to {} not delivered: {err}", message.message_type);
            }
        });
        Dispatch::Handled
    }
}

/// Answers `{"type": "wirehome.agent.status"}` with the agent's version.
pub struct StatusRawHandler;

pub const STATUS_RAW_TYPE: &str = "wirehome.agent.status";

#[async_trait]
impl RawHandler for StatusRawHandler {
    async fn invoke(&self, _request: Value) -> Result<Value, HandlerError> {
        Ok(serde_json::json!({
            "agent": "wirehome-agent",
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirehome_cloud_channel::{memory_pair, ConnectorChannel, ReceiveResult};
    use wirehome_cloud_protocol::ChannelIdentifier;

    struct EchoHttp;

    #[async_trait]
    impl LocalHttpHandler for EchoHttp {
        async fn invoke(
            &self,
            request: HttpRequestContent,
        ) -> Result<HttpResponseContent, HandlerError> {
            if request.uri == "/fail" {
                return Err(HandlerError::Failed("local API unavailable".into()));
            }
            let mut response = HttpResponseContent::new(200);
            response.headers.insert("Content-Type".into(), "text/plain".into());
            response.content = format!("{} {}", request.method, request.uri).into_bytes();
            Ok(response)
        }
    }

    struct Echo;

    #[async_trait]
    impl RawHandler for Echo {
        async fn invoke(&self, request: Value) -> Result<Value, HandlerError> {
            Ok(request)
        }
    }

    fn handler() -> AgentRequestHandler {
        let raw = Arc::new(RawHandlerRegistry::new());
        raw.register("echo", Arc::new(Echo));
        AgentRequestHandler::new(Arc::new(EchoHttp), raw)
    }

    #[tokio::test]
    async fn ping_is_answered_with_response() {
        let request = CloudMessage::new(CloudMessageType::Ping).with_correlation_id("c1");
        let reply = handler().process(&request).await;
        assert_eq!(reply.message_type, CloudMessageType::Response);
        assert_eq!(reply.correlation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn http_invoke_is_forwarded_to_local_handler() {
        let content = HttpRequestContent {
            method: "GET".into(),
            uri: "/api/lamps".into(),
            ..Default::default()
        };
        let request = CloudMessage::with_content(CloudMessageType::HttpInvoke, &content)
            .expect("content")
            .with_correlation_id("c2");
        let reply = handler().process(&request).await;
        assert_eq!(reply.message_type, CloudMessageType::Response);
        assert_eq!(reply.correlation_id.as_deref(), Some("c2"));
        let response: HttpResponseContent = reply.content().expect("response");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.content, b"GET /api/lamps");
    }

    #[tokio::test]
    async fn local_failure_becomes_error_reply() {
        let content = HttpRequestContent { method: "GET".into(), uri: "/fail".into(), ..Default::default() };
        let request = CloudMessage::with_content(CloudMessageType::HttpInvoke, &content)
            .expect("content")
            .with_correlation_id("c3");
        let reply = handler().process(&request).await;
        assert_eq!(reply.message_type, CloudMessageType::Error);
        assert_eq!(reply.correlation_id.as_deref(), Some("c3"));
        let error: ErrorContent = reply.content().expect("error");
        assert!(error.message.contains("local API unavailable"));
    }

    #[tokio::test]
    async fn raw_requests_route_by_type() {
        let handler = handler();
        let request = CloudMessage::new(CloudMessageType::Raw)
            .with_payload(br#"{"type":"echo","value":1}"#.to_vec())
            .with_correlation_id("c4");
        let reply = handler.process(&request).await;
        assert_eq!(reply.message_type, CloudMessageType::Response);
        let body: Value = serde_json::from_slice(&reply.payload).expect("json");
        assert_eq!(body["value"], 1);

        let unknown = CloudMessage::new(CloudMessageType::Raw)
            .with_payload(br#"{"type":"missing"}"#.to_vec())
            .with_correlation_id("c5");
        assert_eq!(handler.process(&unknown).await.message_type, CloudMessageType::Error);

        let untyped = CloudMessage::new(CloudMessageType::Raw)
            .with_payload(b"{}".to_vec())
            .with_correlation_id("c6");
        assert_eq!(handler.process(&untyped).await.message_type, CloudMessageType::Error);
    }

    #[test]
    fn registry_unregister_reports_presence() {
        let registry = RawHandlerRegistry::new();
        registry.register(STATUS_RAW_TYPE, Arc::new(StatusRawHandler));
        assert!(registry.unregister(STATUS_RAW_TYPE));
        assert!(!registry.unregister(STATUS_RAW_TYPE));
    }

    #[test]
    fn repeated_headers_are_joined_except_set_cookie() {
        let mut headers = BTreeMap::new();
        merge_header(&mut headers, "vary", "Accept");
        merge_header(&mut headers, "vary", "Origin");
        merge_header(&mut headers, "set-cookie", "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT");
        merge_header(&mut headers, "set-cookie", "b=2; Expires=Thu, 22 Oct 2026 07:28:00 GMT");
        assert_eq!(headers["vary"], "Accept, Origin");
        assert_eq!(headers["set-cookie"], "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT");
    }

    #[test]
    fn base_url_joins_uri() {
        let handler =
            ReqwestHttpHandler::new("http://127.0.0.1:80/", Duration::from_secs(1)).expect("client");
        assert_eq!(handler.url_for("/status?x=1"), "http://127.0.0.1:80/status?x=1");
        assert_eq!(handler.url_for("status"), "http://127.0.0.1:80/status");
    }

    #[tokio::test]
    async fn session_handler_replies_over_channel() {
        let (agent_end, relay_end) = memory_pair();
        let session = Arc::new(OpenChannel::new(
            ChannelIdentifier::default_channel("alice"),
            ConnectorChannel::new(Box::new(agent_end.sink), Box::new(agent_end.source)),
        ));
        session.add_handler(Arc::new(handler()));
        let shutdown = tokio_util::sync::CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&session).run(shutdown.clone()));

        let relay = ConnectorChannel::new(Box::new(relay_end.sink), Box::new(relay_end.source));
        relay
            .send(&CloudMessage::new(CloudMessageType::Ping).with_correlation_id("p1"))
            .await
            .expect("send");
        match relay.receive().await.expect("receive") {
            ReceiveResult::Message(reply) => {
                assert_eq!(reply.message_type, CloudMessageType::Response);
                assert_eq!(reply.correlation_id.as_deref(), Some("p1"));
            }
            ReceiveResult::Close => panic!("agent closed the channel"),
        }

        shutdown.cancel();
        runner.await.expect("runner");
    }
}
