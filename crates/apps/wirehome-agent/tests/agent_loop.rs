use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use wirehome_agent::handlers::{StatusRawHandler, STATUS_RAW_TYPE};
use wirehome_agent::{
    AgentConfig, AgentError, AgentRequestHandler, AgentState, CloudAgent, Connector,
    HandlerError, LocalHttpHandler, RawHandlerRegistry, Transport, WebSocketConnector,
};
use wirehome_cloud::auth::password::{hash_password_with, HashParams};
use wirehome_cloud::auth::repository::{
    ChannelRecord, FileIdentityRepository, IdentityRecord, IdentityRepository,
};
use wirehome_cloud::config::RelayConfig;
use wirehome_cloud_channel::{memory_pair, ConnectorChannel, MemoryEndpoint, ReceiveResult};
use wirehome_cloud_protocol::{
    AuthorizeContent, ChannelIdentifier, CloudMessage, CloudMessageType, HttpRequestContent,
    HttpResponseContent,
};

/// Hands the relay side of every new in-memory connection to the test.
struct MemoryConnector {
    relay_ends: mpsc::UnboundedSender<MemoryEndpoint>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> io::Result<Transport> {
        let (agent_end, relay_end) = memory_pair();
        self.relay_ends
            .send(relay_end)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "test relay gone"))?;
        Ok((Box::new(agent_end.sink), Box::new(agent_end.source)))
    }
}

struct StaticHttp;

#[async_trait]
impl LocalHttpHandler for StaticHttp {
    async fn invoke(&self, request: HttpRequestContent) -> Result<HttpResponseContent, HandlerError> {
        let mut response = HttpResponseContent::new(200);
        response.headers.insert("Content-Type".into(), "application/json".into());
        response.content = format!(r#"{{"uri":"{}"}}"#, request.uri).into_bytes();
        Ok(response)
    }
}

fn handler() -> AgentRequestHandler {
    let raw = Arc::new(RawHandlerRegistry::new());
    raw.register(STATUS_RAW_TYPE, Arc::new(StatusRawHandler));
    AgentRequestHandler::new(Arc::new(StaticHttp), raw)
}

fn config(relay_url: &str) -> AgentConfig {
    AgentConfig {
        relay_url: relay_url.into(),
        identity_uid: "alice".into(),
        password: "alice-pw".into(),
        ..Default::default()
    }
}

async fn receive(channel: &ConnectorChannel) -> CloudMessage {
    match tokio::time::timeout(Duration::from_secs(5), channel.receive())
        .await
        .expect("receive timed out")
        .expect("receive")
    {
        ReceiveResult::Message(message) => message,
        ReceiveResult::Close => panic!("agent closed the connection"),
    }
}

async fn expect_authorize(ends: &Mutex<mpsc::UnboundedReceiver<MemoryEndpoint>>) -> ConnectorChannel {
    let relay_end = ends.lock().await.recv().await.expect("agent connected");
    let relay = ConnectorChannel::new(Box::new(relay_end.sink), Box::new(relay_end.source));
    let authorize = receive(&relay).await;
    assert_eq!(authorize.message_type, CloudMessageType::Authorize);
    let content: AuthorizeContent = authorize.content().expect("authorize content");
    assert_eq!(content.identity_uid, "alice");
    assert_eq!(content.password, "alice-pw");
    assert_eq!(content.channel_uid, "default");
    relay
}

#[tokio::test]
async fn agent_serves_requests_and_reconnects_after_drop() {
    let (tx, rx) = mpsc::unbounded_channel();
    let ends = Mutex::new(rx);
    let agent = Arc::new(
        CloudAgent::new(config("memory://relay"), Arc::new(MemoryConnector { relay_ends: tx }), handler())
            .with_reconnect_delay(Duration::from_millis(20)),
    );
    let mut states = agent.subscribe();
    let shutdown = CancellationToken::new();
    let runner = {
        let agent = Arc::clone(&agent);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    let relay = expect_authorize(&ends).await;
    states.wait_for(|state| *state == AgentState::Connected).await.expect("connected");

    let request = CloudMessage::new(CloudMessageType::Raw)
        .with_payload(format!(r#"{{"type":"{STATUS_RAW_TYPE}"}}"#).into_bytes())
        .with_correlation_id("raw-1");
    relay.send(&request).await.expect("send raw");
    let reply = receive(&relay).await;
    assert_eq!(reply.message_type, CloudMessageType::Response);
    assert_eq!(reply.correlation_id.as_deref(), Some("raw-1"));
    let body: serde_json::Value = serde_json::from_slice(&reply.payload).expect("json");
    assert_eq!(body["agent"], "wirehome-agent");

    relay.close().await;
    states.wait_for(|state| *state != AgentState::Connected).await.expect("dropped");

    let relay = expect_authorize(&ends).await;
    relay
        .send(&CloudMessage::new(CloudMessageType::Ping).with_correlation_id("ping-1"))
        .await
        .expect("send ping");
    let pong = receive(&relay).await;
    assert_eq!(pong.message_type, CloudMessageType::Response);
    assert_eq!(pong.correlation_id.as_deref(), Some("ping-1"));

    shutdown.cancel();
    runner.await.expect("join").expect("run");
    assert_eq!(agent.state(), AgentState::Disconnected);
}

#[tokio::test]
async fn unconfigured_agent_refuses_to_start() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut incomplete = config("memory://relay");
    incomplete.password.clear();
    let agent = CloudAgent::new(incomplete, Arc::new(MemoryConnector { relay_ends: tx }), handler());
    let err = agent.run(CancellationToken::new()).await.expect_err("missing password");
    assert!(matches!(err, AgentError::NotConfigured("password")));
}

#[tokio::test]
async fn disabled_agent_returns_immediately() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut disabled = config("memory://relay");
    disabled.enabled = false;
    let agent = CloudAgent::new(disabled, Arc::new(MemoryConnector { relay_ends: tx }), handler());
    agent.run(CancellationToken::new()).await.expect("run");
    assert!(rx.try_recv().is_err());
}

fn provision(dir: &Path) {
    let params = HashParams::new(1024, 1, 1, None).expect("params");
    let mut alice = IdentityRecord {
        password_hash: hash_password_with("alice-pw", params).expect("hash"),
        ..Default::default()
    };
    alice.channels.insert("default".into(), ChannelRecord { is_default: true, ..Default::default() });
    FileIdentityRepository::new(dir).store("alice", &alice).expect("store alice");
}

#[tokio::test]
async fn http_request_crosses_real_relay_over_websocket() {
    let dir = tempfile::tempdir().expect("tempdir");
    provision(dir.path());
    let relay_config = RelayConfig {
        identities_dir: dir.path().to_path_buf(),
        session_secret: Some("e2e".into()),
        ..Default::default()
    };
    let relay_shutdown = CancellationToken::new();
    let state = wirehome_cloud::build_state(&relay_config, relay_shutdown.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(wirehome_cloud::server::serve(listener, state.clone()));

    let url = format!("ws://{addr}/Connector");
    let agent = Arc::new(CloudAgent::new(config(&url), Arc::new(WebSocketConnector::new(url.clone())), handler()));
    let agent_shutdown = CancellationToken::new();
    let runner = {
        let agent = Arc::clone(&agent);
        let shutdown = agent_shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    let id = ChannelIdentifier::default_channel("alice");
    let mut registered = false;
    for _ in 0..500 {
        if state.connector.session(&id).is_some() {
            registered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registered, "relay never registered the agent");

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/api/lamps?room=kitchen"))
        .basic_auth("alice", Some("alice-pw"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/json")
    );
    assert_eq!(response.text().await.expect("body"), r#"{"uri":"/api/lamps?room=kitchen"}"#);

    agent_shutdown.cancel();
    runner.await.expect("join").expect("run");
    relay_shutdown.cancel();
    server.await.expect("join").expect("serve");
}
