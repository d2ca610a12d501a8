//! HTTP and WebSocket surface of the relay.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wirehome_cloud_channel::{FrameChunk, FrameSink, FrameSource};
use wirehome_cloud_protocol::{ChannelIdentifier, CloudMessage, CloudMessageType, ErrorContent};

use crate::auth::{AuthError, AuthorizationContext};
use crate::bridge::{auth_failure, BridgeError, InboundHttpRequest, OutboundHttpResponse};
use crate::connector::DeviceConnectorService;

#[derive(Clone)]
pub struct AppState {
    pub connector: Arc<DeviceConnectorService>,
    pub shutdown: CancellationToken,
    pub max_request_body_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/Connector", get(connect_device))
        .route("/api/v1/cloud/statistics", get(get_statistics))
        .route(
            "/api/v1/cloud/statistics/{identity_uid}/{channel_uid}",
            get(get_channel_statistics).delete(reset_channel_statistics),
        )
        .route("/api/v1/cloud/ping", post(ping_device))
        .route("/api/v1/cloud/invoke", post(invoke_raw))
        .fallback(forward_http)
        .with_state(state)
}

/// Serve until `state.shutdown` fires, then close every device session.
pub async fn serve(listener: TcpListener, state: AppState) -> io::Result<()> {
    let shutdown = state.shutdown.clone();
    let connector = Arc::clone(&state.connector);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    connector.close_all();
    Ok(())
}

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> io::Result<()> {
        self.0.send(Message::Binary(frame.into())).await.map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        // Errors here mean the socket is already gone.
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
        Ok(())
    }
}

struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_chunk(&mut self) -> io::Result<FrameChunk> {
        loop {
            match self.0.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(FrameChunk::Close),
                Some(Ok(Message::Binary(bytes))) => return Ok(FrameChunk::message(bytes.to_vec())),
                Some(Ok(Message::Text(_))) => return Ok(FrameChunk::Unsupported),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }
}

async fn connect_device(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let result = state
            .connector
            .accept_connection(
                Box::new(WsSink(sink)),
                Box::new(WsSource(stream)),
                state.shutdown.child_token(),
            )
            .await;
        if let Err(err) = result {
            log::warn!("connector: rejected device connection: {err}");
        }
    })
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn into_response(outbound: OutboundHttpResponse) -> Response {
    let mut response = Response::new(Body::from(outbound.body));
    *response.status_mut() = StatusCode::from_u16(outbound.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = response.headers_mut();
    for (name, value) in outbound.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => log::debug!("server: dropping invalid response header '{name}'"),
        }
    }
    response
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AuthorizationContext, Response> {
    state
        .connector
        .authorization()
        .authorize_request(&header_pairs(headers))
        .await
        .map_err(|err| into_response(auth_failure(&err)))
}

fn bridge_failure(err: BridgeError) -> Response {
    into_response(OutboundHttpResponse::text(err.status(), err.to_string()))
}

async fn forward_http(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_request_body_bytes).await {
        Ok(body) => body,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };
    let uri = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/").to_string();
    let inbound = InboundHttpRequest {
        method: parts.method.as_str().to_string(),
        uri,
        headers: header_pairs(&parts.headers),
        body: body.to_vec(),
    };

    // Dropping this future (client gone) abandons the tunneled request.
    let cancel = CancellationToken::new();
    into_response(state.connector.dispatch_http_request(inbound, &cancel).await)
}

async fn get_statistics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let context = match authorize(&state, &headers).await {
        Ok(context) => context,
        Err(response) => return response,
    };
    if !context.is_admin {
        return StatusCode::FORBIDDEN.into_response();
    }
    Json(state.connector.statistics()).into_response()
}

/// Admins may address any channel, others only their own.
async fn authorize_channel(
    state: &AppState,
    headers: &HeaderMap,
    identity_uid: String,
    channel_uid: String,
) -> Result<ChannelIdentifier, Response> {
    let context = authorize(state, headers).await?;
    let target = ChannelIdentifier::new(identity_uid.to_lowercase(), channel_uid);
    if !context.is_admin && target.identity_uid != context.identity_uid {
        let err = AuthError::Forbidden { identity_uid: context.identity_uid, channel: target };
        return Err(into_response(auth_failure(&err)));
    }
    Ok(target)
}

async fn get_channel_statistics(
    State(state): State<AppState>,
    Path((identity_uid, channel_uid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let target = match authorize_channel(&state, &headers, identity_uid, channel_uid).await {
        Ok(target) => target,
        Err(response) => return response,
    };
    match state.connector.channel_statistics(&target) {
        Some(statistics) => Json(statistics).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn reset_channel_statistics(
    State(state): State<AppState>,
    Path((identity_uid, channel_uid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let target = match authorize_channel(&state, &headers, identity_uid, channel_uid).await {
        Ok(target) => target,
        Err(response) => return response,
    };
    if state.connector.reset_channel_statistics(&target) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn ping_device(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let context = match authorize(&state, &headers).await {
        Ok(context) => context,
        Err(response) => return response,
    };

    let started = Instant::now();
    let request = CloudMessage::new(CloudMessageType::Ping);
    match state.connector.invoke(&context.channel, request, &CancellationToken::new()).await {
        Ok(_) => Json(serde_json::json!({
            "channel": context.channel.to_string(),
            "elapsed_ms": started.elapsed().as_millis() as u64,
        }))
        .into_response(),
        Err(err) => bridge_failure(BridgeError::Invoke(err)),
    }
}

async fn invoke_raw(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let context = match authorize(&state, &headers).await {
        Ok(context) => context,
        Err(response) => return response,
    };
    if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return (StatusCode::BAD_REQUEST, "request body must be JSON").into_response();
    }

    let request = CloudMessage::new(CloudMessageType::Raw).with_payload(body.to_vec());
    let reply = match state.connector.invoke(&context.channel, request, &CancellationToken::new()).await {
        Ok(reply) => reply,
        Err(err) => return bridge_failure(BridgeError::Invoke(err)),
    };
    if reply.message_type == CloudMessageType::Error {
        let message = reply
            .content::<ErrorContent>()
            .map(|content| content.message)
            .unwrap_or_else(|_| "unspecified device error".to_string());
        return bridge_failure(BridgeError::Device(message));
    }

    let mut response = Response::new(Body::from(reply.payload));
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
