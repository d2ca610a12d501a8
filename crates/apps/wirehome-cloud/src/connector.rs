use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use wirehome_cloud_channel::{
    ChannelError, ChannelStatisticsSnapshot, ConnectorChannel, FrameSink, FrameSource,
    InvokeError, OpenChannel, ReceiveResult,
};
use wirehome_cloud_protocol::{
    AuthorizeContent, ChannelIdentifier, CloudMessage, CloudMessageType, WireError,
};

use crate::auth::{AuthError, AuthorizationService};

/// Why a device connection ended before a session was established.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no authorize message within {0:?}")]
    Timeout(Duration),

    #[error("connection closed during handshake")]
    Closed,

    #[error("expected authorize message, got {0}")]
    UnexpectedMessage(CloudMessageType),

    #[error("unreadable authorize content: {0}")]
    Content(#[from] WireError),

    #[error("authorization failed: {0}")]
    Unauthorized(#[from] AuthError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Registry-wide numbers for the statistics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatistics {
    pub connected_channels: usize,
    pub channels: Vec<String>,
}

/// Accepts device connections and routes relay-side requests to them.
///
/// Holds at most one live session per [`ChannelIdentifier`]; a reconnecting
/// device replaces its previous session.
pub struct DeviceConnectorService {
    authorization: Arc<AuthorizationService>,
    handshake_timeout: Duration,
    sessions: Mutex<HashMap<ChannelIdentifier, Arc<OpenChannel>>>,
}

impl DeviceConnectorService {
    pub fn new(authorization: Arc<AuthorizationService>, handshake_timeout: Duration) -> Self {
        Self { authorization, handshake_timeout, sessions: Mutex::new(HashMap::new()) }
    }

    pub fn authorization(&self) -> &AuthorizationService {
        &self.authorization
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ChannelIdentifier, Arc<OpenChannel>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session`, closing any session it supersedes.
    pub fn register(&self, session: Arc<OpenChannel>) {
        let identifier = session.identifier().clone();
        let previous = self.sessions().insert(identifier.clone(), Arc::clone(&session));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &session) {
                log::info!("connector({identifier}): replacing existing session");
                previous.close();
            }
        }
    }

    /// Unregister whatever session serves `identifier`. The session itself
    /// keeps running until its owner closes it.
    pub fn remove(&self, identifier: &ChannelIdentifier) -> Option<Arc<OpenChannel>> {
        self.sessions().remove(identifier)
    }

    /// Remove `session` only if it is still the registered one.
    fn remove_if_current(&self, session: &Arc<OpenChannel>) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(session.identifier()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.identifier());
                true
            }
            _ => false,
        }
    }

    pub fn session(&self, identifier: &ChannelIdentifier) -> Option<Arc<OpenChannel>> {
        self.sessions().get(identifier).cloned()
    }

    /// Send a request to the device behind `identifier` and await its reply.
    pub async fn invoke(
        &self,
        identifier: &ChannelIdentifier,
        message: CloudMessage,
        cancel: &CancellationToken,
    ) -> Result<CloudMessage, InvokeError> {
        let session =
            self.session(identifier).ok_or_else(|| InvokeError::NotConnected(identifier.clone()))?;
        session.send_request(message, cancel).await
    }

    /// Run one device connection: handshake, register, serve until it ends.
    pub async fn accept_connection(
        &self,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        shutdown: CancellationToken,
    ) -> Result<(), HandshakeError> {
        let channel = ConnectorChannel::new(sink, source);
        let identifier = match self.handshake(&channel).await {
            Ok(identifier) => identifier,
            Err(err) => {
                channel.close().await;
                return Err(err);
            }
        };

        let session = Arc::new(OpenChannel::new(identifier.clone(), channel));
        self.register(Arc::clone(&session));
        log::info!("connector({identifier}): device connected");

        Arc::clone(&session).run(shutdown).await;

        self.remove_if_current(&session);
        log::info!("connector({identifier}): device disconnected");
        Ok(())
    }

    async fn handshake(&self, channel: &ConnectorChannel) -> Result<ChannelIdentifier, HandshakeError> {
        let received = tokio::time::timeout(self.handshake_timeout, channel.receive())
            .await
            .map_err(|_| HandshakeError::Timeout(self.handshake_timeout))??;
        let message = match received {
            ReceiveResult::Message(message) => message,
            ReceiveResult::Close => return Err(HandshakeError::Closed),
        };
        if message.message_type != CloudMessageType::Authorize {
            return Err(HandshakeError::UnexpectedMessage(message.message_type));
        }

        let content: AuthorizeContent = message.content()?;
        Ok(self.authorization.authorize_handshake(&content).await?)
    }

    pub fn statistics(&self) -> ConnectorStatistics {
        let sessions = self.sessions();
        let mut channels: Vec<String> = sessions.keys().map(ToString::to_string).collect();
        channels.sort();
        ConnectorStatistics { connected_channels: sessions.len(), channels }
    }

    pub fn channel_statistics(
        &self,
        identifier: &ChannelIdentifier,
    ) -> Option<ChannelStatisticsSnapshot> {
        self.session(identifier).map(|session| session.statistics())
    }

    pub fn reset_channel_statistics(&self, identifier: &ChannelIdentifier) -> bool {
        match self.session(identifier) {
            Some(session) => {
                session.reset_statistics();
                true
            }
            None => false,
        }
    }

    /// Close every session, e.g. on relay shutdown.
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.sessions().drain().map(|(_, session)| session).collect();
        for session in sessions {
            session.close();
        }
    }
}

impl std::fmt::Debug for DeviceConnectorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnectorService")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("sessions", &self.sessions().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::test_hash;
    use crate::auth::repository::{ChannelRecord, IdentityRecord, MemoryIdentityRepository};
    use crate::auth::token::SessionTokens;
    use wirehome_cloud_channel::memory_pair;

    fn connector(timeout: Duration) -> Arc<DeviceConnectorService> {
        let repository = Arc::new(MemoryIdentityRepository::new());
        let mut record =
            IdentityRecord { password_hash: test_hash("pw"), ..Default::default() };
        record.channels.insert("default".into(), ChannelRecord::default());
        repository.insert("alice", record);
        let authorization = Arc::new(AuthorizationService::new(
            repository,
            SessionTokens::ephemeral(Duration::from_secs(60)),
        ));
        Arc::new(DeviceConnectorService::new(authorization, timeout))
    }

    fn detached_session(identifier: ChannelIdentifier) -> (Arc<OpenChannel>, ConnectorChannel) {
        let (left, right) = memory_pair();
        let session = Arc::new(OpenChannel::new(
            identifier,
            ConnectorChannel::new(Box::new(left.sink), Box::new(left.source)),
        ));
        (session, ConnectorChannel::new(Box::new(right.sink), Box::new(right.source)))
    }

    #[tokio::test]
    async fn invoke_without_session_is_not_connected() {
        let connector = connector(Duration::from_secs(1));
        let target = ChannelIdentifier::default_channel("alice");
        let result = connector
            .invoke(&target, CloudMessage::new(CloudMessageType::Ping), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(InvokeError::NotConnected(id)) if id == target));
    }

    #[tokio::test]
    async fn newer_session_replaces_and_closes_older() {
        let connector = connector(Duration::from_secs(1));
        let id = ChannelIdentifier::default_channel("alice");
        let (first, first_peer) = detached_session(id.clone());
        let (second, second_peer) = detached_session(id.clone());
        connector.register(Arc::clone(&first));

        let stale = {
            let connector = Arc::clone(&connector);
            let id = id.clone();
            tokio::spawn(async move {
                connector
                    .invoke(&id, CloudMessage::new(CloudMessageType::Ping), &CancellationToken::new())
                    .await
            })
        };
        // The request is pending on the first session once its peer sees it.
        assert!(matches!(first_peer.receive().await.expect("receive"), ReceiveResult::Message(_)));
        assert_eq!(first.pending_count(), 1);

        connector.register(Arc::clone(&second));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&connector.session(&id).expect("registered"), &second));
        let stale = tokio::time::timeout(Duration::from_secs(5), stale)
            .await
            .expect("stale request resolves")
            .expect("join");
        assert!(matches!(stale, Err(InvokeError::Disconnected)));

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&second).run(shutdown.clone()));
        let responder = tokio::spawn(async move {
            let request = match second_peer.receive().await.expect("receive") {
                ReceiveResult::Message(request) => request,
                ReceiveResult::Close => panic!("second session closed"),
            };
            let reply = CloudMessage::reply_to(&request, CloudMessageType::Response).with_payload(vec![2]);
            second_peer.send(&reply).await.expect("reply");
        });
        let reply = connector
            .invoke(&id, CloudMessage::new(CloudMessageType::Ping), &CancellationToken::new())
            .await
            .expect("routed to the newer session");
        assert_eq!(reply.payload, vec![2]);
        responder.await.expect("responder");

        // Teardown of the superseded session must not evict its successor.
        assert!(!connector.remove_if_current(&first));
        assert!(connector.session(&id).is_some());
        assert!(connector.remove_if_current(&second));
        assert!(connector.session(&id).is_none());

        shutdown.cancel();
        runner.await.expect("run returns");
    }

    #[tokio::test]
    async fn removed_channel_is_no_longer_invokable() {
        let connector = connector(Duration::from_secs(1));
        let id = ChannelIdentifier::default_channel("alice");
        let (session, _peer) = detached_session(id.clone());
        connector.register(Arc::clone(&session));

        let removed = connector.remove(&id).expect("was registered");
        assert!(Arc::ptr_eq(&removed, &session));
        assert!(connector.remove(&id).is_none());
        let result = connector
            .invoke(&id, CloudMessage::new(CloudMessageType::Ping), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(InvokeError::NotConnected(_))));
        assert_eq!(connector.statistics().connected_channels, 0);
    }

    #[tokio::test]
    async fn statistics_list_connected_channels() {
        let connector = connector(Duration::from_secs(1));
        let (a, _pa) = detached_session(ChannelIdentifier::new("bob", "b"));
        let (b, _pb) = detached_session(ChannelIdentifier::new("alice", "a"));
        connector.register(a);
        connector.register(b);

        let stats = connector.statistics();
        assert_eq!(stats.connected_channels, 2);
        assert_eq!(stats.channels, vec!["alice/a".to_string(), "bob/b".to_string()]);
        assert!(connector.channel_statistics(&ChannelIdentifier::new("alice", "a")).is_some());
        assert!(connector.reset_channel_statistics(&ChannelIdentifier::new("bob", "b")));
        assert!(!connector.reset_channel_statistics(&ChannelIdentifier::new("carol", "c")));
    }

    #[tokio::test]
    async fn handshake_times_out_without_authorize() {
        let connector = connector(Duration::from_millis(50));
        let (relay_end, _device_end) = memory_pair();
        let result = connector
            .accept_connection(
                Box::new(relay_end.sink),
                Box::new(relay_end.source),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
        assert_eq!(connector.statistics().connected_channels, 0);
    }

    #[tokio::test]
    async fn first_message_must_be_authorize() {
        let connector = connector(Duration::from_secs(1));
        let (relay_end, device_end) = memory_pair();
        let device = ConnectorChannel::new(Box::new(device_end.sink), Box::new(device_end.source));
        device.send(&CloudMessage::new(CloudMessageType::Ping)).await.expect("send");

        let result = connector
            .accept_connection(
                Box::new(relay_end.sink),
                Box::new(relay_end.source),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(HandshakeError::UnexpectedMessage(CloudMessageType::Ping))));
        assert_eq!(device.receive().await.expect("close"), ReceiveResult::Close);
    }

    #[tokio::test]
    async fn wrong_password_creates_no_session() {
        let connector = connector(Duration::from_secs(1));
        let (relay_end, device_end) = memory_pair();
        let device = ConnectorChannel::new(Box::new(device_end.sink), Box::new(device_end.source));
        let content = AuthorizeContent {
            identity_uid: "alice".into(),
            password: "nope".into(),
            channel_uid: "default".into(),
        };
        device
            .send(&CloudMessage::with_content(CloudMessageType::Authorize, &content).expect("content"))
            .await
            .expect("send");

        let result = connector
            .accept_connection(
                Box::new(relay_end.sink),
                Box::new(relay_end.source),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(HandshakeError::Unauthorized(AuthError::InvalidPassword(_)))));
        assert!(connector.session(&ChannelIdentifier::default_channel("alice")).is_none());
    }
}
