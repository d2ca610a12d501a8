//! Connection lifecycle of the device agent.
//!
//! The agent keeps one session to the relay alive: connect, authorize, serve
//! relay requests until the socket drops, wait, repeat. The current phase is
//! published on a [`watch`] channel so embedders can surface it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wirehome_cloud_channel::{ChannelError, ConnectorChannel, OpenChannel};
use wirehome_cloud_protocol::{
    AuthorizeContent, ChannelIdentifier, CloudMessage, CloudMessageType, WireError,
};

use crate::config::AgentConfig;
use crate::connect::Connector;
use crate::handlers::AgentRequestHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Authorizing,
    Connected,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Disconnected => "disconnected",
            AgentState::Connecting => "connecting",
            AgentState::Authorizing => "authorizing",
            AgentState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent is not configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("connecting to relay timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connecting to relay failed: {0}")]
    Connect(std::io::Error),

    #[error("encoding authorize message failed: {0}")]
    Wire(#[from] WireError),

    #[error("sending authorize message failed: {0}")]
    Channel(#[from] ChannelError),
}

pub struct CloudAgent {
    config: AgentConfig,
    connector: Arc<dyn Connector>,
    handler: Arc<AgentRequestHandler>,
    reconnect_delay: Duration,
    state: watch::Sender<AgentState>,
}

impl CloudAgent {
    pub fn new(
        config: AgentConfig,
        connector: Arc<dyn Connector>,
        handler: AgentRequestHandler,
    ) -> Self {
        let reconnect_delay = config.reconnect_delay();
        let (state, _) = watch::channel(AgentState::Disconnected);
        Self { config, connector, handler: Arc::new(handler), reconnect_delay, state }
    }

    /// Override the configured wait between connection attempts. A zero
    /// delay is ignored.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.reconnect_delay = delay;
        }
        self
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn channel(&self) -> ChannelIdentifier {
        ChannelIdentifier::new(self.config.identity_uid.to_lowercase(), &self.config.channel_uid)
    }

    fn set_state(&self, state: AgentState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("agent({}): {current} -> {state}", self.channel());
            *current = state;
            true
        });
    }

    /// Keep a relay session alive until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        if !self.config.enabled {
            log::info!("agent: disabled by configuration");
            return Ok(());
        }
        if let Some(setting) = self.config.missing_setting() {
            return Err(AgentError::NotConfigured(setting));
        }

        while !shutdown.is_cancelled() {
            match self.run_session(&shutdown).await {
                Ok(()) => log::info!("agent({}): session ended", self.channel()),
                Err(err) => log::warn!("agent({}): {err}", self.channel()),
            }
            self.set_state(AgentState::Disconnected);
            if shutdown.is_cancelled() {
                break;
            }

            log::info!("agent({}): reconnecting in {:?}", self.channel(), self.reconnect_delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        self.set_state(AgentState::Disconnected);
        Ok(())
    }

    /// One connection attempt, returning once the session is over.
    async fn run_session(&self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        self.set_state(AgentState::Connecting);
        let timeout = self.config.connect_timeout();
        let (sink, source) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            result = tokio::time::timeout(timeout, self.connector.connect()) => {
                result.map_err(|_| AgentError::ConnectTimeout(timeout))?.map_err(AgentError::Connect)?
            }
        };
        let channel = ConnectorChannel::new(sink, source);

        self.set_state(AgentState::Authorizing);
        let authorize = AuthorizeContent {
            identity_uid: self.config.identity_uid.clone(),
            password: self.config.password.clone(),
            channel_uid: self.config.channel_uid.clone(),
        };
        let message = CloudMessage::with_content(CloudMessageType::Authorize, &authorize)?;
        if let Err(err) = channel.send(&message).await {
            channel.close().await;
            return Err(err.into());
        }

        // The relay does not acknowledge authorization; a rejected device is
        // simply disconnected, which ends the session below.
        let session = Arc::new(OpenChannel::new(self.channel(), channel));
        session.add_handler(self.handler.clone());
        self.set_state(AgentState::Connected);
        log::info!("agent({}): connected to {}", self.channel(), self.config.relay_url);

        let heartbeat = self
            .config
            .heartbeat_interval()
            .map(|interval| tokio::spawn(heartbeat(Arc::clone(&session), interval)));
        Arc::clone(&session).run(shutdown.child_token()).await;
        if let Some(task) = heartbeat {
            task.abort();
        }
        Ok(())
    }
}

/// Uncorrelated pings keep idle NAT mappings open; the relay does not answer.
async fn heartbeat(session: Arc<OpenChannel>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = session.closed() => return,
            _ = ticker.tick() => {}
        }
        if let Err(err) = session.send(&CloudMessage::new(CloudMessageType::Ping)).await {
            log::debug!("agent({}): heartbeat failed: {err}", session.identifier());
            return;
        }
    }
}
