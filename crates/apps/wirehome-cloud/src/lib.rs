//! Wirehome cloud relay.
//!
//! Devices connect to `/Connector` and authenticate with an `authorize`
//! message; afterwards any HTTP request to the relay that carries the
//! device owner's credentials is tunneled to the device and answered with
//! the device's response.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod headers;
pub mod server;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use auth::repository::FileIdentityRepository;
use auth::token::SessionTokens;
use auth::AuthorizationService;
use config::RelayConfig;
use connector::DeviceConnectorService;
use server::AppState;

/// Wire up the relay services described by `config`.
pub fn build_state(config: &RelayConfig, shutdown: CancellationToken) -> AppState {
    let repository = Arc::new(FileIdentityRepository::new(&config.identities_dir));
    let tokens = match &config.session_secret {
        Some(secret) => SessionTokens::new(secret.as_bytes().to_vec(), config.session_ttl()),
        None => {
            log::warn!("relay: no session_secret configured, sessions end on restart");
            SessionTokens::ephemeral(config.session_ttl())
        }
    };
    let authorization = Arc::new(AuthorizationService::new(repository, tokens));
    let connector =
        Arc::new(DeviceConnectorService::new(authorization, config.handshake_timeout()));
    AppState { connector, shutdown, max_request_body_bytes: config.max_request_body_bytes }
}
