//! Identity checks for devices (handshake) and callers (HTTP).

pub mod password;
pub mod repository;
pub mod token;

use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use wirehome_cloud_protocol::{
    AuthorizeContent, ChannelIdentifier, CHANNEL_UID_COOKIE, CHANNEL_UID_HEADER, SESSION_COOKIE,
};
use zeroize::Zeroizing;

use crate::headers::{cookie_value, header_value};
use repository::{IdentityRecord, IdentityRepository};
use token::SessionTokens;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials supplied")]
    MissingCredentials,

    #[error("malformed credentials")]
    MalformedCredentials,

    #[error("session cookie is invalid or expired")]
    InvalidSession,

    #[error("unknown identity '{0}'")]
    UnknownIdentity(String),

    #[error("identity '{0}' is locked")]
    Locked(String),

    #[error("wrong password for identity '{0}'")]
    InvalidPassword(String),

    #[error("channel {0} does not exist")]
    UnknownChannel(ChannelIdentifier),

    #[error("invalid channel selector '{0}'")]
    InvalidSelector(String),

    #[error("identity '{identity_uid}' may not access channel {channel}")]
    Forbidden { identity_uid: String, channel: ChannelIdentifier },

    #[error("identity store error: {0}")]
    Repository(#[from] io::Error),
}

impl AuthError {
    /// Authenticated, but not allowed to address the requested channel.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Repository(_))
    }
}

/// An authenticated HTTP caller and the channel it addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub identity_uid: String,
    pub is_admin: bool,
    pub channel: ChannelIdentifier,
    /// Set when the caller presented a password; returned as session cookie.
    pub session_token: Option<String>,
}

pub struct AuthorizationService {
    repository: Arc<dyn IdentityRepository>,
    tokens: SessionTokens,
}

impl AuthorizationService {
    pub fn new(repository: Arc<dyn IdentityRepository>, tokens: SessionTokens) -> Self {
        Self { repository, tokens }
    }

    pub fn session_tokens(&self) -> &SessionTokens {
        &self.tokens
    }

    /// Check the credentials of a connecting device.
    pub async fn authorize_handshake(
        &self,
        content: &AuthorizeContent,
    ) -> Result<ChannelIdentifier, AuthError> {
        let identity_uid = content.identity_uid.to_lowercase();
        let record = self.check_password(&identity_uid, &content.password).await?;
        let channel_uid = match content.channel_uid.as_str() {
            "" => record.default_channel_uid(),
            channel_uid => channel_uid,
        };
        let channel = ChannelIdentifier::new(identity_uid, channel_uid);
        if record.channel(channel_uid).is_none() {
            return Err(AuthError::UnknownChannel(channel));
        }
        Ok(channel)
    }

    /// Basic credentials if present, the session cookie otherwise.
    pub async fn authorize_request(
        &self,
        headers: &[(String, String)],
    ) -> Result<AuthorizationContext, AuthError> {
        if header_value(headers, "authorization").is_some() {
            self.authorize_basic(headers).await
        } else {
            self.authorize_session(headers)
        }
    }

    pub async fn authorize_basic(
        &self,
        headers: &[(String, String)],
    ) -> Result<AuthorizationContext, AuthError> {
        let value = header_value(headers, "authorization").ok_or(AuthError::MissingCredentials)?;
        let (scheme, encoded) = value.trim().split_once(' ').ok_or(AuthError::MalformedCredentials)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::MalformedCredentials);
        }

        let decoded = Zeroizing::new(
            STANDARD.decode(encoded.trim()).map_err(|_| AuthError::MalformedCredentials)?,
        );
        let credentials =
            std::str::from_utf8(&decoded).map_err(|_| AuthError::MalformedCredentials)?;
        let (identity_uid, password) =
            credentials.split_once(':').ok_or(AuthError::MalformedCredentials)?;

        let identity_uid = identity_uid.to_lowercase();
        let record = self.check_password(&identity_uid, password).await?;
        let channel = self.resolve_channel(&identity_uid, &record, channel_selector(headers))?;
        let session_token = self.tokens.issue(&identity_uid);
        Ok(AuthorizationContext { identity_uid, is_admin: record.is_admin, channel, session_token })
    }

    pub fn authorize_session(
        &self,
        headers: &[(String, String)],
    ) -> Result<AuthorizationContext, AuthError> {
        let token = cookie_value(headers, SESSION_COOKIE).ok_or(AuthError::MissingCredentials)?;
        let identity_uid = self.tokens.verify(token).ok_or(AuthError::InvalidSession)?;
        let record = self.load_identity(&identity_uid)?;
        let channel = self.resolve_channel(&identity_uid, &record, channel_selector(headers))?;
        Ok(AuthorizationContext {
            identity_uid,
            is_admin: record.is_admin,
            channel,
            session_token: None,
        })
    }

    pub async fn set_password(&self, identity_uid: &str, new_password: &str) -> Result<(), AuthError> {
        let new_password = Zeroizing::new(new_password.to_string());
        let hash = tokio::task::spawn_blocking(move || password::hash_password(&new_password))
            .await
            .map_err(io::Error::other)?
            .map_err(|err| io::Error::other(err.to_string()))?;
        self.repository.set_password_hash(&identity_uid.to_lowercase(), hash)?;
        Ok(())
    }

    fn load_identity(&self, identity_uid: &str) -> Result<IdentityRecord, AuthError> {
        let record = self
            .repository
            .load(identity_uid)?
            .ok_or_else(|| AuthError::UnknownIdentity(identity_uid.to_string()))?;
        if record.is_locked {
            return Err(AuthError::Locked(identity_uid.to_string()));
        }
        Ok(record)
    }

    /// Argon2 verification runs on the blocking pool so session loops on
    /// the calling worker keep being polled.
    async fn check_password(
        &self,
        identity_uid: &str,
        password: &str,
    ) -> Result<IdentityRecord, AuthError> {
        let record = self.load_identity(identity_uid)?;
        let candidate = Zeroizing::new(password.to_string());
        let stored_hash = record.password_hash.clone();
        let verified =
            tokio::task::spawn_blocking(move || password::verify_password(&candidate, &stored_hash))
                .await
                .map_err(io::Error::other)?;
        if !verified {
            return Err(AuthError::InvalidPassword(identity_uid.to_string()));
        }
        Ok(record)
    }

    /// Map a selector to a channel: nothing selects the default channel, a
    /// bare uid selects one of the caller's own channels and `identity/channel`
    /// addresses another identity's channel.
    fn resolve_channel(
        &self,
        identity_uid: &str,
        record: &IdentityRecord,
        selector: Option<&str>,
    ) -> Result<ChannelIdentifier, AuthError> {
        let selector = selector.map(str::trim).filter(|value| !value.is_empty());
        let Some(selector) = selector else {
            return own_channel(identity_uid, record, record.default_channel_uid());
        };
        if !selector.contains('/') {
            return own_channel(identity_uid, record, selector);
        }

        let target = ChannelIdentifier::parse(selector)
            .ok_or_else(|| AuthError::InvalidSelector(selector.to_string()))?;
        let target = ChannelIdentifier::new(target.identity_uid.to_lowercase(), target.channel_uid);
        if target.identity_uid == identity_uid {
            return own_channel(identity_uid, record, &target.channel_uid);
        }

        let target_record = self
            .repository
            .load(&target.identity_uid)?
            .ok_or_else(|| AuthError::UnknownChannel(target.clone()))?;
        let Some(channel) = target_record.channel(&target.channel_uid) else {
            return Err(AuthError::UnknownChannel(target));
        };
        if record.is_admin || channel.allowed_identities.contains(identity_uid) {
            Ok(target)
        } else {
            Err(AuthError::Forbidden { identity_uid: identity_uid.to_string(), channel: target })
        }
    }
}

impl std::fmt::Debug for AuthorizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationService").field("tokens", &self.tokens).finish_non_exhaustive()
    }
}

fn own_channel(
    identity_uid: &str,
    record: &IdentityRecord,
    channel_uid: &str,
) -> Result<ChannelIdentifier, AuthError> {
    let channel = ChannelIdentifier::new(identity_uid, channel_uid);
    if record.channel(channel_uid).is_none() {
        return Err(AuthError::UnknownChannel(channel));
    }
    Ok(channel)
}

fn channel_selector(headers: &[(String, String)]) -> Option<&str> {
    header_value(headers, CHANNEL_UID_HEADER).or_else(|| cookie_value(headers, CHANNEL_UID_COOKIE))
}
