use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Issues and checks `wirehome-session` cookie values.
///
/// A token is `base64url(identity;expiry).hex(hmac)`; the relay keeps no
/// server-side session state.
pub struct SessionTokens {
    secret: Zeroizing<Vec<u8>>,
    ttl: Duration,
}

impl SessionTokens {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self { secret: Zeroizing::new(secret.into()), ttl }
    }

    /// Tokens signed with a random per-process key.
    pub fn ephemeral(ttl: Duration) -> Self {
        let mut secret = vec![0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::new(secret, ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self) -> Option<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).ok()
    }

    pub fn issue(&self, identity_uid: &str) -> Option<String> {
        self.issue_at(identity_uid, unix_now())
    }

    fn issue_at(&self, identity_uid: &str, now: u64) -> Option<String> {
        let payload = format!("{identity_uid};{}", now.saturating_add(self.ttl.as_secs()));
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let tag = mac.finalize().into_bytes();
        Some(format!("{}.{}", URL_SAFE_NO_PAD.encode(payload), hex::encode(tag)))
    }

    /// Identity uid of a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Option<String> {
        self.verify_at(token, unix_now())
    }

    fn verify_at(&self, token: &str, now: u64) -> Option<String> {
        let (encoded, tag) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        let tag = hex::decode(tag).ok()?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&tag).ok()?;

        let payload = String::from_utf8(payload).ok()?;
        let (identity_uid, expiry) = payload.rsplit_once(';')?;
        let expiry: u64 = expiry.parse().ok()?;
        (now < expiry && !identity_uid.is_empty()).then(|| identity_uid.to_string())
    }
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> SessionTokens {
        SessionTokens::new(b"test-secret".to_vec(), Duration::from_secs(60))
    }

    #[test]
    fn issued_token_verifies_until_expiry() {
        let tokens = tokens();
        let token = tokens.issue_at("alice@example.com", 1_000).expect("issue");
        assert_eq!(tokens.verify_at(&token, 1_000).as_deref(), Some("alice@example.com"));
        assert_eq!(tokens.verify_at(&token, 1_059).as_deref(), Some("alice@example.com"));
        assert_eq!(tokens.verify_at(&token, 1_060), None);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let tokens = tokens();
        let token = tokens.issue_at("alice", 1_000).expect("issue");
        let (_, tag) = token.split_once('.').expect("tag");
        let forged = format!("{}.{tag}", URL_SAFE_NO_PAD.encode("mallory;999999"));
        assert_eq!(tokens.verify_at(&forged, 1_000), None);
        assert_eq!(tokens.verify_at("garbage", 1_000), None);
    }

    #[test]
    fn token_from_other_key_is_rejected() {
        let token = SessionTokens::ephemeral(Duration::from_secs(60)).issue("alice").expect("issue");
        assert_eq!(tokens().verify(&token), None);
    }
}
