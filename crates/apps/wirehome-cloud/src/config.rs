use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Root of the identity store, one `<uid>/configuration.json` per identity.
    pub identities_dir: PathBuf,
    pub handshake_timeout_secs: u64,
    /// Key for signing session cookies. A random key is used when unset, so
    /// sessions do not survive a restart.
    pub session_secret: Option<String>,
    pub session_ttl_secs: u64,
    /// Largest request body forwarded through the HTTP bridge.
    pub max_request_body_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            identities_dir: PathBuf::from("identities"),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            session_secret: None,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_request_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
