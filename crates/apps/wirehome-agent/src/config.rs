use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use wirehome_cloud_protocol::DEFAULT_CHANNEL_UID;

const DEFAULT_RECONNECT_DELAY_SECS: u64 = 10;

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    /// WebSocket endpoint of the relay, e.g. `wss://cloud.example.com/Connector`.
    pub relay_url: String,
    pub identity_uid: String,
    pub password: String,
    pub channel_uid: String,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
    /// Base URL of the local HTTP API that tunneled requests are sent to.
    pub local_http_url: String,
    /// Send a keep-alive ping this often while connected.
    pub heartbeat_interval_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relay_url: String::new(),
            identity_uid: String::new(),
            password: String::new(),
            channel_uid: DEFAULT_CHANNEL_UID.to_string(),
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            connect_timeout_secs: 10,
            local_http_url: "http://127.0.0.1:80".to_string(),
            heartbeat_interval_secs: None,
        }
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("enabled", &self.enabled)
            .field("relay_url", &self.relay_url)
            .field("identity_uid", &self.identity_uid)
            .field("password", &"<redacted>")
            .field("channel_uid", &self.channel_uid)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("local_http_url", &self.local_http_url)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .finish()
    }
}

impl AgentConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// A zero delay falls back to the default instead of reconnecting in a
    /// tight loop.
    pub fn reconnect_delay(&self) -> Duration {
        match self.reconnect_delay_secs {
            0 => Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }

    /// Names the first setting that prevents connecting, if any.
    pub fn missing_setting(&self) -> Option<&'static str> {
        if self.relay_url.is_empty() {
            Some("relay_url")
        } else if self.identity_uid.is_empty() {
            Some("identity_uid")
        } else if self.password.is_empty() {
            Some("password")
        } else {
            None
        }
    }
}
