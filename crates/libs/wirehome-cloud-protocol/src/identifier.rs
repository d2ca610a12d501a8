use std::fmt;

use serde::{Deserialize, Serialize};

/// Channel used when a caller does not select one explicitly.
pub const DEFAULT_CHANNEL_UID: &str = "default";

/// Addresses one device endpoint: an identity may expose several channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelIdentifier {
    pub identity_uid: String,
    pub channel_uid: String,
}

impl ChannelIdentifier {
    pub fn new(identity_uid: impl Into<String>, channel_uid: impl Into<String>) -> Self {
        Self { identity_uid: identity_uid.into(), channel_uid: channel_uid.into() }
    }

    /// Identifier of the identity's [`DEFAULT_CHANNEL_UID`] channel.
    pub fn default_channel(identity_uid: impl Into<String>) -> Self {
        Self::new(identity_uid, DEFAULT_CHANNEL_UID)
    }

    /// Parses the `identity/channel` form produced by `Display`.
    pub fn parse(value: &str) -> Option<Self> {
        let (identity_uid, channel_uid) = value.split_once('/')?;
        if identity_uid.is_empty() || channel_uid.is_empty() || channel_uid.contains('/') {
            return None;
        }
        Some(Self::new(identity_uid, channel_uid))
    }
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity_uid, self.channel_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn equality_is_by_value() {
        let mut map = HashMap::new();
        map.insert(ChannelIdentifier::new("alice", "default"), 1);
        assert_eq!(map.get(&ChannelIdentifier::default_channel("alice")), Some(&1));
        assert_eq!(map.get(&ChannelIdentifier::new("alice", "garage")), None);
    }

    #[test]
    fn display_and_parse_agree() {
        let id = ChannelIdentifier::new("alice@example.com", "garage");
        assert_eq!(id.to_string(), "alice@example.com/garage");
        assert_eq!(ChannelIdentifier::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn parse_rejects_incomplete_selectors() {
        assert!(ChannelIdentifier::parse("alice").is_none());
        assert!(ChannelIdentifier::parse("/garage").is_none());
        assert!(ChannelIdentifier::parse("alice/").is_none());
        assert!(ChannelIdentifier::parse("alice/a/b").is_none());
    }
}
