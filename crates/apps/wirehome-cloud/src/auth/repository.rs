use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use wirehome_cloud_protocol::DEFAULT_CHANNEL_UID;

const CONFIGURATION_FILE: &str = "configuration.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityRecord {
    /// Argon2 PHC string.
    pub password_hash: String,
    pub is_locked: bool,
    pub is_admin: bool,
    pub channels: BTreeMap<String, ChannelRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelRecord {
    pub is_default: bool,
    /// Other identities that may address this channel with an
    /// `identity/channel` selector.
    pub allowed_identities: BTreeSet<String>,
}

impl IdentityRecord {
    /// The channel flagged as default, else [`DEFAULT_CHANNEL_UID`].
    pub fn default_channel_uid(&self) -> &str {
        self.channels
            .iter()
            .find(|(_, channel)| channel.is_default)
            .map(|(uid, _)| uid.as_str())
            .unwrap_or(DEFAULT_CHANNEL_UID)
    }

    pub fn channel(&self, channel_uid: &str) -> Option<&ChannelRecord> {
        self.channels.get(channel_uid)
    }
}

/// Storage of identity records keyed by lower-case identity uid.
pub trait IdentityRepository: Send + Sync {
    fn load(&self, identity_uid: &str) -> io::Result<Option<IdentityRecord>>;

    fn store(&self, identity_uid: &str, record: &IdentityRecord) -> io::Result<()>;

    fn set_password_hash(&self, identity_uid: &str, password_hash: String) -> io::Result<()> {
        let mut record = self.load(identity_uid)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown identity '{identity_uid}'"))
        })?;
        record.password_hash = password_hash;
        self.store(identity_uid, &record)
    }
}

/// One JSON file per identity at `<root>/<uid>/configuration.json`.
#[derive(Debug, Clone)]
pub struct FileIdentityRepository {
    root: PathBuf,
}

impl FileIdentityRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, identity_uid: &str) -> io::Result<PathBuf> {
        let valid = !identity_uid.is_empty()
            && !identity_uid.starts_with('.')
            && !identity_uid.contains(['/', '\\', '\0']);
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid identity uid '{identity_uid}'"),
            ));
        }
        Ok(self.root.join(identity_uid).join(CONFIGURATION_FILE))
    }
}

impl IdentityRepository for FileIdentityRepository {
    fn load(&self, identity_uid: &str) -> io::Result<Option<IdentityRecord>> {
        let path = self.path_for(identity_uid)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_str(&contents).map(Some).map_err(|err| {
            io::Error::new(io::ErrorKind::InvalidData, format!("{}: {err}", path.display()))
        })
    }

    fn store(&self, identity_uid: &str, record: &IdentityRecord) -> io::Result<()> {
        let path = self.path_for(identity_uid)?;
        let contents = serde_json::to_vec_pretty(record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        write_atomically(&path, &contents)
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let unique = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let tmp_path = path.with_extension(format!("tmp-{unique}"));
    {
        let mut file = fs::OpenOptions::new().write(true).create_new(true).open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    #[cfg(windows)]
    if path.exists() {
        let _ = fs::remove_file(path);
    }

    fs::rename(&tmp_path, path)
}

/// Volatile repository for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryIdentityRepository {
    records: RwLock<HashMap<String, IdentityRecord>>,
}

impl MemoryIdentityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity_uid: impl Into<String>, record: IdentityRecord) {
        self.records.write().unwrap_or_else(PoisonError::into_inner).insert(identity_uid.into(), record);
    }
}

impl IdentityRepository for MemoryIdentityRepository {
    fn load(&self, identity_uid: &str) -> io::Result<Option<IdentityRecord>> {
        Ok(self.records.read().unwrap_or_else(PoisonError::into_inner).get(identity_uid).cloned())
    }

    fn store(&self, identity_uid: &str, record: &IdentityRecord) -> io::Result<()> {
        self.insert(identity_uid, record.clone());
        Ok(())
    }
}
