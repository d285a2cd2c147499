//! Durable registry of keep-alive sessions.
//!
//! File layout:
//!
//! ```text
//! magic "SPS\0" | version u8 | payload length u64 LE | payload | crc32 u32 LE
//! ```
//!
//! The payload is MessagePack with named fields. Every commit copies the
//! current file to `<name>.sps.bak`, writes `<name>.sps.tmp`, fsyncs it and
//! renames it over `<name>.sps`.

use crate::error::{Result, SubscriptionError};
use crate::params::SubscriptionParameters;
use crate::types::{EngineId, SessionKey, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SESSION_STORE_MAGIC: &[u8; 4] = b"SPS\0";

const SESSION_STORE_VERSION: u8 = 1;

/// Refuse to load payloads larger than this.
const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Session store configuration.
#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    /// Directory holding the store files and its lock.
    pub dir: PathBuf,

    /// Base name of the store files.
    /// Default: "sessions"
    pub name: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./subscriber-state"),
            name: "sessions".to_string(),
        }
    }
}

/// One persisted keep-alive subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    /// Engine id at the time it was persisted.
    pub id: u64,
    /// Flattened parameters, including keys this version does not know.
    pub properties: BTreeMap<String, String>,
}

impl PersistedSession {
    pub fn new(id: EngineId, params: &SubscriptionParameters) -> Self {
        Self {
            id: id.0,
            properties: params.to_properties(),
        }
    }

    pub fn parameters(&self) -> SubscriptionParameters {
        SubscriptionParameters::from_properties(&self.properties)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct StorePayload {
    name: String,
    last_query: Timestamp,
    sessions: BTreeMap<SessionKey, PersistedSession>,
}

/// Which file the store was restored from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
    Empty,
}

/// Crash-resilient key -> parameter-map store.
///
/// Mutations are in memory until [`SessionPersistenceStore::commit`].
pub struct SessionPersistenceStore {
    config: PersistenceConfig,
    payload: Mutex<StorePayload>,
    loaded_from: LoadSource,
    _lock: File,
}

impl SessionPersistenceStore {
    /// Open (or create) the store, taking its directory lock.
    pub fn open(config: PersistenceConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let lock = Self::acquire_lock(&config.dir)?;

        let primary = primary_path(&config);
        let backup = backup_path(&config);
        let (mut payload, loaded_from) = match read_store(&primary) {
            Ok(Some(payload)) => (payload, LoadSource::Primary),
            other => {
                if let Err(e) = other {
                    warn!(path = %primary.display(), error = %e, "session store unreadable, trying backup");
                }
                match read_store(&backup) {
                    Ok(Some(payload)) => {
                        info!(path = %backup.display(), "session store restored from backup");
                        (payload, LoadSource::Backup)
                    }
                    Ok(None) => (StorePayload::default(), LoadSource::Empty),
                    Err(e) => {
                        warn!(path = %backup.display(), error = %e, "session backup unreadable, starting empty");
                        (StorePayload::default(), LoadSource::Empty)
                    }
                }
            }
        };
        payload.name = config.name.clone();
        debug!(sessions = payload.sessions.len(), source = ?loaded_from, "session store opened");

        Ok(Self {
            config,
            payload: Mutex::new(payload),
            loaded_from,
            _lock: lock,
        })
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SubscriptionError::Locked)?;
        Ok(lock_file)
    }

    pub fn loaded_from(&self) -> LoadSource {
        self.loaded_from
    }

    pub fn path(&self) -> PathBuf {
        primary_path(&self.config)
    }

    pub fn backup_path(&self) -> PathBuf {
        backup_path(&self.config)
    }

    /// Insert or overwrite an entry.
    pub fn put(&self, key: SessionKey, session: PersistedSession) {
        self.payload.lock().sessions.insert(key, session);
    }

    /// Persist `params` under its derived key; returns the key.
    pub fn put_parameters(&self, id: EngineId, params: &SubscriptionParameters) -> SessionKey {
        let key = params.session_key();
        self.put(key.clone(), PersistedSession::new(id, params));
        key
    }

    pub fn remove(&self, key: &SessionKey) -> Option<PersistedSession> {
        self.payload.lock().sessions.remove(key)
    }

    pub fn get(&self, key: &SessionKey) -> Option<PersistedSession> {
        self.payload.lock().sessions.get(key).cloned()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.payload.lock().sessions.contains_key(key)
    }

    /// All entries in key order.
    pub fn entries(&self) -> Vec<(SessionKey, PersistedSession)> {
        self.payload
            .lock()
            .sessions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.payload.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.payload.lock().sessions.clear();
    }

    pub fn last_query(&self) -> Timestamp {
        self.payload.lock().last_query
    }

    /// Advance the last-query timestamp (it never moves backwards).
    pub fn set_last_query(&self, at: Timestamp) {
        let mut payload = self.payload.lock();
        if at > payload.last_query {
            payload.last_query = at;
        }
    }

    /// Write the store to disk atomically.
    pub fn commit(&self) -> Result<()> {
        let payload = self.payload.lock();
        let primary = self.path();
        let backup = self.backup_path();
        let tmp = primary.with_extension("sps.tmp");

        if primary.exists() {
            fs::copy(&primary, &backup)?;
        }

        let encoded = rmp_serde::to_vec_named(&*payload)?;
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(SESSION_STORE_MAGIC)?;
            file.write_all(&[SESSION_STORE_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &primary)?;

        debug!(sessions = payload.sessions.len(), path = %primary.display(), "session store committed");
        Ok(())
    }
}

fn primary_path(config: &PersistenceConfig) -> PathBuf {
    config.dir.join(format!("{}.sps", config.name))
}

fn backup_path(config: &PersistenceConfig) -> PathBuf {
    config.dir.join(format!("{}.sps.bak", config.name))
}

/// Read one store file; `Ok(None)` if it does not exist.
fn read_store(path: &Path) -> Result<Option<StorePayload>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != SESSION_STORE_MAGIC {
        return Err(SubscriptionError::InvalidFormat("bad session store magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != SESSION_STORE_VERSION {
        return Err(SubscriptionError::InvalidFormat(format!(
            "unsupported session store version: {}",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let len = u64::from_le_bytes(len_bytes);
    if len > MAX_PAYLOAD {
        return Err(SubscriptionError::Corruption(format!("payload length {len} too large")));
    }

    let mut encoded = vec![0u8; len as usize];
    file.read_exact(&mut encoded)?;

    let mut crc_bytes = [0u8; 4];
    file.read_exact(&mut crc_bytes)?;
    let expected = u32::from_le_bytes(crc_bytes);
    let got = crc32fast::hash(&encoded);
    if expected != got {
        return Err(SubscriptionError::ChecksumMismatch { expected, got });
    }

    Ok(Some(rmp_serde::from_slice(&encoded)?))
}
