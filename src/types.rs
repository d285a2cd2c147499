//! Core types shared across the subscription engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier assigned to an engine by its manager.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineId(pub u64);

impl fmt::Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineId({})", self.0)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Renders an optional engine id, using `-1` for an unassigned engine.
pub fn display_id(id: Option<EngineId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "-1".to_string(),
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The epoch; "everything is new since then".
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }

    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs * 1_000_000)
    }

    pub fn as_secs(self) -> i64 {
        self.0 / 1_000_000
    }

    /// Convert to a UTC date-time (used for rolling periods and reports).
    pub fn to_datetime(self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000);
        let nanos = (self.0.rem_euclid(1_000_000) * 1_000) as u32;
        DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

/// What an engine does with the files it finds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Download new files into the output directory.
    Subscription,
    /// Only surface new files to handlers.
    Notification,
    /// Missing or unrecognized task type; the engine idles.
    Null,
}

impl TaskType {
    /// Resolve a possibly-absent task type parameter.
    ///
    /// Anything unrecognized maps to [`TaskType::Null`] instead of failing.
    pub fn from_param(value: Option<&str>) -> Self {
        value
            .and_then(|v| v.parse().ok())
            .unwrap_or(TaskType::Null)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Subscription => "subscription",
            TaskType::Notification => "notification",
            TaskType::Null => "null",
        }
    }
}

impl FromStr for TaskType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subscription" | "subscribe" => Ok(TaskType::Subscription),
            "notification" | "notify" => Ok(TaskType::Notification),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed result code reported by the session client for each item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    NoMatch,
    IoError,
    FileExists,
    FileNotFound,
    Failure,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

/// Identifier of a transaction issued by a session client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

/// One item produced by a query or fetch transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    /// Remote file name.
    pub name: String,
    /// File type the item belongs to.
    pub file_type: String,
    /// Outcome reported by the session client.
    pub code: ResultCode,
    /// Size in bytes, when known.
    pub size: Option<u64>,
    /// Remote modification time, when known.
    pub modified: Option<Timestamp>,
    /// Local path after a successful download.
    pub local_path: Option<PathBuf>,
    /// Free-form detail for failures.
    pub message: Option<String>,
}

impl FileResult {
    /// A successful result for `name`.
    pub fn ok(name: impl Into<String>, file_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: file_type.into(),
            code: ResultCode::Ok,
            size: None,
            modified: None,
            local_path: None,
            message: None,
        }
    }

    /// A result carrying `code` for `name`.
    pub fn with_code(name: impl Into<String>, file_type: impl Into<String>, code: ResultCode) -> Self {
        Self {
            code,
            ..Self::ok(name, file_type)
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// An entry in an engine's delivered-file history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveredFile {
    pub result: FileResult,
    pub delivered_at: Timestamp,
}

/// Deterministic key of a persisted session (SHA-256 of its identity).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    /// Derive the key from the identity triple of a subscription.
    pub fn derive(task_type: TaskType, file_type: &str, output_dir: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(task_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(file_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(output_dir.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        SessionKey(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
