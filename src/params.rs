//! Subscription parameters: the ordered key/value configuration of one engine.
//!
//! Values are loosely typed (string, bool, integer, URL). Typed accessors
//! parse string values on demand, so a parameter set restored from the flat
//! string map of the session store behaves exactly like the original.

use crate::error::{Result, SubscriptionError};
use crate::types::{SessionKey, TaskType};
use chrono::NaiveTime;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Recognized configuration keys.
pub mod keys {
    pub const TASK_TYPE: &str = "task-type";
    pub const FILE_TYPE: &str = "file-type";
    pub const OUTPUT_DIRECTORY: &str = "output-directory";
    pub const INTERVAL: &str = "interval";
    pub const PUSH: &str = "push";
    pub const KEEP_ALIVE: &str = "keep-alive";
    pub const RESTART: &str = "restart";
    pub const INVOKE_COMMAND: &str = "invoke-command";
    pub const INVOKE_EXIT_ON_ERROR: &str = "invoke-exit-on-error";
    pub const LOG_FILENAME: &str = "log-filename";
    pub const LOG_ROLLING_PERIOD: &str = "log-rolling-period";
    pub const MAIL_MESSAGE_FROM: &str = "mail-message-from";
    pub const MAIL_MESSAGE_TO: &str = "mail-message-to";
    pub const MAIL_REPORT_TO: &str = "mail-report-to";
    pub const MAIL_REPORT_AT: &str = "mail-report-at";
    pub const MAIL_SMTP_HOST: &str = "mail-smtp-host";
    pub const CHECKSUM: &str = "checksum";
    pub const RECEIPT: &str = "receipt";
    pub const SAFEREAD: &str = "saferead";
    pub const REPLACE: &str = "replace";
    pub const VERSION: &str = "version";
    pub const DIFF: &str = "diff";
    pub const HANDLERS: &str = "handlers";
    pub const SERVER: &str = "server";
    pub const USER: &str = "user";
    pub const PASSWORD: &str = "password";

    /// Keys that make up the identity of a subscription.
    pub const IDENTITY: [&str; 3] = [TASK_TYPE, FILE_TYPE, OUTPUT_DIRECTORY];
}

/// Default pull interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// A single parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Url(Url),
}

impl ParamValue {
    /// Render the value in the flat string form used by the session store.
    pub fn to_property(&self) -> String {
        match self {
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Str(s) => s.clone(),
            ParamValue::Url(u) => u.to_string(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_property())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Int(i)
    }
}

impl From<i32> for ParamValue {
    fn from(i: i32) -> Self {
        ParamValue::Int(i64::from(i))
    }
}

impl From<Url> for ParamValue {
    fn from(u: Url) -> Self {
        ParamValue::Url(u)
    }
}

/// Rolling period of the per-subscription delivery log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RollingPeriod {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
}

impl std::str::FromStr for RollingPeriod {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "never" => Ok(RollingPeriod::None),
            "daily" | "day" => Ok(RollingPeriod::Daily),
            "weekly" | "week" => Ok(RollingPeriod::Weekly),
            "monthly" | "month" => Ok(RollingPeriod::Monthly),
            other => Err(SubscriptionError::invalid(
                keys::LOG_ROLLING_PERIOD,
                format!("unknown rolling period '{other}'"),
            )),
        }
    }
}

/// The identity triple that uniquely names a logical subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionIdentity {
    pub task_type: TaskType,
    pub source: String,
    pub target: String,
}

impl SubscriptionIdentity {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::derive(self.task_type, &self.source, &self.target)
    }
}

impl fmt::Display for SubscriptionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.task_type, self.source, self.target)
    }
}

/// Ordered key/value configuration of one subscription.
#[derive(Clone, Default, PartialEq)]
pub struct SubscriptionParameters {
    entries: Vec<(String, ParamValue)>,
    /// Once frozen, identity keys reject changes.
    frozen: bool,
}

impl SubscriptionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters for a download subscription of `file_type` into `output_dir`.
    pub fn subscription(file_type: &str, output_dir: impl Into<String>) -> Self {
        Self::new()
            .with(keys::TASK_TYPE, TaskType::Subscription.as_str())
            .with(keys::FILE_TYPE, file_type)
            .with(keys::OUTPUT_DIRECTORY, output_dir.into())
    }

    /// Parameters for a notification on `file_type`.
    pub fn notification(file_type: &str) -> Self {
        Self::new()
            .with(keys::TASK_TYPE, TaskType::Notification.as_str())
            .with(keys::FILE_TYPE, file_type)
    }

    /// Rebuild parameters from the flat string map of the session store.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Self {
        let entries = properties
            .iter()
            .map(|(k, v)| (k.clone(), ParamValue::Str(v.clone())))
            .collect();
        Self {
            entries,
            frozen: false,
        }
    }

    /// Flatten to the string map stored by the session store.
    pub fn to_properties(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_property()))
            .collect()
    }

    /// Builder-style insert; replaces an existing value in place.
    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value.into());
        self
    }

    /// Set a value, refusing identity keys once the parameters are frozen.
    pub fn set(&mut self, key: &str, value: impl Into<ParamValue>) -> Result<()> {
        if self.frozen && keys::IDENTITY.contains(&key) {
            return Err(SubscriptionError::IdentityLocked(key.to_string()));
        }
        self.insert(key, value.into());
        Ok(())
    }

    /// Remove a value, refusing identity keys once frozen.
    pub fn remove(&mut self, key: &str) -> Result<Option<ParamValue>> {
        if self.frozen && keys::IDENTITY.contains(&key) {
            return Err(SubscriptionError::IdentityLocked(key.to_string()));
        }
        let pos = self.entries.iter().position(|(k, _)| k == key);
        Ok(pos.map(|i| self.entries.remove(i).1))
    }

    fn insert(&mut self, key: &str, value: ParamValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// String form of a value; empty strings count as unset.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(ParamValue::to_property)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(ParamValue::Bool(b)) => Ok(Some(*b)),
            Some(ParamValue::Int(i)) => Ok(Some(*i != 0)),
            Some(ParamValue::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "true" | "yes" | "on" | "1" => Ok(Some(true)),
                "false" | "no" | "off" | "0" => Ok(Some(false)),
                other => Err(SubscriptionError::invalid(
                    key,
                    format!("expected a boolean, got '{other}'"),
                )),
            },
            Some(ParamValue::Url(_)) => {
                Err(SubscriptionError::invalid(key, "expected a boolean, got a URL"))
            }
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(ParamValue::Int(i)) => Ok(Some(*i)),
            Some(ParamValue::Str(s)) if s.trim().is_empty() => Ok(None),
            Some(ParamValue::Str(s)) => s.trim().parse().map(Some).map_err(|_| {
                SubscriptionError::invalid(key, format!("expected an integer, got '{s}'"))
            }),
            Some(other) => Err(SubscriptionError::invalid(
                key,
                format!("expected an integer, got '{other}'"),
            )),
        }
    }

    pub fn get_url(&self, key: &str) -> Result<Option<Url>> {
        match self.get(key) {
            None => Ok(None),
            Some(ParamValue::Url(u)) => Ok(Some(u.clone())),
            Some(ParamValue::Str(s)) if s.trim().is_empty() => Ok(None),
            Some(ParamValue::Str(s)) => Url::parse(s.trim())
                .map(Some)
                .map_err(|e| SubscriptionError::invalid(key, e.to_string())),
            Some(other) => Err(SubscriptionError::invalid(
                key,
                format!("expected a URL, got '{other}'"),
            )),
        }
    }

    fn flag(&self, key: &str) -> bool {
        self.get_bool(key).ok().flatten().unwrap_or(false)
    }

    // --- Derived settings ---

    pub fn task_type(&self) -> TaskType {
        TaskType::from_param(self.get_string(keys::TASK_TYPE).as_deref())
    }

    /// The catalogued file type this subscription watches.
    pub fn file_type(&self) -> Option<String> {
        self.get_string(keys::FILE_TYPE)
    }

    /// Output directory; defaults to the process working directory.
    pub fn output_directory(&self) -> PathBuf {
        match self.get_string(keys::OUTPUT_DIRECTORY) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn identity(&self) -> SubscriptionIdentity {
        SubscriptionIdentity {
            task_type: self.task_type(),
            source: self.file_type().unwrap_or_default(),
            target: self.output_directory().display().to_string(),
        }
    }

    pub fn session_key(&self) -> SessionKey {
        self.identity().session_key()
    }

    /// Pull interval, `interval` key in seconds.
    pub fn interval(&self) -> Result<Duration> {
        match self.get_int(keys::INTERVAL)? {
            None => Ok(DEFAULT_INTERVAL),
            Some(secs) if secs > 0 => Ok(Duration::from_secs(secs as u64)),
            Some(secs) => Err(SubscriptionError::invalid(
                keys::INTERVAL,
                format!("interval must be positive, got {secs}"),
            )),
        }
    }

    pub fn is_push(&self) -> bool {
        self.flag(keys::PUSH)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.flag(keys::KEEP_ALIVE)
    }

    pub fn invoke_command(&self) -> Option<String> {
        self.get_string(keys::INVOKE_COMMAND)
    }

    pub fn exit_on_error(&self) -> bool {
        self.flag(keys::INVOKE_EXIT_ON_ERROR)
    }

    pub fn log_filename(&self) -> Option<PathBuf> {
        self.get_string(keys::LOG_FILENAME).map(PathBuf::from)
    }

    pub fn rolling_period(&self) -> Result<RollingPeriod> {
        self.get_string(keys::LOG_ROLLING_PERIOD)
            .map(|s| s.parse())
            .unwrap_or(Ok(RollingPeriod::None))
    }

    /// Time of day (UTC) at which the mail report is sent.
    pub fn report_at(&self) -> Result<Option<NaiveTime>> {
        match self.get_string(keys::MAIL_REPORT_AT) {
            None => Ok(None),
            Some(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M")
                .map(Some)
                .map_err(|e| SubscriptionError::invalid(keys::MAIL_REPORT_AT, e.to_string())),
        }
    }

    /// Names listed in the `handlers` key.
    pub fn handler_names(&self) -> Vec<String> {
        self.get_string(keys::HANDLERS)
            .map(|s| {
                s.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check every typed setting once, at construction time.
    pub fn validate(&self) -> Result<()> {
        let task_type = self.task_type();
        if task_type != TaskType::Null && self.file_type().is_none() {
            return Err(SubscriptionError::invalid(keys::FILE_TYPE, "file type is required"));
        }
        self.interval()?;
        for key in [
            keys::PUSH,
            keys::KEEP_ALIVE,
            keys::RESTART,
            keys::INVOKE_EXIT_ON_ERROR,
            keys::CHECKSUM,
            keys::RECEIPT,
            keys::SAFEREAD,
            keys::REPLACE,
            keys::VERSION,
            keys::DIFF,
        ] {
            self.get_bool(key)?;
        }
        self.get_url(keys::SERVER)?;
        self.rolling_period()?;
        self.report_at()?;
        if self.contains(keys::MAIL_REPORT_AT) && self.get_string(keys::MAIL_REPORT_TO).is_none() {
            return Err(SubscriptionError::invalid(
                keys::MAIL_REPORT_TO,
                "a report time needs a report recipient",
            ));
        }
        Ok(())
    }

    /// Parse a JSON parameter document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SubscriptionError::Deserialization(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Debug for SubscriptionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.entries {
            if k == keys::PASSWORD {
                map.entry(k, &"***");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}

impl Serialize for SubscriptionParameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SubscriptionParameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ParamsVisitor;

        impl<'de> Visitor<'de> for ParamsVisitor {
            type Value = SubscriptionParameters;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of subscription parameters")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut params = SubscriptionParameters::new();
                while let Some((key, value)) = access.next_entry::<String, ParamValue>()? {
                    params.insert(&key, value);
                }
                Ok(params)
            }
        }

        deserializer.deserialize_map(ParamsVisitor)
    }
}
