//! Remote archive session contract and connection management.
//!
//! The archive protocol itself lives outside this crate. Everything here
//! talks to it through [`SessionClient`], opened by a [`Connector`]:
//! - [`ReconnectThrottle`] rate-limits (re)connection attempts
//! - [`ClientSessionFactory`] builds logged-in clients from parameters

mod factory;
mod throttle;

pub use factory::{ClientSessionFactory, FactoryConfig};
pub use throttle::{Permit, ReconnectThrottle, StallReporter, ThrottleConfig};

use crate::error::{Result, SubscriptionError};
use crate::params::{keys, SubscriptionParameters};
use crate::types::{FileResult, ResultCode, Timestamp, TransactionId};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Session options applied after login.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionOption {
    Restart,
    Checksum,
    Receipt,
    SafeRead,
    Replace,
    Version,
    Diff,
    OutputDirectory,
}

impl SessionOption {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionOption::Restart => "restart",
            SessionOption::Checksum => "checksum",
            SessionOption::Receipt => "receipt",
            SessionOption::SafeRead => "saferead",
            SessionOption::Replace => "replace",
            SessionOption::Version => "version",
            SessionOption::Diff => "diff",
            SessionOption::OutputDirectory => "output-directory",
        }
    }
}

impl fmt::Display for SessionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open session with the remote archive.
///
/// Per-item outcomes are reported as [`ResultCode`]s on the results; only
/// [`SessionClient::login`] fails with an error.
pub trait SessionClient: Send {
    /// Establish the session. Authentication problems must be reported as
    /// [`SubscriptionError::Authentication`], everything transient as
    /// [`SubscriptionError::Connection`].
    fn login(&mut self) -> Result<()>;

    fn logout(&mut self);

    /// Start a query for files of the session's type newer than `since`.
    fn query_new_since(&mut self, since: Timestamp) -> TransactionId;

    /// Next result of the current transaction, `None` once it is drained.
    fn get_result(&mut self, timeout: Duration) -> Option<FileResult>;

    /// Start fetching `filenames` into the output directory.
    fn get(&mut self, filenames: &[String]) -> TransactionId;

    fn set(&mut self, option: SessionOption, value: &str) -> ResultCode;

    /// Number of transactions with results still pending.
    fn transaction_count(&self) -> usize;

    fn is_logged_on(&self) -> bool;
}

/// A session client shared between an engine and its handlers.
pub type SharedClient = Arc<Mutex<Box<dyn SessionClient>>>;

/// Wrap a client for sharing.
pub fn share(client: Box<dyn SessionClient>) -> SharedClient {
    Arc::new(Mutex::new(client))
}

/// Where and as whom to connect.
#[derive(Clone, PartialEq)]
pub struct SessionTarget {
    pub server: Option<Url>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub file_type: String,
    pub output_directory: PathBuf,
}

impl SessionTarget {
    /// Extract endpoint, credentials and target from subscription parameters.
    pub fn from_params(params: &SubscriptionParameters) -> Result<Self> {
        Ok(Self {
            server: params.get_url(keys::SERVER)?,
            user: params.get_string(keys::USER),
            password: params.get_string(keys::PASSWORD),
            file_type: params
                .file_type()
                .ok_or_else(|| SubscriptionError::invalid(keys::FILE_TYPE, "file type is required"))?,
            output_directory: params.output_directory(),
        })
    }

    /// Endpoint label used by logs and throttle reports.
    pub fn endpoint(&self) -> String {
        match &self.server {
            Some(url) => url.to_string(),
            None => "default".to_string(),
        }
    }
}

impl fmt::Debug for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTarget")
            .field("server", &self.server.as_ref().map(Url::as_str))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("file_type", &self.file_type)
            .field("output_directory", &self.output_directory)
            .finish()
    }
}

/// Opens (not yet logged-in) session clients.
pub trait Connector: Send + Sync {
    fn open(&self, target: &SessionTarget) -> Result<Box<dyn SessionClient>>;
}

/// Replacement credentials supplied during resumption.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Write these credentials into a parameter set.
    pub fn apply_to(&self, params: &mut SubscriptionParameters) -> Result<()> {
        params.set(keys::USER, self.user.as_str())?;
        params.set(keys::PASSWORD, self.password.as_str())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}
