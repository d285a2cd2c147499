//! # Archive Subscriber
//!
//! Long-running subscription and notification engine for a remote archive
//! file-delivery client. For every watched file type it detects newly
//! available files and either downloads them (subscription) or reports
//! them (notification), polling on an interval (pull) or reacting to a
//! notifier stream (push).
//!
//! ## Core Concepts
//!
//! - **Engines**: one thread per subscription, driven by a state machine
//! - **Manager**: the set of live engines, ids, uniqueness, fan-out
//! - **Handlers**: pluggable consumers of delivered and failed files
//! - **Persistence**: keep-alive subscriptions survive restarts
//! - **Throttle**: shared backoff between reconnecting engines
//!
//! ## Example
//!
//! ```ignore
//! use archive_subscriber::*;
//!
//! let throttle = Arc::new(ReconnectThrottle::new("archive", ThrottleConfig::default()));
//! let sessions = Arc::new(ClientSessionFactory::new(connector, throttle));
//! let registry = Arc::new(HandlerRegistry::with_builtins(AppContext::new("feeder")));
//! let factory = Arc::new(EngineFactory::new(registry, sessions));
//! let store = Arc::new(SessionPersistenceStore::open(PersistenceConfig::default())?);
//!
//! let manager = SubscriptionManager::with_factory(ManagerConfig::default(), factory, Some(store));
//! manager.submit(
//!     SubscriptionParameters::subscription("RAW", "/data/raw")
//!         .with(keys::INTERVAL, 300i64)
//!         .with(keys::KEEP_ALIVE, true),
//!     None,
//! )?;
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod params;
pub mod persistence;
pub mod report;
pub mod signal;
pub mod types;

// Re-exports
pub use client::{
    ClientSessionFactory, Connector, Credentials, FactoryConfig, ReconnectThrottle, SessionClient,
    SessionOption, SessionTarget, SharedClient, StallReporter, ThrottleConfig,
};
pub use engine::push::{NotifierFactory, PushNotifier, PushQueue};
pub use engine::{EngineConfig, EngineEvent, EngineFactory, SubscriptionEngine, SubscriptionState};
pub use error::{Result, SubscriptionError};
pub use handlers::{AppContext, EventKind, Handler, HandlerDispatchTable, HandlerRegistry};
pub use manager::{DropReason, ListenerConfig, ListenerHandle, ManagerConfig, ManagerEvent, SubscriptionManager};
pub use params::{keys, ParamValue, SubscriptionIdentity, SubscriptionParameters};
pub use persistence::{
    CredentialPrompt, PersistenceConfig, ResumeConfig, ResumeDecision, ResumeReport, SessionPersistenceStore,
    SessionValidator,
};
pub use report::{MailMessage, MailTransport, ReportBuffer};
pub use signal::ControlSignal;
pub use types::*;
