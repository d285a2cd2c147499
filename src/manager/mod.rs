//! Subscription manager: the set of live engines.
//!
//! The manager:
//! - assigns engine ids (monotonic, never reused)
//! - rejects duplicate subscriptions
//! - propagates the interrupt (pause) flag
//! - keeps keep-alive subscriptions in the session store
//! - fans engine events out to listeners
//!
//! Listeners receive events through bounded channels and are dropped if
//! they fall behind.
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::with_factory(ManagerConfig::default(), factory, Some(store));
//! let listener = manager.subscribe(ListenerConfig::default());
//!
//! manager.resume(&*sessions, &prompt, &ResumeConfig::default())?;
//! let engine = manager.submit(SubscriptionParameters::subscription("RAW", "/data/raw"), None)?;
//!
//! loop {
//!     match listener.recv() {
//!         Ok(ManagerEvent::Engine(EngineEvent::HistoryAppended { file, .. })) => {
//!             println!("got {}", file.result.name)
//!         }
//!         Ok(ManagerEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod engines;
mod listeners;
mod types;

pub use engines::SubscriptionManager;
pub use types::{DropReason, ListenerConfig, ListenerHandle, ListenerId, ManagerConfig, ManagerEvent};
