//! Keep-alive session persistence and startup resumption.
//!
//! - [`SessionPersistenceStore`]: atomic, checksummed on-disk registry
//! - [`resume`]: credential re-validation driven by the manager

pub mod resume;
mod store;

pub use resume::{
    CredentialPrompt, ResumeConfig, ResumeDecision, ResumeReport, Revalidation, SessionValidator,
};
pub use store::{LoadSource, PersistedSession, PersistenceConfig, SessionPersistenceStore};
