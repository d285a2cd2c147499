//! Re-validation of persisted sessions at startup.

use crate::client::{ClientSessionFactory, Credentials};
use crate::error::{Result, SubscriptionError};
use crate::params::{SubscriptionIdentity, SubscriptionParameters};
use crate::types::{EngineId, SessionKey};
use tracing::{info, warn};

/// Credential prompts allowed per entry by default.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What to do with an entry that cannot be re-validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Keep it persisted and try again on the next startup.
    Skip,
    /// Drop it from the store for good.
    Remove,
}

/// Interactive side of resumption, supplied by the application.
pub trait CredentialPrompt {
    /// Ask for replacement credentials after an authentication failure.
    /// `None` gives up on this entry.
    fn request_credentials(
        &self,
        identity: &SubscriptionIdentity,
        attempt: u32,
        error: &SubscriptionError,
    ) -> Option<Credentials>;

    /// The entry could not be re-validated; decide its fate.
    fn on_unrecoverable(&self, identity: &SubscriptionIdentity, error: &SubscriptionError) -> ResumeDecision;
}

/// Checks that a parameter set can still log in.
pub trait SessionValidator {
    fn validate(&self, params: &SubscriptionParameters) -> Result<()>;
}

impl SessionValidator for ClientSessionFactory {
    fn validate(&self, params: &SubscriptionParameters) -> Result<()> {
        ClientSessionFactory::validate(self, params)
    }
}

/// Resumption tuning.
#[derive(Clone, Debug)]
pub struct ResumeConfig {
    /// Credential prompts per entry.
    /// Default: 3
    pub max_attempts: u32,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Result of re-validating one entry.
#[derive(Debug)]
pub enum Revalidation {
    /// Ready to run; `updated` is set when new credentials were accepted.
    Valid {
        params: SubscriptionParameters,
        updated: bool,
    },
    Skip,
    Remove,
}

/// Summary of a resumption pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Ids of the engines started from persisted entries.
    pub resumed: Vec<EngineId>,
    /// Entries left for the next startup.
    pub skipped: Vec<SessionKey>,
    /// Entries removed from the store.
    pub removed: Vec<SessionKey>,
}

/// Re-validate one persisted parameter set, prompting for credentials
/// after authentication failures.
pub fn revalidate(
    mut params: SubscriptionParameters,
    validator: &dyn SessionValidator,
    prompt: &dyn CredentialPrompt,
    config: &ResumeConfig,
) -> Revalidation {
    let identity = params.identity();
    let mut updated = false;
    let mut attempt = 0u32;

    loop {
        let error = match validator.validate(&params) {
            Ok(()) => {
                info!(%identity, "persisted session validated");
                return Revalidation::Valid { params, updated };
            }
            Err(e) => e,
        };

        if error.is_authentication() && attempt < config.max_attempts {
            attempt += 1;
            warn!(%identity, attempt, error = %error, "persisted credentials rejected");
            if let Some(credentials) = prompt.request_credentials(&identity, attempt, &error) {
                match credentials.apply_to(&mut params) {
                    Ok(()) => {
                        updated = true;
                        continue;
                    }
                    Err(e) => {
                        return decide(prompt, &identity, &e);
                    }
                }
            }
        }

        warn!(%identity, error = %error, "persisted session cannot be resumed");
        return decide(prompt, &identity, &error);
    }
}

fn decide(prompt: &dyn CredentialPrompt, identity: &SubscriptionIdentity, error: &SubscriptionError) -> Revalidation {
    match prompt.on_unrecoverable(identity, error) {
        ResumeDecision::Skip => Revalidation::Skip,
        ResumeDecision::Remove => Revalidation::Remove,
    }
}
