//! Builds logged-in session clients.

use super::{share, Connector, Permit, ReconnectThrottle, SessionClient, SessionOption, SessionTarget, SharedClient};
use crate::error::{Result, SubscriptionError};
use crate::params::{keys, SubscriptionParameters};
use crate::signal::ControlSignal;
use crate::types::TaskType;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Factory configuration.
#[derive(Clone, Debug, Default)]
pub struct FactoryConfig {
    /// Give up reconnecting after this long (None = retry forever).
    pub wait_budget: Option<Duration>,
}

/// Boolean parameters mapped onto session options.
const OPTION_KEYS: [(&str, SessionOption); 7] = [
    (keys::RESTART, SessionOption::Restart),
    (keys::CHECKSUM, SessionOption::Checksum),
    (keys::RECEIPT, SessionOption::Receipt),
    (keys::SAFEREAD, SessionOption::SafeRead),
    (keys::REPLACE, SessionOption::Replace),
    (keys::VERSION, SessionOption::Version),
    (keys::DIFF, SessionOption::Diff),
];

/// Builds and rebuilds [`SessionClient`]s, consulting the shared throttle
/// before every attempt.
pub struct ClientSessionFactory {
    connector: Arc<dyn Connector>,
    throttle: Arc<ReconnectThrottle>,
    config: FactoryConfig,
    /// Number of `build` calls, for diagnostics.
    builds: AtomicU64,
}

impl ClientSessionFactory {
    pub fn new(connector: Arc<dyn Connector>, throttle: Arc<ReconnectThrottle>) -> Self {
        Self::with_config(connector, throttle, FactoryConfig::default())
    }

    pub fn with_config(
        connector: Arc<dyn Connector>,
        throttle: Arc<ReconnectThrottle>,
        config: FactoryConfig,
    ) -> Self {
        Self {
            connector,
            throttle,
            config,
            builds: AtomicU64::new(0),
        }
    }

    pub fn throttle(&self) -> &Arc<ReconnectThrottle> {
        &self.throttle
    }

    /// How many times [`ClientSessionFactory::build`] has been called.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::SeqCst)
    }

    /// Build a logged-in client for `params`.
    ///
    /// Blocks through throttle backoff. Connection failures are retried until
    /// the wait budget (if any) runs out; authentication and any other
    /// failure return immediately. A terminate request on `signal` aborts with
    /// [`SubscriptionError::Interrupted`].
    pub fn build(
        &self,
        params: &SubscriptionParameters,
        signal: Option<&ControlSignal>,
    ) -> Result<SharedClient> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let target = SessionTarget::from_params(params)?;
        let deadline = self.config.wait_budget.map(|budget| Instant::now() + budget);
        let mut attempt = 0u32;

        loop {
            match self.throttle.await_permit(signal, deadline) {
                Permit::Granted => {}
                Permit::Interrupted => return Err(SubscriptionError::Interrupted),
                Permit::DeadlineReached => {
                    return Err(SubscriptionError::WaitBudgetExhausted(
                        self.config.wait_budget.unwrap_or_default(),
                    ))
                }
            }
            attempt += 1;

            match self.connect_once(&target) {
                Ok(mut client) => {
                    self.throttle.record_success();
                    apply_options(client.as_mut(), params)?;
                    info!(endpoint = %target.endpoint(), file_type = %target.file_type, attempt, "session established");
                    return Ok(share(client));
                }
                Err(e) if !e.is_connection() => {
                    warn!(endpoint = %target.endpoint(), error = %e, "login rejected, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.throttle.record_failure();
                    warn!(endpoint = %target.endpoint(), error = %e, attempt, ?delay, "connection attempt failed");
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(SubscriptionError::WaitBudgetExhausted(
                                self.config.wait_budget.unwrap_or_default(),
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Check that `params` can log in, without retrying.
    pub fn validate(&self, params: &SubscriptionParameters) -> Result<()> {
        let target = SessionTarget::from_params(params)?;
        if self.throttle.await_permit(None, None) != Permit::Granted {
            return Err(SubscriptionError::Interrupted);
        }
        match self.connect_once(&target) {
            Ok(mut client) => {
                self.throttle.record_success();
                client.logout();
                Ok(())
            }
            Err(e) => {
                if e.is_connection() {
                    self.throttle.record_failure();
                }
                Err(e)
            }
        }
    }

    fn connect_once(&self, target: &SessionTarget) -> Result<Box<dyn SessionClient>> {
        let mut client = self.connector.open(target)?;
        client.login()?;
        Ok(client)
    }
}

/// Apply restart/checksum/overwrite/version settings to a fresh session.
fn apply_options(client: &mut dyn SessionClient, params: &SubscriptionParameters) -> Result<()> {
    for (key, option) in OPTION_KEYS {
        if let Some(value) = params.get_bool(key)? {
            let code = client.set(option, if value { "true" } else { "false" });
            if !code.is_ok() {
                warn!(%option, ?code, "session option not accepted");
            }
        }
    }
    if params.task_type() == TaskType::Subscription {
        let dir = params.output_directory();
        let code = client.set(SessionOption::OutputDirectory, &dir.display().to_string());
        if !code.is_ok() {
            warn!(option = %SessionOption::OutputDirectory, ?code, "session option not accepted");
        }
    }
    debug!("session options applied");
    Ok(())
}
