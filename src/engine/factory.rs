//! Assembles engines from parameters.

use super::policy;
use super::push::{NotifierFactory, DEFAULT_ACK_CAPACITY, DEFAULT_QUEUE_CAPACITY};
use super::{EngineParts, SubscriptionEngine};
use crate::client::{ClientSessionFactory, SharedClient};
use crate::error::{Result, SubscriptionError};
use crate::handlers::{HandlerDispatchTable, HandlerRegistry};
use crate::params::{keys, SubscriptionParameters};
use crate::report::ReportBuffer;
use crate::types::TaskType;
use std::sync::Arc;
use tracing::debug;

/// Engine tuning.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Capacity of each push engine's event queue.
    /// Default: 1000
    pub queue_capacity: usize,

    /// Names remembered by the push acknowledged-item cache.
    /// Default: 4096
    pub ack_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ack_capacity: DEFAULT_ACK_CAPACITY,
        }
    }
}

/// Builds [`SubscriptionEngine`]s, picking the delivery policy from the
/// task type and installing the handlers the parameters select.
pub struct EngineFactory {
    registry: Arc<HandlerRegistry>,
    sessions: Arc<ClientSessionFactory>,
    notifiers: Option<Arc<dyn NotifierFactory>>,
    config: EngineConfig,
}

impl EngineFactory {
    pub fn new(registry: Arc<HandlerRegistry>, sessions: Arc<ClientSessionFactory>) -> Self {
        Self {
            registry,
            sessions,
            notifiers: None,
            config: EngineConfig::default(),
        }
    }

    /// Enable push mode with notifiers from `notifiers`.
    pub fn with_notifiers(mut self, notifiers: Arc<dyn NotifierFactory>) -> Self {
        self.notifiers = Some(notifiers);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sessions(&self) -> &Arc<ClientSessionFactory> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Build an engine (not started). `client`, if given, is used instead
    /// of connecting on start.
    pub fn build(
        &self,
        params: SubscriptionParameters,
        client: Option<SharedClient>,
    ) -> Result<Arc<SubscriptionEngine>> {
        params.validate()?;
        let task_type = params.task_type();
        if params.is_push() && task_type != TaskType::Null && self.notifiers.is_none() {
            return Err(SubscriptionError::invalid(
                keys::PUSH,
                "push mode needs a notifier factory",
            ));
        }

        let handlers = HandlerDispatchTable::new();
        let installed = self.registry.install(&params, &handlers)?;
        let identity = params.identity();
        let report = Arc::new(ReportBuffer::from_params(identity.to_string(), &params)?);
        debug!(%identity, handlers = installed, push = params.is_push(), "engine assembled");

        Ok(SubscriptionEngine::new(EngineParts {
            policy: policy::for_task(task_type),
            params,
            sessions: Arc::clone(&self.sessions),
            handlers,
            notifiers: self.notifiers.clone(),
            report,
            context: Arc::clone(self.registry.context()),
            client,
            config: self.config.clone(),
        }))
    }
}
