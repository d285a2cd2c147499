//! Process-scoped registry of named handlers.

use super::builtin::{DeliveryLogHandler, MailNotifyHandler, DELIVERY_LOG, MAIL_NOTIFY};
use super::{AppContext, EventKind, Handler, HandlerDispatchTable};
use crate::error::{Result, SubscriptionError};
use crate::params::{keys, SubscriptionParameters};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a handler instance for one subscription.
pub type HandlerConstructor =
    Arc<dyn Fn(&SubscriptionParameters) -> Result<Arc<dyn Handler>> + Send + Sync>;

struct Entry {
    kinds: Vec<EventKind>,
    constructor: HandlerConstructor,
}

/// Named handler constructors, built once at startup.
///
/// Passed explicitly to the engine factory; there is no global lookup.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<String, Entry>,
    context: Arc<AppContext>,
}

impl HandlerRegistry {
    pub fn new(context: AppContext) -> Self {
        Self {
            entries: BTreeMap::new(),
            context: Arc::new(context),
        }
    }

    /// Registry preloaded with the built-in handlers.
    pub fn with_builtins(context: AppContext) -> Self {
        let mut registry = Self::new(context);
        registry.register(DELIVERY_LOG, &[EventKind::Success, EventKind::Failure], |params| {
            Ok(Arc::new(DeliveryLogHandler::from_params(params)?) as Arc<dyn Handler>)
        });
        registry.register(MAIL_NOTIFY, &[EventKind::Success], |params| {
            Ok(Arc::new(MailNotifyHandler::from_params(params)?) as Arc<dyn Handler>)
        });
        registry
    }

    /// Register (or replace) a named handler for `kinds`.
    pub fn register<F>(&mut self, name: &str, kinds: &[EventKind], constructor: F)
    where
        F: Fn(&SubscriptionParameters) -> Result<Arc<dyn Handler>> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Entry {
                kinds: kinds.to_vec(),
                constructor: Arc::new(constructor),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    /// Names a subscription asks for: the `handlers` list plus the built-ins
    /// implied by its logging and mail settings.
    pub fn selected_names(&self, params: &SubscriptionParameters) -> Vec<String> {
        let mut names = params.handler_names();
        if params.log_filename().is_some() && self.contains(DELIVERY_LOG) {
            names.push(DELIVERY_LOG.to_string());
        }
        if params.get_string(keys::MAIL_MESSAGE_TO).is_some() && self.contains(MAIL_NOTIFY) {
            names.push(MAIL_NOTIFY.to_string());
        }
        let mut unique = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        unique
    }

    /// Build the handlers `params` selects and install them into `table`.
    ///
    /// Fails without touching the table if any selected name is unknown or
    /// any constructor fails.
    pub fn install(&self, params: &SubscriptionParameters, table: &HandlerDispatchTable) -> Result<usize> {
        let mut built = Vec::new();
        for name in self.selected_names(params) {
            let entry = self
                .entries
                .get(&name)
                .ok_or_else(|| SubscriptionError::UnknownHandler(name.clone()))?;
            let handler = (entry.constructor)(params)?;
            built.push((entry.kinds.clone(), handler));
        }

        table.set_app_context(Arc::clone(&self.context));
        let count = built.len();
        for (kinds, handler) in built {
            debug!(handler = handler.name(), "installing handler");
            for kind in kinds {
                table.add(kind, Arc::clone(&handler));
            }
        }
        Ok(count)
    }
}
