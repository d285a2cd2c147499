//! Per-subscription handler dispatch.

use super::{AppContext, EventKind, Handler};
use crate::client::SharedClient;
use crate::types::{FileResult, TaskType};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one dispatch round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that ran to completion.
    pub invoked: usize,
    /// (handler name, reason) for every handler that failed or panicked.
    pub failures: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct DispatchInner {
    handlers: BTreeMap<EventKind, Vec<Arc<dyn Handler>>>,
    client: Option<SharedClient>,
    context: Option<Arc<AppContext>>,
}

impl DispatchInner {
    /// Every distinct handler across all kinds.
    fn distinct(&self) -> Vec<Arc<dyn Handler>> {
        let mut seen: Vec<Arc<dyn Handler>> = Vec::new();
        for handler in self.handlers.values().flatten() {
            if !seen.iter().any(|h| Arc::ptr_eq(h, handler)) {
                seen.push(Arc::clone(handler));
            }
        }
        seen
    }

    fn registered_anywhere(&self, handler: &Arc<dyn Handler>) -> bool {
        self.handlers
            .values()
            .flatten()
            .any(|h| Arc::ptr_eq(h, handler))
    }
}

/// Maps event kinds to ordered handler lists.
///
/// Handlers are invoked outside the table lock, so a handler may safely
/// add or remove handlers while being dispatched.
#[derive(Default)]
pub struct HandlerDispatchTable {
    inner: RwLock<DispatchInner>,
}

impl HandlerDispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Returns false if it already was.
    pub fn add(&self, kind: EventKind, handler: Arc<dyn Handler>) -> bool {
        let (client, context) = {
            let mut inner = self.inner.write();
            let list = inner.handlers.entry(kind).or_default();
            if list.iter().any(|h| Arc::ptr_eq(h, &handler)) {
                return false;
            }
            list.push(Arc::clone(&handler));
            (inner.client.clone(), inner.context.clone())
        };
        handler.set_client(client);
        if let Some(context) = context {
            handler.set_app_context(context);
        }
        debug!(handler = handler.name(), %kind, "handler added");
        true
    }

    /// Unregister `handler` from `kind`; destroys it once it is no longer
    /// registered for any kind.
    pub fn remove(&self, kind: EventKind, handler: &Arc<dyn Handler>) -> bool {
        let orphaned = {
            let mut inner = self.inner.write();
            let Some(list) = inner.handlers.get_mut(&kind) else {
                return false;
            };
            let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
                return false;
            };
            list.remove(pos);
            !inner.registered_anywhere(handler)
        };
        if orphaned {
            handler.set_client(None);
            handler.destroy();
        }
        true
    }

    /// Remove and destroy every handler.
    pub fn clear(&self) {
        let handlers = {
            let mut inner = self.inner.write();
            let handlers = inner.distinct();
            inner.handlers.clear();
            handlers
        };
        for handler in handlers {
            handler.destroy();
        }
    }

    /// Handlers registered for `kind`, in registration order.
    pub fn handlers(&self, kind: EventKind) -> Vec<Arc<dyn Handler>> {
        self.inner
            .read()
            .handlers
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.inner.read().handlers.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().handlers.values().all(Vec::is_empty)
    }

    /// Update the shared client and hand it to every handler.
    pub fn set_client(&self, client: Option<SharedClient>) {
        let handlers = {
            let mut inner = self.inner.write();
            inner.client = client.clone();
            inner.distinct()
        };
        for handler in handlers {
            handler.set_client(client.clone());
        }
    }

    pub fn set_app_context(&self, context: Arc<AppContext>) {
        let handlers = {
            let mut inner = self.inner.write();
            inner.context = Some(Arc::clone(&context));
            inner.distinct()
        };
        for handler in handlers {
            handler.set_app_context(Arc::clone(&context));
        }
    }

    /// Invoke every handler registered for `kind`, in order.
    ///
    /// Errors and panics are caught per handler and collected in the report.
    pub fn dispatch(&self, kind: EventKind, task_type: TaskType, results: &[FileResult]) -> DispatchReport {
        let handlers = self.handlers(kind);
        let mut report = DispatchReport::default();

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle_event(task_type, results)));
            match outcome {
                Ok(Ok(())) => report.invoked += 1,
                Ok(Err(e)) => {
                    warn!(handler = handler.name(), %kind, error = %e, "handler failed");
                    report.failures.push((handler.name().to_string(), e.to_string()));
                }
                Err(panic) => {
                    let reason = panic_message(&panic);
                    warn!(handler = handler.name(), %kind, reason = %reason, "handler panicked");
                    report.failures.push((handler.name().to_string(), reason));
                }
            }
        }

        report
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
