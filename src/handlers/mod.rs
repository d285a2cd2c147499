//! Pluggable consumers of delivered and failed files.
//!
//! Handlers are registered per subscription in a [`HandlerDispatchTable`],
//! keyed by [`EventKind`]. The engine dispatches after every delivery; a
//! failing handler is reported and skipped, never fatal.
//!
//! Named handlers are looked up in a [`HandlerRegistry`] that the
//! application builds once at startup and passes to the engine factory.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = HandlerRegistry::with_builtins(AppContext::new("feeder"));
//! registry.register("audit", &[EventKind::Success], |_params| {
//!     Ok(Arc::new(AuditHandler::default()) as Arc<dyn Handler>)
//! });
//! ```

pub mod builtin;
mod dispatch;
mod registry;

pub use dispatch::{DispatchReport, HandlerDispatchTable};
pub use registry::{HandlerConstructor, HandlerRegistry};

use crate::client::SharedClient;
use crate::error::Result;
use crate::report::MailTransport;
use crate::types::{FileResult, TaskType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Which delivery outcome a handler is registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Success,
    Failure,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Success => f.write_str("success"),
            EventKind::Failure => f.write_str("failure"),
        }
    }
}

/// Process-wide context handed to every handler.
#[derive(Clone, Default)]
pub struct AppContext {
    pub app_name: String,
    pub mail: Option<Arc<dyn MailTransport>>,
    pub properties: BTreeMap<String, String>,
}

impl AppContext {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    pub fn with_mail(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.mail = Some(transport);
        self
    }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("app_name", &self.app_name)
            .field("mail", &self.mail.is_some())
            .field("properties", &self.properties)
            .finish()
    }
}

/// A consumer of delivery events.
pub trait Handler: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    fn handle_event(&self, task_type: TaskType, results: &[FileResult]) -> Result<()>;

    /// Called whenever the engine's session client changes (None while
    /// reconnecting).
    fn set_client(&self, _client: Option<SharedClient>) {}

    fn set_app_context(&self, _context: Arc<AppContext>) {}

    /// Release resources; called when the handler leaves its table.
    fn destroy(&self) {}
}
