//! What an engine does with each file its query or notifier reports.

use crate::client::SharedClient;
use crate::types::{FileResult, ResultCode, TaskType};
use std::time::Duration;
use tracing::debug;

/// How long a single result may take to arrive.
pub const RESULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-item delivery behaviour, chosen from the task type.
pub trait DeliveryPolicy: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Whether the engine queries the archive at all.
    fn is_active(&self) -> bool {
        true
    }

    /// Turn a reported item into its final result.
    fn resolve(&self, client: &SharedClient, item: &FileResult) -> FileResult;
}

/// Subscription: fetch every reported file into the output directory.
#[derive(Debug, Default)]
pub struct Download;

impl DeliveryPolicy for Download {
    fn task_type(&self) -> TaskType {
        TaskType::Subscription
    }

    fn resolve(&self, client: &SharedClient, item: &FileResult) -> FileResult {
        if !item.code.is_ok() {
            return item.clone();
        }
        let mut client = client.lock();
        let transaction = client.get(std::slice::from_ref(&item.name));
        debug!(file = %item.name, ?transaction, "fetch started");

        let mut outcome = None;
        while let Some(result) = client.get_result(RESULT_TIMEOUT) {
            if result.name == item.name || outcome.is_none() {
                outcome = Some(result);
            }
        }
        outcome.unwrap_or_else(|| {
            FileResult::with_code(item.name.clone(), item.file_type.clone(), ResultCode::Failure)
                .with_message("fetch produced no result")
        })
    }
}

/// Notification: report the file as found, nothing is fetched.
#[derive(Debug, Default)]
pub struct Surface;

impl DeliveryPolicy for Surface {
    fn task_type(&self) -> TaskType {
        TaskType::Notification
    }

    fn resolve(&self, _client: &SharedClient, item: &FileResult) -> FileResult {
        item.clone()
    }
}

/// Engine for a missing or unknown task type: runs, never queries.
#[derive(Debug, Default)]
pub struct Idle;

impl DeliveryPolicy for Idle {
    fn task_type(&self) -> TaskType {
        TaskType::Null
    }

    fn is_active(&self) -> bool {
        false
    }

    fn resolve(&self, _client: &SharedClient, item: &FileResult) -> FileResult {
        FileResult::with_code(item.name.clone(), item.file_type.clone(), ResultCode::NoMatch)
    }
}

/// The policy for `task_type`.
pub fn for_task(task_type: TaskType) -> Box<dyn DeliveryPolicy> {
    match task_type {
        TaskType::Subscription => Box::new(Download),
        TaskType::Notification => Box::new(Surface),
        TaskType::Null => Box::new(Idle),
    }
}
