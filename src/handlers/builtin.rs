//! Built-in handlers: the rolling delivery log and mail notification.

use super::{AppContext, Handler};
use crate::error::{Result, SubscriptionError};
use crate::params::{keys, RollingPeriod, SubscriptionParameters};
use crate::report::{recipients, MailMessage};
use crate::types::{FileResult, TaskType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Registry name of [`DeliveryLogHandler`].
pub const DELIVERY_LOG: &str = "delivery-log";

/// Registry name of [`MailNotifyHandler`].
pub const MAIL_NOTIFY: &str = "mail-notify";

/// Path of the log file for the period containing `now`.
///
/// `deliveries.log` rolls daily into `deliveries.2024-03-01.log`, weekly
/// into `deliveries.2024-W09.log` and monthly into `deliveries.2024-03.log`.
pub fn rolled_path(base: &Path, period: RollingPeriod, now: DateTime<Utc>) -> PathBuf {
    let suffix = match period {
        RollingPeriod::None => return base.to_path_buf(),
        RollingPeriod::Daily => now.format("%Y-%m-%d").to_string(),
        RollingPeriod::Weekly => now.format("%G-W%V").to_string(),
        RollingPeriod::Monthly => now.format("%Y-%m").to_string(),
    };
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}.{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{suffix}"),
    };
    base.with_file_name(name)
}

/// Appends one line per delivered or failed file to `log-filename`.
pub struct DeliveryLogHandler {
    base: PathBuf,
    period: RollingPeriod,
    open: Mutex<Option<(PathBuf, File)>>,
}

impl DeliveryLogHandler {
    pub fn new(base: impl Into<PathBuf>, period: RollingPeriod) -> Self {
        Self {
            base: base.into(),
            period,
            open: Mutex::new(None),
        }
    }

    pub fn from_params(params: &SubscriptionParameters) -> Result<Self> {
        let base = params
            .log_filename()
            .ok_or_else(|| SubscriptionError::invalid(keys::LOG_FILENAME, "no log file configured"))?;
        Ok(Self::new(base, params.rolling_period()?))
    }

    /// Path the next line will be written to.
    pub fn current_path(&self) -> PathBuf {
        rolled_path(&self.base, self.period, Utc::now())
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let path = self.current_path();
        let mut open = self.open.lock();
        let reopen = !matches!(&*open, Some((current, _)) if *current == path);
        if reopen {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            *open = Some((path, file));
        }
        if let Some((_, file)) = open.as_mut() {
            for line in lines {
                writeln!(file, "{line}")?;
            }
            file.flush()?;
        }
        Ok(())
    }
}

impl Handler for DeliveryLogHandler {
    fn name(&self) -> &str {
        DELIVERY_LOG
    }

    fn handle_event(&self, task_type: TaskType, results: &[FileResult]) -> Result<()> {
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let lines: Vec<String> = results
            .iter()
            .map(|r| {
                format!(
                    "{now}\t{task_type}\t{:?}\t{}\t{}\t{}",
                    r.code,
                    r.name,
                    r.size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    r.local_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".into()),
                )
            })
            .collect();
        self.write_lines(&lines)
    }

    fn destroy(&self) {
        *self.open.lock() = None;
    }
}

/// Mails a short notice for every batch of newly available files.
pub struct MailNotifyHandler {
    from: Option<String>,
    to: Vec<String>,
    smtp_host: Option<String>,
    context: Mutex<Option<Arc<AppContext>>>,
}

impl MailNotifyHandler {
    pub fn from_params(params: &SubscriptionParameters) -> Result<Self> {
        let to = params
            .get_string(keys::MAIL_MESSAGE_TO)
            .map(|r| recipients(&r))
            .unwrap_or_default();
        if to.is_empty() {
            return Err(SubscriptionError::invalid(keys::MAIL_MESSAGE_TO, "no recipients"));
        }
        Ok(Self {
            from: params.get_string(keys::MAIL_MESSAGE_FROM),
            to,
            smtp_host: params.get_string(keys::MAIL_SMTP_HOST),
            context: Mutex::new(None),
        })
    }

    fn compose(&self, task_type: TaskType, results: &[FileResult]) -> MailMessage {
        let file_type = results.first().map(|r| r.file_type.as_str()).unwrap_or("");
        let verb = match task_type {
            TaskType::Subscription => "downloaded",
            _ => "available",
        };
        let body = results
            .iter()
            .map(|r| match &r.local_path {
                Some(path) => format!("{} -> {}", r.name, path.display()),
                None => r.name.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        MailMessage {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: format!("{} new {file_type} file(s) {verb}", results.len()),
            body,
            smtp_host: self.smtp_host.clone(),
        }
    }
}

impl Handler for MailNotifyHandler {
    fn name(&self) -> &str {
        MAIL_NOTIFY
    }

    fn handle_event(&self, task_type: TaskType, results: &[FileResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let transport = self
            .context
            .lock()
            .as_ref()
            .and_then(|c| c.mail.clone())
            .ok_or_else(|| SubscriptionError::Delivery("no mail transport configured".into()))?;
        transport.send(&self.compose(task_type, results))
    }

    fn set_app_context(&self, context: Arc<AppContext>) {
        *self.context.lock() = Some(context);
    }

    fn destroy(&self) {
        *self.context.lock() = None;
    }
}
