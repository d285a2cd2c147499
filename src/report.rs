//! Per-engine report buffer and the outbound mail contract.
//!
//! Each engine appends a line for every delivered, failed or skipped item
//! (and for reconnect stalls). When `mail-report-to`/`mail-report-at` are
//! configured, the buffer is mailed once a day after the report time and
//! then cleared.

use crate::client::StallReporter;
use crate::error::Result;
use crate::params::{keys, SubscriptionParameters};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{info, warn};

/// Maximum buffered report lines; the oldest are dropped first.
const MAX_REPORT_LINES: usize = 10_000;

/// An outbound mail message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailMessage {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub smtp_host: Option<String>,
}

/// Outbound mail transport, provided by the embedding application.
pub trait MailTransport: Send + Sync {
    fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Split a comma separated recipient list.
pub fn recipients(list: &str) -> Vec<String> {
    list.split(',')
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect()
}

#[derive(Debug, Default)]
struct ReportState {
    lines: VecDeque<String>,
    dropped: usize,
    last_sent: Option<NaiveDate>,
}

/// Accumulates report lines for one engine.
#[derive(Debug)]
pub struct ReportBuffer {
    label: String,
    recipients: Vec<String>,
    sender: Option<String>,
    smtp_host: Option<String>,
    report_at: Option<NaiveTime>,
    state: Mutex<ReportState>,
}

impl ReportBuffer {
    /// A buffer that never mails (lines are still kept for inspection).
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            recipients: Vec::new(),
            sender: None,
            smtp_host: None,
            report_at: None,
            state: Mutex::new(ReportState::default()),
        }
    }

    /// Configure from the `mail-report-*` parameters.
    pub fn from_params(label: impl Into<String>, params: &SubscriptionParameters) -> Result<Self> {
        let mut buffer = Self::new(label);
        buffer.recipients = params
            .get_string(keys::MAIL_REPORT_TO)
            .map(|r| recipients(&r))
            .unwrap_or_default();
        buffer.sender = params.get_string(keys::MAIL_MESSAGE_FROM);
        buffer.smtp_host = params.get_string(keys::MAIL_SMTP_HOST);
        buffer.report_at = params.report_at()?;
        Ok(buffer)
    }

    pub fn append(&self, line: impl Into<String>) {
        let line = format!("{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), line.into());
        let mut state = self.state.lock();
        if state.lines.len() >= MAX_REPORT_LINES {
            state.lines.pop_front();
            state.dropped += 1;
        }
        state.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.lock().lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return all buffered lines.
    pub fn take(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.dropped = 0;
        state.lines.drain(..).collect()
    }

    /// Mail the buffer if the daily report time has passed.
    ///
    /// Returns true if a report was sent. On a transport failure the lines
    /// stay buffered for the next attempt.
    pub fn maybe_flush(&self, now: DateTime<Utc>, transport: Option<&dyn MailTransport>) -> Result<bool> {
        let (Some(report_at), Some(transport)) = (self.report_at, transport) else {
            return Ok(false);
        };
        if self.recipients.is_empty() || now.time() < report_at {
            return Ok(false);
        }

        let today = now.date_naive();
        let (lines, dropped) = {
            let state = self.state.lock();
            if state.last_sent == Some(today) || state.lines.is_empty() {
                return Ok(false);
            }
            (state.lines.iter().cloned().collect::<Vec<_>>(), state.dropped)
        };

        let mut body = lines.join("\n");
        if dropped > 0 {
            body.push_str(&format!("\n({dropped} older lines dropped)"));
        }
        let message = MailMessage {
            from: self.sender.clone(),
            to: self.recipients.clone(),
            subject: format!("Subscription report: {} ({} entries)", self.label, lines.len()),
            body,
            smtp_host: self.smtp_host.clone(),
        };

        if let Err(e) = transport.send(&message) {
            warn!(label = %self.label, error = %e, "report mail failed");
            return Err(e);
        }

        let mut state = self.state.lock();
        // Lines appended while sending stay for the next report.
        let sent = lines.len().min(state.lines.len());
        state.lines.drain(..sent);
        state.dropped = 0;
        state.last_sent = Some(today);
        info!(label = %self.label, entries = sent, "report mailed");
        Ok(true)
    }
}

impl StallReporter for ReportBuffer {
    fn on_stall(&self, endpoint: &str, wait: Duration, consecutive_failures: u32) {
        self.append(format!(
            "reconnect to {endpoint} stalled: waiting {}s after {consecutive_failures} failures",
            wait.as_secs()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<MailMessage>>);

    impl MailTransport for Outbox {
        fn send(&self, message: &MailMessage) -> Result<()> {
            self.0.lock().push(message.clone());
            Ok(())
        }
    }

    fn report_params() -> SubscriptionParameters {
        SubscriptionParameters::notification("RAW")
            .with(keys::MAIL_REPORT_TO, "ops@example.org, audit@example.org")
            .with(keys::MAIL_REPORT_AT, "06:00")
            .with(keys::MAIL_MESSAGE_FROM, "archive@example.org")
    }

    #[test]
    fn test_append_and_take() {
        let buffer = ReportBuffer::new("RAW");
        buffer.append("delivered a");
        buffer.append("delivered b");
        assert_eq!(buffer.len(), 2);
        assert!(buffer.lines()[0].ends_with("delivered a"));
        assert_eq!(buffer.take().len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_waits_for_report_time() {
        let buffer = ReportBuffer::from_params("RAW", &report_params()).unwrap();
        let outbox = Outbox::default();
        buffer.append("delivered a");

        let early = Utc.with_ymd_and_hms(2024, 3, 1, 5, 59, 0).unwrap();
        assert!(!buffer.maybe_flush(early, Some(&outbox)).unwrap());

        let later = Utc.with_ymd_and_hms(2024, 3, 1, 6, 1, 0).unwrap();
        assert!(buffer.maybe_flush(later, Some(&outbox)).unwrap());
        assert!(buffer.is_empty());

        let sent = outbox.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["ops@example.org", "audit@example.org"]);
        assert!(sent[0].body.contains("delivered a"));
    }

    #[test]
    fn test_flush_once_per_day() {
        let buffer = ReportBuffer::from_params("RAW", &report_params()).unwrap();
        let outbox = Outbox::default();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2024, 3, 2, 6, 30, 0).unwrap();

        buffer.append("one");
        assert!(buffer.maybe_flush(t1, Some(&outbox)).unwrap());
        buffer.append("two");
        assert!(!buffer.maybe_flush(t2, Some(&outbox)).unwrap());
        assert!(buffer.maybe_flush(t3, Some(&outbox)).unwrap());
        assert_eq!(outbox.0.lock().len(), 2);
    }

    #[test]
    fn test_no_transport_keeps_lines() {
        let buffer = ReportBuffer::from_params("RAW", &report_params()).unwrap();
        buffer.append("one");
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        assert!(!buffer.maybe_flush(t, None).unwrap());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_stall_reporter_appends() {
        let buffer = ReportBuffer::new("RAW");
        buffer.on_stall("https://archive.example/", Duration::from_secs(120), 6);
        assert!(buffer.lines()[0].contains("stalled"));
    }
}
