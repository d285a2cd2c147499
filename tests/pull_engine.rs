//! Integration tests for pull-mode engines against a scripted archive.

mod common;

use archive_subscriber::handlers::AppContext;
use archive_subscriber::{
    keys, EngineEvent, EventKind, FileResult, Handler, HandlerRegistry, MailMessage, MailTransport, Result,
    ResultCode, SubscriptionError, SubscriptionParameters, SubscriptionState, TaskType, Timestamp,
};
use common::{init_tracing, wait_until, Harness};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);

fn names(files: &[archive_subscriber::DeliveredFile]) -> Vec<String> {
    files.iter().map(|f| f.result.name.clone()).collect()
}

fn raw(name: &str) -> FileResult {
    FileResult::ok(name, "RAW")
}

/// Records every dispatch it receives.
struct Recorder {
    name: &'static str,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Handler for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn handle_event(&self, _task_type: TaskType, results: &[FileResult]) -> Result<()> {
        self.seen
            .lock()
            .extend(results.iter().map(|r| r.name.clone()));
        Ok(())
    }
}

// --- Polling ---

#[test]
fn test_pull_cycle_delivers_and_advances_window() {
    init_tracing();
    let harness = Harness::new();
    harness.archive.script_window(vec![raw("a"), raw("b")]);

    let params = SubscriptionParameters::notification("RAW").with(keys::INTERVAL, 1);
    let engine = harness.factory.build(params, None).unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || harness.archive.query_count() >= 3));
    assert_eq!(names(&engine.history()), vec!["a", "b"]);
    assert_ne!(engine.state(), SubscriptionState::Error);

    let queries = harness.archive.queries.lock().clone();
    assert_eq!(queries[0], Timestamp::EPOCH);
    assert!(queries[1] > Timestamp::EPOCH);
    assert!(queries[2] >= queries[1]);

    engine.terminate();
    engine.join();
    assert_eq!(engine.state(), SubscriptionState::Terminated);
    assert!(engine.ended().is_some());
    assert_eq!(*harness.archive.logouts.lock(), 1);
}

#[test]
fn test_connection_loss_repairs_and_reissues_window() {
    init_tracing();
    let harness = Harness::new();
    harness.archive.script_window(vec![
        raw("a"),
        FileResult::with_code("x", "RAW", ResultCode::IoError),
    ]);
    harness.archive.script_window(vec![raw("a"), raw("b")]);

    let params = SubscriptionParameters::notification("RAW").with(keys::INTERVAL, 60);
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    let (_, events) = engine.subscribe_channel();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.history_len() == 3));
    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Running));

    // At-least-once: the interrupted window is issued again from the same start.
    assert_eq!(names(&engine.history()), vec!["a", "a", "b"]);
    let queries = harness.archive.queries.lock().clone();
    assert_eq!(queries, vec![Timestamp::EPOCH, Timestamp::EPOCH]);
    assert_eq!(harness.sessions.build_count(), 1);

    let mut states = Vec::new();
    while states.len() < 5 {
        match events.recv_timeout(TIMEOUT) {
            Ok(EngineEvent::StateChanged { to, .. }) => states.push(to),
            Ok(_) => {}
            Err(e) => panic!("missing state change: {e}"),
        }
    }
    assert_eq!(
        states,
        vec![
            SubscriptionState::Running,
            SubscriptionState::Busy,
            SubscriptionState::Repair,
            SubscriptionState::Busy,
            SubscriptionState::Running,
        ]
    );

    engine.terminate();
    engine.join();
}

#[test]
fn test_subscription_downloads_into_output_directory() {
    init_tracing();
    let harness = Harness::new();
    harness.archive.script_window(vec![raw("a.dat")]);

    let params = SubscriptionParameters::subscription("RAW", "/data/raw");
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.history_len() == 1));
    let delivered = engine.history().remove(0);
    assert_eq!(delivered.result.local_path, Some(PathBuf::from("/data/raw/a.dat")));
    assert_eq!(delivered.result.size, Some(128));
    assert_eq!(*harness.archive.fetched.lock(), vec!["a.dat".to_string()]);

    engine.terminate();
    engine.join();
}

// --- Routing ---

#[test]
fn test_results_routed_by_code() {
    init_tracing();
    let successes = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new(AppContext::new("tests"));
    {
        let seen = Arc::clone(&successes);
        registry.register("audit-ok", &[EventKind::Success], move |_| {
            Ok(Arc::new(Recorder {
                name: "audit-ok",
                seen: Arc::clone(&seen),
            }) as Arc<dyn Handler>)
        });
    }
    {
        let seen = Arc::clone(&failures);
        registry.register("audit-failed", &[EventKind::Failure], move |_| {
            Ok(Arc::new(Recorder {
                name: "audit-failed",
                seen: Arc::clone(&seen),
            }) as Arc<dyn Handler>)
        });
    }

    let harness = Harness::with_registry(registry);
    harness.archive.script_window(vec![
        raw("a"),
        FileResult::with_code("b", "RAW", ResultCode::FileNotFound),
        FileResult::with_code("c", "RAW", ResultCode::FileExists),
        FileResult::with_code("d", "RAW", ResultCode::NoMatch),
        FileResult::with_code("e", "RAW", ResultCode::Failure).with_message("checksum"),
    ]);

    let params = SubscriptionParameters::notification("RAW")
        .with(keys::INTERVAL, 60)
        .with(keys::HANDLERS, "audit-ok,audit-failed");
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || failures.lock().len() == 2));
    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Running));
    assert_eq!(*successes.lock(), vec!["a".to_string()]);
    assert_eq!(*failures.lock(), vec!["b".to_string(), "e".to_string()]);
    assert_eq!(names(&engine.history()), vec!["a"]);

    let report = engine.report().lines();
    assert!(report.iter().any(|l| l.starts_with("skipped c")));
    assert!(report.iter().any(|l| l.starts_with("skipped d")));
    assert!(report.iter().any(|l| l.starts_with("failed e")));

    engine.terminate();
    engine.join();
}

#[test]
fn test_delivery_log_written() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("deliveries.log");

    let harness = Harness::new();
    harness.archive.script_window(vec![raw("a"), raw("b")]);
    let params = SubscriptionParameters::notification("RAW")
        .with(keys::INTERVAL, 60)
        .with(keys::LOG_FILENAME, log.display().to_string());
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.history_len() == 2));
    engine.terminate();
    engine.join();

    let contents = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\tnotification\tOk\ta\t"));
    assert!(lines[1].contains("\tnotification\tOk\tb\t"));
}

// --- Invocation ---

#[test]
fn test_invocation_failure_skips_item() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("invoked.txt");

    let harness = Harness::new();
    harness.archive.script_window(vec![raw("a.dat"), raw("b.dat")]);
    let params = SubscriptionParameters::notification("RAW")
        .with(keys::INTERVAL, 60)
        .with(
            keys::INVOKE_COMMAND,
            format!("test {{file}} != a.dat && echo {{file}} >> {}", out.display()),
        );
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.history_len() == 1));
    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Running));
    assert_eq!(names(&engine.history()), vec!["b.dat"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "b.dat\n");
    assert!(engine
        .report()
        .lines()
        .iter()
        .any(|l| l.starts_with("invocation failed for a.dat")));

    engine.terminate();
    engine.join();
}

#[test]
fn test_invocation_failure_stops_engine_with_exit_on_error() {
    init_tracing();
    let harness = Harness::new();
    harness.archive.script_window(vec![raw("a.dat"), raw("b.dat")]);
    let params = SubscriptionParameters::notification("RAW")
        .with(keys::INVOKE_COMMAND, "exit 3")
        .with(keys::INVOKE_EXIT_ON_ERROR, true);
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Error));
    engine.join();
    assert_eq!(engine.history_len(), 0);
    assert!(engine.ended().is_some());
    assert!(engine
        .report()
        .lines()
        .iter()
        .any(|l| l.starts_with("engine stopped")));
}

// --- Connection setup ---

#[test]
fn test_authentication_failure_is_fatal() {
    init_tracing();
    let harness = Harness::new();
    harness
        .archive
        .script_login(Err(SubscriptionError::Authentication("bad password".into())));

    let params = SubscriptionParameters::notification("RAW");
    let engine = harness.factory.build(params, None).unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Error));
    engine.join();
    assert_eq!(harness.sessions.build_count(), 1);
    assert_eq!(harness.archive.query_count(), 0);
}

#[test]
fn test_transient_login_failures_are_retried() {
    init_tracing();
    let harness = Harness::new();
    harness
        .archive
        .script_login(Err(SubscriptionError::Connection("reset".into())));
    harness
        .archive
        .script_login(Err(SubscriptionError::Connection("reset".into())));
    harness.archive.script_window(vec![raw("a")]);

    let params = SubscriptionParameters::notification("RAW").with(keys::INTERVAL, 60);
    let engine = harness.factory.build(params, None).unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.history_len() == 1));
    assert_eq!(*harness.archive.opened.lock(), 3);
    assert_eq!(harness.sessions.throttle().consecutive_failures(), 0);

    engine.terminate();
    engine.join();
}

// --- Control ---

#[test]
fn test_pause_and_resume() {
    init_tracing();
    let harness = Harness::new();
    let params = SubscriptionParameters::notification("RAW").with(keys::INTERVAL, 1);
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();
    assert!(wait_until(TIMEOUT, || harness.archive.query_count() >= 1));

    engine.set_paused(true);
    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Paused));
    let paused_at = harness.archive.query_count();
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(harness.archive.query_count(), paused_at);

    engine.set_paused(false);
    assert!(wait_until(TIMEOUT, || harness.archive.query_count() > paused_at));
    assert_ne!(engine.state(), SubscriptionState::Paused);

    engine.terminate();
    engine.join();
    assert_eq!(engine.state(), SubscriptionState::Terminated);
}

#[test]
fn test_terminate_while_paused() {
    init_tracing();
    let harness = Harness::new();
    let params = SubscriptionParameters::notification("RAW").with(keys::INTERVAL, 1);
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.set_paused(true);
    engine.start().unwrap();
    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Paused));

    engine.terminate();
    engine.join();
    assert_eq!(engine.state(), SubscriptionState::Terminated);
    assert_eq!(harness.archive.query_count(), 0);
}

#[test]
fn test_null_engine_idles_until_terminated() {
    init_tracing();
    let harness = Harness::new();
    let params = SubscriptionParameters::new().with(keys::FILE_TYPE, "RAW");
    let engine = harness.factory.build(params, None).unwrap();
    assert_eq!(engine.task_type(), TaskType::Null);
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Running));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*harness.archive.opened.lock(), 0);

    engine.terminate();
    engine.join();
    assert_eq!(engine.state(), SubscriptionState::Terminated);
}

#[test]
fn test_interval_beyond_clock_range_waits_for_terminate() {
    init_tracing();
    let harness = Harness::new();
    harness.archive.script_window(vec![raw("a")]);
    let params = SubscriptionParameters::notification("RAW").with(keys::INTERVAL, i64::MAX);
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || engine.history_len() == 1));
    assert!(wait_until(TIMEOUT, || engine.state() == SubscriptionState::Running));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(harness.archive.query_count(), 1);

    engine.terminate();
    engine.join();
    assert_eq!(engine.state(), SubscriptionState::Terminated);
    assert!(engine.ended().is_some());
    assert_eq!(*harness.archive.logouts.lock(), 1);
    assert_eq!(harness.sessions.throttle().reporter_count(), 0);
}

/// Counts how often it is destroyed.
struct Counting {
    destroyed: Arc<AtomicUsize>,
}

impl Handler for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn handle_event(&self, _task_type: TaskType, _results: &[FileResult]) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_terminate_destroys_handlers() {
    init_tracing();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new(AppContext::new("tests"));
    {
        let destroyed = Arc::clone(&destroyed);
        registry.register("counting", &[EventKind::Success, EventKind::Failure], move |_| {
            Ok(Arc::new(Counting {
                destroyed: Arc::clone(&destroyed),
            }) as Arc<dyn Handler>)
        });
    }
    let harness = Harness::with_registry(registry);
    let params = SubscriptionParameters::notification("RAW")
        .with(keys::INTERVAL, 60)
        .with(keys::HANDLERS, "counting");
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    assert!(!engine.handlers().is_empty());
    engine.start().unwrap();
    assert!(wait_until(TIMEOUT, || harness.archive.query_count() == 1));

    engine.terminate();
    engine.join();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(engine.handlers().is_empty());

    // Releasing again finds nothing left to destroy.
    engine.terminate();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_abandoned_engine_detaches_stall_reporter() {
    init_tracing();
    let harness = Harness::new();
    let throttle = Arc::clone(harness.sessions.throttle());
    assert_eq!(throttle.reporter_count(), 0);

    let engine = harness
        .factory
        .build(SubscriptionParameters::notification("RAW"), None)
        .unwrap();
    assert_eq!(throttle.reporter_count(), 1);
    drop(engine);
    assert_eq!(throttle.reporter_count(), 0);
}

// --- Reporting ---

#[derive(Default)]
struct Outbox(Mutex<Vec<MailMessage>>);

impl MailTransport for Outbox {
    fn send(&self, message: &MailMessage) -> Result<()> {
        self.0.lock().push(message.clone());
        Ok(())
    }
}

#[test]
fn test_daily_report_mailed_after_cycle() {
    init_tracing();
    let outbox = Arc::new(Outbox::default());
    let registry =
        HandlerRegistry::with_builtins(AppContext::new("tests").with_mail(outbox.clone()));
    let harness = Harness::with_registry(registry);
    harness.archive.script_window(vec![raw("a")]);

    let params = SubscriptionParameters::notification("RAW")
        .with(keys::INTERVAL, 60)
        .with(keys::MAIL_REPORT_TO, "ops@example.org")
        .with(keys::MAIL_REPORT_AT, "00:00");
    let engine = harness
        .factory
        .build(params, Some(harness.direct_client()))
        .unwrap();
    engine.start().unwrap();

    assert!(wait_until(TIMEOUT, || !outbox.0.lock().is_empty()));
    let sent = outbox.0.lock()[0].clone();
    assert_eq!(sent.to, vec!["ops@example.org".to_string()]);
    assert!(sent.body.contains("delivered a"));
    assert!(wait_until(TIMEOUT, || engine.report().is_empty()));

    engine.terminate();
    engine.join();
}
