//! Scripted archive used by the integration tests.

#![allow(dead_code)]

use archive_subscriber::client::share;
use archive_subscriber::{
    ClientSessionFactory, Connector, EngineFactory, FileResult, HandlerRegistry, ReconnectThrottle,
    Result, ResultCode, SessionClient, SessionOption, SessionTarget, SharedClient, SubscriptionError,
    ThrottleConfig, Timestamp, TransactionId,
};
use archive_subscriber::handlers::AppContext;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Install a test-friendly tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Archive state shared by every client the connector opens.
#[derive(Default)]
pub struct MockArchive {
    /// One entry per query, consumed in order; empty once exhausted.
    windows: Mutex<VecDeque<Vec<FileResult>>>,
    /// Login outcomes, consumed in order; `Ok` once exhausted.
    logins: Mutex<VecDeque<Result<()>>>,
    /// `since` of every query issued.
    pub queries: Mutex<Vec<Timestamp>>,
    /// Names passed to `get`.
    pub fetched: Mutex<Vec<String>>,
    /// This many upcoming `get` calls report a lost connection.
    failing_gets: Mutex<u32>,
    pub opened: Mutex<u32>,
    pub logouts: Mutex<u32>,
}

impl MockArchive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_window(&self, items: Vec<FileResult>) {
        self.windows.lock().push_back(items);
    }

    pub fn script_login(&self, outcome: Result<()>) {
        self.logins.lock().push_back(outcome);
    }

    pub fn fail_next_gets(&self, count: u32) {
        *self.failing_gets.lock() = count;
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }
}

pub struct MockClient {
    archive: Arc<MockArchive>,
    pending: VecDeque<FileResult>,
    logged_on: bool,
    next_transaction: u64,
}

impl MockClient {
    pub fn new(archive: Arc<MockArchive>) -> Self {
        Self {
            archive,
            pending: VecDeque::new(),
            logged_on: false,
            next_transaction: 0,
        }
    }

    fn transaction(&mut self) -> TransactionId {
        self.next_transaction += 1;
        TransactionId(self.next_transaction)
    }
}

impl SessionClient for MockClient {
    fn login(&mut self) -> Result<()> {
        let outcome = self.archive.logins.lock().pop_front().unwrap_or(Ok(()));
        self.logged_on = outcome.is_ok();
        outcome
    }

    fn logout(&mut self) {
        if self.logged_on {
            *self.archive.logouts.lock() += 1;
        }
        self.logged_on = false;
    }

    fn query_new_since(&mut self, since: Timestamp) -> TransactionId {
        self.archive.queries.lock().push(since);
        let window = self.archive.windows.lock().pop_front().unwrap_or_default();
        self.pending.extend(window);
        self.transaction()
    }

    fn get_result(&mut self, _timeout: Duration) -> Option<FileResult> {
        self.pending.pop_front()
    }

    fn get(&mut self, filenames: &[String]) -> TransactionId {
        for name in filenames {
            self.archive.fetched.lock().push(name.clone());
            {
                let mut failing = self.archive.failing_gets.lock();
                if *failing > 0 {
                    *failing -= 1;
                    self.pending
                        .push_back(FileResult::with_code(name.clone(), "RAW", ResultCode::IoError));
                    continue;
                }
            }
            self.pending.push_back(
                FileResult::ok(name.clone(), "RAW")
                    .with_size(128)
                    .with_local_path(format!("/data/raw/{name}")),
            );
        }
        self.transaction()
    }

    fn set(&mut self, _option: SessionOption, _value: &str) -> ResultCode {
        ResultCode::Ok
    }

    fn transaction_count(&self) -> usize {
        usize::from(!self.pending.is_empty())
    }

    fn is_logged_on(&self) -> bool {
        self.logged_on
    }
}

pub struct MockConnector {
    pub archive: Arc<MockArchive>,
}

impl Connector for MockConnector {
    fn open(&self, _target: &SessionTarget) -> Result<Box<dyn SessionClient>> {
        *self.archive.opened.lock() += 1;
        Ok(Box::new(MockClient::new(Arc::clone(&self.archive))))
    }
}

/// Connector for an unreachable archive.
pub struct Unreachable;

impl Connector for Unreachable {
    fn open(&self, _target: &SessionTarget) -> Result<Box<dyn SessionClient>> {
        Err(SubscriptionError::Connection("connection refused".into()))
    }
}

pub fn fast_throttle() -> Arc<ReconnectThrottle> {
    Arc::new(ReconnectThrottle::new(
        "mock",
        ThrottleConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..Default::default()
        },
    ))
}

pub struct Harness {
    pub archive: Arc<MockArchive>,
    pub sessions: Arc<ClientSessionFactory>,
    pub factory: Arc<EngineFactory>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(HandlerRegistry::with_builtins(AppContext::new("tests")))
    }

    pub fn with_registry(registry: HandlerRegistry) -> Self {
        let archive = MockArchive::new();
        let sessions = Arc::new(ClientSessionFactory::new(
            Arc::new(MockConnector {
                archive: Arc::clone(&archive),
            }),
            fast_throttle(),
        ));
        let factory = Arc::new(EngineFactory::new(Arc::new(registry), Arc::clone(&sessions)));
        Self {
            archive,
            sessions,
            factory,
        }
    }

    /// A logged-in client opened directly, bypassing the session factory.
    pub fn direct_client(&self) -> SharedClient {
        let mut client = MockClient::new(Arc::clone(&self.archive));
        client.login().unwrap();
        share(Box::new(client))
    }
}
