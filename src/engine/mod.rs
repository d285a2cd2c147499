//! # Subscription engine
//!
//! One [`SubscriptionEngine`] drives one subscription on its own thread:
//!
//! - **Pull** engines query "new since the last completed window" every
//!   `interval` seconds.
//! - **Push** engines drain a [`push::PushQueue`] fed by an external
//!   [`push::PushNotifier`].
//!
//! Each reported item is resolved by the engine's [`policy::DeliveryPolicy`]
//! (download, surface, or nothing) and routed on its result code:
//!
//! | code                          | outcome                               |
//! |-------------------------------|---------------------------------------|
//! | `Ok`                          | invoke command, success handlers, history |
//! | `FileExists`, `NoMatch`       | skipped                               |
//! | `IoError`                     | connection lost: Repair, then retry   |
//!
//! A push event that still reports `IoError` after its Repair goes to the
//! failure handlers and leaves the queue.
//! | `FileNotFound`, `Failure`     | failure handlers                      |
//!
//! A lost connection moves the engine `Busy -> Repair -> Busy` while the
//! [`ClientSessionFactory`] rebuilds the session; the interrupted pull
//! window is then issued again, so delivery is at-least-once.

pub mod events;
pub mod factory;
pub mod invoke;
pub mod policy;
pub mod push;
mod state;

pub use events::{EngineEvent, EventBus, ObserverId};
pub use factory::{EngineConfig, EngineFactory};
pub use state::SubscriptionState;

use crate::client::{ClientSessionFactory, SharedClient, StallReporter};
use crate::error::{Result, SubscriptionError};
use crate::handlers::{AppContext, EventKind, HandlerDispatchTable};
use crate::params::{keys, ParamValue, SubscriptionIdentity, SubscriptionParameters, DEFAULT_INTERVAL};
use crate::report::ReportBuffer;
use crate::signal::{ControlSignal, Wake};
use crate::types::{display_id, DeliveredFile, EngineId, FileResult, ResultCode, TaskType, Timestamp};
use chrono::Utc;
use crossbeam_channel::Receiver;
use invoke::Invocation;
use parking_lot::{Mutex, RwLock};
use policy::{DeliveryPolicy, RESULT_TIMEOUT};
use push::{AckCache, NotifierFactory, PushNotifier, PushQueue};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long a push engine naps while its queue is empty.
const PUSH_NAP: Duration = Duration::from_millis(250);

/// How long a null engine sleeps between pause/terminate checks.
const IDLE_NAP: Duration = Duration::from_secs(60);

/// Outcome of delivering one item.
enum Step {
    Done,
    ConnectionLost,
}

/// Everything an engine is assembled from; produced by [`EngineFactory`].
pub(crate) struct EngineParts {
    pub params: SubscriptionParameters,
    pub policy: Box<dyn DeliveryPolicy>,
    pub sessions: Arc<ClientSessionFactory>,
    pub handlers: HandlerDispatchTable,
    pub notifiers: Option<Arc<dyn NotifierFactory>>,
    pub report: Arc<ReportBuffer>,
    pub context: Arc<AppContext>,
    pub client: Option<SharedClient>,
    pub config: EngineConfig,
}

/// A single subscription or notification.
pub struct SubscriptionEngine {
    id: OnceLock<EngineId>,
    params: RwLock<SubscriptionParameters>,
    task_type: TaskType,
    push: bool,
    policy: Box<dyn DeliveryPolicy>,

    state: Mutex<SubscriptionState>,
    created: Timestamp,
    started: Mutex<Option<Timestamp>>,
    ended: Mutex<Option<Timestamp>>,
    history: Mutex<Vec<DeliveredFile>>,
    last_query: Mutex<Timestamp>,
    /// Repairs since the last item or window was completed.
    repair_streak: AtomicU32,

    client: Mutex<Option<SharedClient>>,
    sessions: Arc<ClientSessionFactory>,
    handlers: HandlerDispatchTable,
    events: Arc<EventBus<EngineEvent>>,
    control: Arc<ControlSignal>,

    notifiers: Option<Arc<dyn NotifierFactory>>,
    notifier: Mutex<Option<Arc<dyn PushNotifier>>>,
    queue: PushQueue,
    acked: AckCache,

    report: Arc<ReportBuffer>,
    stall_reporter: Arc<dyn StallReporter>,
    context: Arc<AppContext>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    pub(crate) fn new(parts: EngineParts) -> Arc<Self> {
        let control = Arc::new(ControlSignal::new());
        let queue = PushQueue::with_signal(parts.config.queue_capacity, Arc::clone(&control));
        if parts.client.is_some() {
            parts.handlers.set_client(parts.client.clone());
        }
        let stall_reporter: Arc<dyn StallReporter> = parts.report.clone();
        parts.sessions.throttle().add_reporter(Arc::clone(&stall_reporter));

        Arc::new(Self {
            id: OnceLock::new(),
            task_type: parts.params.task_type(),
            push: parts.params.is_push(),
            params: RwLock::new(parts.params),
            policy: parts.policy,
            state: Mutex::new(SubscriptionState::Initialized),
            created: Timestamp::now(),
            started: Mutex::new(None),
            ended: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            last_query: Mutex::new(Timestamp::EPOCH),
            repair_streak: AtomicU32::new(0),
            client: Mutex::new(parts.client),
            sessions: parts.sessions,
            handlers: parts.handlers,
            events: Arc::new(EventBus::new()),
            control,
            notifiers: parts.notifiers,
            notifier: Mutex::new(None),
            queue,
            acked: AckCache::new(parts.config.ack_capacity),
            report: parts.report,
            stall_reporter,
            context: parts.context,
            thread: Mutex::new(None),
        })
    }

    // --- Identity ---

    /// Assigned id, `None` until the engine joins a manager.
    pub fn id(&self) -> Option<EngineId> {
        self.id.get().copied()
    }

    /// Assign the id; fails if one was already assigned.
    pub(crate) fn assign_id(&self, id: EngineId) -> bool {
        self.id.set(id).is_ok()
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn identity(&self) -> SubscriptionIdentity {
        self.params.read().identity()
    }

    /// The file type being watched.
    pub fn source(&self) -> String {
        self.params.read().file_type().unwrap_or_default()
    }

    /// Output directory (as displayed).
    pub fn target(&self) -> String {
        self.identity().target
    }

    pub fn is_push(&self) -> bool {
        self.push
    }

    pub fn is_keep_alive(&self) -> bool {
        self.params.read().is_keep_alive()
    }

    /// A copy of the current parameters.
    pub fn parameters(&self) -> SubscriptionParameters {
        self.params.read().clone()
    }

    /// Change one parameter. Identity keys are locked once started.
    pub fn update_parameter(&self, key: &str, value: impl Into<ParamValue>) -> Result<()> {
        self.params.write().set(key, value)
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn started(&self) -> Option<Timestamp> {
        *self.started.lock()
    }

    pub fn ended(&self) -> Option<Timestamp> {
        *self.ended.lock()
    }

    // --- State ---

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    /// Attempt a state transition and return the resulting state.
    ///
    /// A rejected transition leaves the state unchanged and emits nothing.
    pub fn transition(&self, target: SubscriptionState) -> SubscriptionState {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition_to(target) {
                debug!(engine = %display_id(self.id()), %from, %target, "transition rejected");
                return from;
            }
            *state = target;
            from
        };
        debug!(engine = %display_id(self.id()), %from, to = %target, "state changed");
        self.events.emit(&EngineEvent::StateChanged {
            id: self.id(),
            from,
            to: target,
        });
        target
    }

    // --- History ---

    pub fn history(&self) -> Vec<DeliveredFile> {
        self.history.lock().clone()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
        self.events.emit(&EngineEvent::HistoryCleared { id: self.id() });
    }

    /// Start of the next pull window.
    pub fn last_query(&self) -> Timestamp {
        *self.last_query.lock()
    }

    /// Seed the next pull window (used when resuming a persisted session).
    pub fn set_last_query(&self, at: Timestamp) {
        *self.last_query.lock() = at;
    }

    // --- Client ---

    pub fn client(&self) -> Option<SharedClient> {
        self.client.lock().clone()
    }

    /// Replace the session client and hand it to every handler.
    pub fn set_client(&self, client: Option<SharedClient>) {
        let connected = client.is_some();
        *self.client.lock() = client.clone();
        self.handlers.set_client(client);
        self.events.emit(&EngineEvent::ClientChanged {
            id: self.id(),
            connected,
        });
    }

    // --- Collaborators ---

    pub fn handlers(&self) -> &HandlerDispatchTable {
        &self.handlers
    }

    pub fn report(&self) -> &ReportBuffer {
        &self.report
    }

    /// Queue fed by the push notifier.
    pub fn push_queue(&self) -> &PushQueue {
        &self.queue
    }

    // --- Observers ---

    pub fn subscribe<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(observer)
    }

    pub fn subscribe_channel(&self) -> (ObserverId, Receiver<EngineEvent>) {
        self.events.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.events.unsubscribe(id)
    }

    // --- Control ---

    pub fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Start the engine thread. Only an `Initialized` engine can start.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut thread = self.thread.lock();
        let state = self.state();
        if thread.is_some() || state != SubscriptionState::Initialized {
            return Err(SubscriptionError::NotStartable(format!(
                "engine {} is {state}",
                display_id(self.id())
            )));
        }

        self.params.write().freeze();
        *self.started.lock() = Some(Timestamp::now());

        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("subscription-{}", display_id(self.id())))
            .spawn(move || engine.run())?;
        *thread = Some(handle);
        Ok(())
    }

    /// Request termination.
    ///
    /// The state moves to `Terminated` at once; the engine thread notices at
    /// its next checkpoint and releases the session. Use [`Self::join`] (or
    /// a state observer) to wait for it.
    pub fn terminate(&self) {
        self.control.terminate();
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier.close();
        }
        self.transition(SubscriptionState::Terminated);
        if self.thread.lock().is_none() {
            self.release();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }

    /// Wait for the engine thread to exit. No-op from the engine's own thread.
    pub fn join(&self) {
        let handle = {
            let mut thread = self.thread.lock();
            match thread.as_ref() {
                Some(h) if h.thread().id() == thread::current().id() => return,
                _ => thread.take(),
            }
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(engine = %display_id(self.id()), "engine thread panicked");
            }
        }
    }

    // --- Engine thread ---

    fn run(self: Arc<Self>) {
        let engine = display_id(self.id());
        if self.transition(SubscriptionState::Running) != SubscriptionState::Running {
            self.release();
            return;
        }
        info!(engine = %engine, identity = %self.identity(), push = self.push, "engine started");

        let outcome = if !self.policy.is_active() {
            self.idle()
        } else {
            self.connect().and_then(|()| {
                if self.push {
                    self.push_loop()
                } else {
                    self.pull_loop()
                }
            })
        };

        match outcome {
            Ok(()) | Err(SubscriptionError::Interrupted) => {}
            Err(e) => {
                error!(engine = %engine, error = %e, "engine failed");
                self.report.append(format!("engine stopped: {e}"));
                self.transition(SubscriptionState::Error);
            }
        }
        self.release();
        if self.control.is_terminated() {
            self.transition(SubscriptionState::Terminated);
        }
        info!(engine = %engine, state = %self.state(), "engine stopped");
    }

    /// Close the notifier, destroy the handlers, log out and stamp the end
    /// time. Idempotent.
    fn release(&self) {
        let notifier = self.notifier.lock().take();
        if let Some(notifier) = notifier {
            notifier.close();
        }
        self.handlers.clear();
        if let Some(client) = self.client() {
            let mut client = client.lock();
            if client.is_logged_on() {
                client.logout();
            }
        }
        self.sessions.throttle().remove_reporter(&self.stall_reporter);
        let mut ended = self.ended.lock();
        if ended.is_none() {
            *ended = Some(Timestamp::now());
        }
    }

    /// Honour terminate and pause requests.
    fn checkpoint(&self) -> Result<()> {
        if self.control.is_terminated() || self.state().is_terminal() {
            return Err(SubscriptionError::Interrupted);
        }
        if self.control.is_paused() && self.transition(SubscriptionState::Paused) == SubscriptionState::Paused {
            info!(engine = %display_id(self.id()), "engine paused");
            if !self.control.wait_while_paused() {
                return Err(SubscriptionError::Interrupted);
            }
            if self.transition(SubscriptionState::Running) != SubscriptionState::Running {
                return Err(SubscriptionError::Interrupted);
            }
            info!(engine = %display_id(self.id()), "engine resumed");
        }
        Ok(())
    }

    /// Enter `target`, or stop if the engine was terminated meanwhile.
    fn enter(&self, target: SubscriptionState) -> Result<()> {
        if self.transition(target) == target {
            Ok(())
        } else {
            Err(SubscriptionError::Interrupted)
        }
    }

    fn connect(&self) -> Result<()> {
        if self.client().is_some() {
            return Ok(());
        }
        let params = self.parameters();
        let client = self.sessions.build(&params, Some(&self.control))?;
        self.set_client(Some(client));
        Ok(())
    }

    /// Rebuild a lost session: `Busy -> Repair -> Busy`.
    ///
    /// Back-to-back repairs with nothing completed in between back off on
    /// the throttle's schedule even though each rebuild itself succeeds.
    fn repair(&self) -> Result<()> {
        let prior = self.state();
        self.enter(SubscriptionState::Repair)?;
        warn!(engine = %display_id(self.id()), "connection lost, rebuilding session");
        self.report.append("connection lost, reconnecting");

        let streak = self.repair_streak.fetch_add(1, Ordering::SeqCst);
        if streak > 0 {
            let delay = self.sessions.throttle().delay_for(streak);
            debug!(engine = %display_id(self.id()), streak, ?delay, "repeated repair, backing off");
            if self.control.wait_uninterrupted_by_pause(delay) == Wake::Terminated {
                return Err(SubscriptionError::Interrupted);
            }
        }

        let old = self.client.lock().take();
        if let Some(old) = old {
            let mut old = old.lock();
            if old.is_logged_on() {
                old.logout();
            }
        }
        self.set_client(None);

        let params = self.parameters();
        let client = self.sessions.build(&params, Some(&self.control))?;
        self.set_client(Some(client));
        info!(engine = %display_id(self.id()), "session rebuilt");
        self.enter(prior)
    }

    fn current_client(&self) -> Result<SharedClient> {
        match self.client() {
            Some(client) => Ok(client),
            None => {
                self.connect()?;
                self.client()
                    .ok_or_else(|| SubscriptionError::Connection("no session client".into()))
            }
        }
    }

    fn idle(&self) -> Result<()> {
        debug!(engine = %display_id(self.id()), "no task type, idling");
        loop {
            self.checkpoint()?;
            if self.control.wait(IDLE_NAP) == Wake::Terminated {
                return Err(SubscriptionError::Interrupted);
            }
        }
    }

    fn pull_loop(&self) -> Result<()> {
        loop {
            self.checkpoint()?;
            let cycle_start = Instant::now();
            let interval = self.params.read().interval().unwrap_or(DEFAULT_INTERVAL);

            self.enter(SubscriptionState::Busy)?;
            let window = self.last_query();
            let issued = Timestamp::now();
            self.process_window(window)?;
            self.repair_streak.store(0, Ordering::SeqCst);

            self.set_last_query(issued);
            self.events.emit(&EngineEvent::QueryCompleted {
                id: self.id(),
                at: issued,
            });
            self.enter(SubscriptionState::Running)?;
            self.flush_report();

            // An interval past the clock's range waits for terminate or pause.
            let deadline = cycle_start.checked_add(interval);
            loop {
                let wait = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        deadline - now
                    }
                    None => IDLE_NAP,
                };
                match self.control.wait(wait) {
                    Wake::Terminated => return Err(SubscriptionError::Interrupted),
                    Wake::Paused => break,
                    Wake::Elapsed if deadline.is_some() => break,
                    Wake::Elapsed | Wake::Nudged => continue,
                }
            }
        }
    }

    /// Query one window and deliver every item, reissuing the whole window
    /// after a reconnect.
    fn process_window(&self, since: Timestamp) -> Result<()> {
        'window: loop {
            let client = self.current_client()?;
            let items = {
                let mut session = client.lock();
                let transaction = session.query_new_since(since);
                debug!(engine = %display_id(self.id()), ?transaction, %since, "query issued");
                let mut items = Vec::new();
                while let Some(item) = session.get_result(RESULT_TIMEOUT) {
                    items.push(item);
                }
                items
            };
            debug!(engine = %display_id(self.id()), count = items.len(), "query drained");

            for item in &items {
                if self.control.is_terminated() {
                    return Err(SubscriptionError::Interrupted);
                }
                if let Step::ConnectionLost = self.deliver(&client, item)? {
                    self.repair()?;
                    continue 'window;
                }
            }
            return Ok(());
        }
    }

    fn push_loop(&self) -> Result<()> {
        self.ensure_notifier()?;
        // Sequence number of the event whose connection loss caused the last repair.
        let mut repaired_for: Option<u64> = None;
        loop {
            self.checkpoint()?;
            let batch = self.queue.advance();
            if batch.is_empty() {
                self.ensure_notifier()?;
                self.flush_report();
                if self.control.wait(PUSH_NAP) == Wake::Terminated {
                    return Err(SubscriptionError::Interrupted);
                }
                continue;
            }

            self.enter(SubscriptionState::Busy)?;
            debug!(engine = %display_id(self.id()), count = batch.len(), "push batch");
            for event in batch {
                if self.control.is_terminated() {
                    return Err(SubscriptionError::Interrupted);
                }
                if self.acked.contains(&event.file.name) {
                    debug!(engine = %display_id(self.id()), file = %event.file.name, "already acknowledged");
                    self.queue.commit(event.seq);
                    continue;
                }
                if event.file.code == ResultCode::IoError && repaired_for == Some(event.seq) {
                    // The notifier reported the failure itself; a new session cannot change it.
                    repaired_for = None;
                    self.on_failure(event.file.clone());
                    self.queue.commit(event.seq);
                    continue;
                }
                let client = self.current_client()?;
                match self.deliver(&client, &event.file)? {
                    Step::Done => {
                        repaired_for = None;
                        self.repair_streak.store(0, Ordering::SeqCst);
                        self.acked.acknowledge(&event.file.name);
                        self.queue.commit(event.seq);
                    }
                    Step::ConnectionLost => {
                        // The rest of the batch stays queued for the next advance.
                        repaired_for = Some(event.seq);
                        self.repair()?;
                        break;
                    }
                }
            }
            self.enter(SubscriptionState::Running)?;
        }
    }

    /// Start the notifier, or restart it if it died.
    fn ensure_notifier(&self) -> Result<()> {
        let factory = self
            .notifiers
            .as_ref()
            .ok_or_else(|| SubscriptionError::invalid(keys::PUSH, "no notifier factory configured"))?;
        let mut slot = self.notifier.lock();
        match slot.as_ref() {
            Some(notifier) if notifier.is_alive() => return Ok(()),
            Some(_) => warn!(engine = %display_id(self.id()), "notifier stopped, restarting"),
            None => {}
        }
        if self.control.is_terminated() {
            return Err(SubscriptionError::Interrupted);
        }

        let params = self.parameters();
        let notifier = factory.create(&params, self.client())?;
        let runner = Arc::clone(&notifier);
        let queue = self.queue.clone();
        thread::Builder::new()
            .name(format!("notifier-{}", display_id(self.id())))
            .spawn(move || runner.run(queue))?;
        *slot = Some(notifier);
        debug!(engine = %display_id(self.id()), "notifier started");
        Ok(())
    }

    /// Resolve one item through the policy and route its result.
    fn deliver(&self, client: &SharedClient, item: &FileResult) -> Result<Step> {
        if item.code == ResultCode::IoError {
            return Ok(Step::ConnectionLost);
        }
        let resolved = self.policy.resolve(client, item);
        match resolved.code {
            ResultCode::Ok => self.on_success(resolved)?,
            ResultCode::IoError => return Ok(Step::ConnectionLost),
            ResultCode::FileExists | ResultCode::NoMatch => {
                debug!(engine = %display_id(self.id()), file = %resolved.name, code = ?resolved.code, "skipped");
                self.report.append(format!("skipped {} ({:?})", resolved.name, resolved.code));
            }
            ResultCode::FileNotFound | ResultCode::Failure => self.on_failure(resolved),
        }
        Ok(Step::Done)
    }

    fn on_success(&self, file: FileResult) -> Result<()> {
        let engine = display_id(self.id());
        let now = Timestamp::now();
        info!(engine = %engine, file = %file.name, task = %self.task_type, "file delivered");

        let (command, exit_on_error) = {
            let params = self.params.read();
            (params.invoke_command(), params.exit_on_error())
        };
        if let Some(command) = command {
            if let Err(e) = Invocation::new(command).run(&file, now) {
                if exit_on_error {
                    return Err(e);
                }
                warn!(engine = %engine, file = %file.name, error = %e, "invocation failed, skipping");
                self.report.append(format!("invocation failed for {}: {e}", file.name));
                return Ok(());
            }
        }

        let outcome = self
            .handlers
            .dispatch(EventKind::Success, self.task_type, std::slice::from_ref(&file));
        for (handler, reason) in &outcome.failures {
            self.report.append(format!("handler {handler} failed for {}: {reason}", file.name));
        }

        self.report.append(format!("delivered {}", file.name));
        let delivered = DeliveredFile {
            result: file,
            delivered_at: now,
        };
        self.history.lock().push(delivered.clone());
        self.events.emit(&EngineEvent::HistoryAppended {
            id: self.id(),
            file: delivered,
        });
        Ok(())
    }

    fn on_failure(&self, file: FileResult) {
        warn!(
            engine = %display_id(self.id()),
            file = %file.name,
            code = ?file.code,
            message = file.message.as_deref().unwrap_or(""),
            "delivery failed"
        );
        self.report.append(format!("failed {} ({:?})", file.name, file.code));
        self.handlers
            .dispatch(EventKind::Failure, self.task_type, std::slice::from_ref(&file));
    }

    fn flush_report(&self) {
        if let Err(e) = self.report.maybe_flush(Utc::now(), self.context.mail.as_deref()) {
            warn!(engine = %display_id(self.id()), error = %e, "report not sent");
        }
    }
}

impl Drop for SubscriptionEngine {
    fn drop(&mut self) {
        self.sessions.throttle().remove_reporter(&self.stall_reporter);
    }
}

impl std::fmt::Debug for SubscriptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEngine")
            .field("id", &display_id(self.id()))
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("push", &self.push)
            .finish()
    }
}
