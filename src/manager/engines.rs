//! The managed set of engines.

use super::listeners::ListenerSet;
use super::types::{DropReason, ListenerConfig, ListenerHandle, ListenerId, ManagerConfig, ManagerEvent};
use crate::client::SharedClient;
use crate::engine::{EngineEvent, EngineFactory, ObserverId, SubscriptionEngine};
use crate::error::{Result, SubscriptionError};
use crate::params::{keys, SubscriptionParameters};
use crate::persistence::resume::revalidate;
use crate::persistence::{
    CredentialPrompt, PersistedSession, ResumeConfig, ResumeReport, Revalidation, SessionPersistenceStore,
    SessionValidator,
};
use crate::types::{EngineId, SessionKey};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct Managed {
    engine: Arc<SubscriptionEngine>,
    observer: ObserverId,
    keep_alive: bool,
    /// Persisted entry, for keep-alive engines of a manager with a store.
    key: Option<SessionKey>,
}

#[derive(Default)]
struct ManagerState {
    /// Engines by source, in insertion order per source.
    engines: BTreeMap<String, Vec<Managed>>,
    next_id: u64,
    interrupted: bool,
    closed: bool,
}

impl ManagerState {
    fn take_where<F>(&mut self, mut keep: F) -> Vec<Managed>
    where
        F: FnMut(&Managed) -> bool,
    {
        let mut taken = Vec::new();
        for list in self.engines.values_mut() {
            let mut i = 0;
            while i < list.len() {
                if keep(&list[i]) {
                    i += 1;
                } else {
                    taken.push(list.remove(i));
                }
            }
        }
        self.engines.retain(|_, list| !list.is_empty());
        taken
    }
}

struct Shared {
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    listeners: ListenerSet,
    factory: Option<Arc<EngineFactory>>,
    store: Option<Arc<SessionPersistenceStore>>,
}

impl Shared {
    fn commit_store(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.commit() {
                warn!(error = %e, "session store commit failed");
            }
        }
    }

    /// Forwarded from every managed engine's event bus.
    fn on_engine_event(&self, event: &EngineEvent, keep_alive: bool) {
        if let (true, EngineEvent::QueryCompleted { at, .. }, Some(store)) = (keep_alive, event, &self.store) {
            store.set_last_query(*at);
            if let Err(e) = store.commit() {
                warn!(error = %e, "session store commit failed");
            }
        }
        self.listeners.broadcast(&ManagerEvent::Engine(event.clone()));
    }
}

/// Owns the live engines, assigns their ids and keeps keep-alive entries
/// in the session store.
///
/// All mutations run under one manager lock; listener broadcasts and
/// engine teardown happen after it is released.
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    /// A manager without engine factory or persistence.
    pub fn new(config: ManagerConfig) -> Self {
        Self::build(config, None, None)
    }

    /// A manager that can [`submit`](Self::submit) parameters and persist
    /// keep-alive subscriptions in `store`.
    pub fn with_factory(
        config: ManagerConfig,
        factory: Arc<EngineFactory>,
        store: Option<Arc<SessionPersistenceStore>>,
    ) -> Self {
        Self::build(config, Some(factory), store)
    }

    fn build(
        config: ManagerConfig,
        factory: Option<Arc<EngineFactory>>,
        store: Option<Arc<SessionPersistenceStore>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ManagerState::default()),
                listeners: ListenerSet::new(),
                factory,
                store,
            }),
        }
    }

    pub fn store(&self) -> Option<&Arc<SessionPersistenceStore>> {
        self.shared.store.as_ref()
    }

    // --- Listeners ---

    pub fn subscribe(&self, config: ListenerConfig) -> ListenerHandle {
        self.shared.listeners.subscribe(config)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.shared.listeners.unsubscribe(id);
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    // --- Mutations ---

    /// Add an engine, assigning its id.
    ///
    /// Fails without changing anything if the engine has no source, already
    /// has an id, or duplicates a live engine (unless duplicates are
    /// allowed).
    pub fn add(&self, engine: &Arc<SubscriptionEngine>) -> Result<EngineId> {
        let source = engine.source();
        if source.is_empty() {
            return Err(SubscriptionError::invalid(keys::FILE_TYPE, "engine has no source"));
        }
        let identity = engine.identity();

        let id = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SubscriptionError::ManagerClosed);
            }
            if let Some(id) = engine.id() {
                return Err(SubscriptionError::AlreadyManaged(id));
            }
            if !self.shared.config.allow_duplicates {
                let duplicate = state.engines.get(&source).is_some_and(|list| {
                    list.iter()
                        .any(|m| !m.engine.is_terminated() && m.engine.identity() == identity)
                });
                if duplicate {
                    return Err(SubscriptionError::Duplicate(identity.to_string()));
                }
            }

            let id = EngineId(state.next_id + 1);
            if !engine.assign_id(id) {
                return Err(SubscriptionError::AlreadyManaged(engine.id().unwrap_or(id)));
            }
            state.next_id += 1;
            if state.interrupted {
                engine.set_paused(true);
            }

            let keep_alive = engine.is_keep_alive();
            let weak: Weak<Shared> = Arc::downgrade(&self.shared);
            let observer = engine.subscribe(move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_engine_event(event, keep_alive);
                }
            });

            let key = match (&self.shared.store, keep_alive) {
                (Some(store), true) => {
                    let key = store.put_parameters(id, &engine.parameters());
                    self.shared.commit_store();
                    Some(key)
                }
                _ => None,
            };

            state.engines.entry(source).or_default().push(Managed {
                engine: Arc::clone(engine),
                observer,
                keep_alive,
                key,
            });
            id
        };

        info!(engine = %id, %identity, "engine added");
        self.shared.listeners.broadcast(&ManagerEvent::SetChanged {
            added: vec![id],
            removed: vec![],
        });
        Ok(id)
    }

    /// Remove an engine and terminate it. Returns false if it was not
    /// managed here.
    pub fn remove(&self, engine: &Arc<SubscriptionEngine>) -> Result<bool> {
        let removed = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SubscriptionError::ManagerClosed);
            }
            let removed = state.take_where(|m| !Arc::ptr_eq(&m.engine, engine));
            self.forget(&removed);
            removed
        };
        Ok(self.retire(removed) > 0)
    }

    pub fn remove_by_id(&self, id: EngineId) -> Result<bool> {
        match self.by_id(id) {
            Some(engine) => self.remove(&engine),
            None => Ok(false),
        }
    }

    /// Remove and terminate every engine, or only the non-keep-alive ones.
    pub fn clear(&self, include_keep_alive: bool) -> Result<usize> {
        let removed = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SubscriptionError::ManagerClosed);
            }
            let removed = state.take_where(|m| !include_keep_alive && m.keep_alive);
            self.forget(&removed);
            removed
        };
        Ok(self.retire(removed))
    }

    /// Pause (`true`) or resume every engine, including ones added later.
    pub fn set_interrupted(&self, interrupted: bool) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(SubscriptionError::ManagerClosed);
        }
        state.interrupted = interrupted;
        for managed in state.engines.values().flatten() {
            managed.engine.set_paused(interrupted);
        }
        debug!(interrupted, "manager interrupt state changed");
        Ok(())
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.state.lock().interrupted
    }

    /// Build, add and start an engine for `params`.
    pub fn submit(
        &self,
        params: SubscriptionParameters,
        client: Option<SharedClient>,
    ) -> Result<Arc<SubscriptionEngine>> {
        let factory = self
            .shared
            .factory
            .as_ref()
            .ok_or_else(|| SubscriptionError::NotStartable("manager has no engine factory".into()))?;
        let engine = factory.build(params, client)?;
        if let Err(e) = self.add(&engine) {
            engine.terminate();
            return Err(e);
        }
        if let Err(e) = engine.start() {
            let _ = self.remove(&engine);
            return Err(e);
        }
        Ok(engine)
    }

    /// Re-validate every persisted session and start the ones that pass.
    pub fn resume(
        &self,
        validator: &dyn SessionValidator,
        prompt: &dyn CredentialPrompt,
        config: &ResumeConfig,
    ) -> Result<ResumeReport> {
        let (Some(store), Some(factory)) = (&self.shared.store, &self.shared.factory) else {
            return Err(SubscriptionError::NotStartable(
                "resumption needs an engine factory and a session store".into(),
            ));
        };
        if self.is_closed() {
            return Err(SubscriptionError::ManagerClosed);
        }

        let mut report = ResumeReport::default();
        for (key, entry) in store.entries() {
            match revalidate(entry.parameters(), validator, prompt, config) {
                Revalidation::Valid { params, updated } => {
                    if updated {
                        store.put(
                            key.clone(),
                            PersistedSession {
                                id: entry.id,
                                properties: params.to_properties(),
                            },
                        );
                    }
                    let engine = match factory.build(params, None) {
                        Ok(engine) => engine,
                        Err(e) => {
                            warn!(key = %key.as_str(), error = %e, "persisted session cannot be rebuilt");
                            report.skipped.push(key);
                            continue;
                        }
                    };
                    engine.set_last_query(store.last_query());
                    match self.add(&engine).and_then(|id| engine.start().map(|()| id)) {
                        Ok(id) => report.resumed.push(id),
                        Err(e) => {
                            warn!(key = %key.as_str(), error = %e, "persisted session not resumed");
                            if engine.id().is_none() || !matches!(self.remove(&engine), Ok(true)) {
                                engine.terminate();
                            }
                            report.skipped.push(key);
                        }
                    }
                }
                Revalidation::Skip => report.skipped.push(key),
                Revalidation::Remove => {
                    store.remove(&key);
                    report.removed.push(key);
                }
            }
        }
        store.commit()?;

        info!(
            resumed = report.resumed.len(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            "resumption finished"
        );
        Ok(report)
    }

    /// Terminate every engine and close the manager for good.
    ///
    /// Keep-alive entries stay persisted so they resume on the next start.
    pub fn terminate(&self) {
        let engines = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let all = state.take_where(|_| false);
            for managed in &all {
                managed.engine.unsubscribe(managed.observer);
            }
            all
        };
        self.shared.commit_store();

        let mut ids: Vec<EngineId> = engines.iter().filter_map(|m| m.engine.id()).collect();
        ids.sort();
        for managed in &engines {
            managed.engine.terminate();
        }
        for managed in &engines {
            managed.engine.join();
        }
        info!(engines = ids.len(), "manager terminated");

        self.shared.listeners.broadcast(&ManagerEvent::SetChanged {
            added: vec![],
            removed: ids,
        });
        self.shared.listeners.close_all(DropReason::ManagerTerminated);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    // --- Queries ---

    pub fn by_source(&self, source: &str) -> Vec<Arc<SubscriptionEngine>> {
        self.shared
            .state
            .lock()
            .engines
            .get(source)
            .map(|list| list.iter().map(|m| Arc::clone(&m.engine)).collect())
            .unwrap_or_default()
    }

    pub fn by_id(&self, id: EngineId) -> Option<Arc<SubscriptionEngine>> {
        self.shared
            .state
            .lock()
            .engines
            .values()
            .flatten()
            .find(|m| m.engine.id() == Some(id))
            .map(|m| Arc::clone(&m.engine))
    }

    /// Every engine, sorted by id.
    pub fn list(&self) -> Vec<Arc<SubscriptionEngine>> {
        let mut engines: Vec<_> = self
            .shared
            .state
            .lock()
            .engines
            .values()
            .flatten()
            .map(|m| Arc::clone(&m.engine))
            .collect();
        engines.sort_by_key(|e| e.id());
        engines
    }

    /// Distinct sources, sorted.
    pub fn sources(&self) -> Vec<String> {
        self.shared.state.lock().engines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().engines.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Internals ---

    /// Unsubscribe removed engines and drop their persisted entries.
    /// Called with the manager lock held.
    fn forget(&self, removed: &[Managed]) {
        let mut touched = false;
        for managed in removed {
            managed.engine.unsubscribe(managed.observer);
            if let (Some(store), Some(key)) = (&self.shared.store, &managed.key) {
                store.remove(key);
                touched = true;
            }
        }
        if touched {
            self.shared.commit_store();
        }
    }

    /// Terminate removed engines and announce the change. Returns the count.
    fn retire(&self, removed: Vec<Managed>) -> usize {
        if removed.is_empty() {
            return 0;
        }
        let ids: Vec<EngineId> = removed.iter().filter_map(|m| m.engine.id()).collect();
        for managed in &removed {
            managed.engine.terminate();
        }
        debug!(count = ids.len(), "engines removed");
        self.shared.listeners.broadcast(&ManagerEvent::SetChanged {
            added: vec![],
            removed: ids,
        });
        removed.len()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.terminate();
    }
}
