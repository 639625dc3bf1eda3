//! The engine facade.
//!
//! [`SyncEngine`] wires the store, the auth gate, the sync worker, the
//! connectivity monitor and the realtime manager together and exposes the
//! three surfaces an app talks to: intents from the presentation layer,
//! lifecycle signals from the platform and events going back up.

use crate::auth::{AuthGate, SessionStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus, Observer};
use crate::realtime::{ConnectionState, RealtimeManager, RealtimeTransport};
use crate::remote::{HttpClient, HttpRemote, RemoteDataSource};
use crate::worker::{CycleReport, SyncWorker};
use parking_lot::Mutex;
use std::sync::Arc;
use tidesync_protocol::{
    AuthSession, OperationKind, OutboxEntry, Record, RecordId, Resolution,
};
use tidesync_store::LocalDataSource;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A change requested by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Create a record. A random id is assigned when `id` is `None`.
    Create {
        /// Client-chosen id.
        id: Option<RecordId>,
        /// Initial payload.
        payload: Vec<u8>,
    },
    /// Replace the payload of a record.
    Update {
        /// Record to change.
        id: RecordId,
        /// New payload.
        payload: Vec<u8>,
    },
    /// Delete a record.
    Delete {
        /// Record to delete.
        id: RecordId,
    },
}

enum RemoteSource {
    Direct(Arc<dyn RemoteDataSource>),
    Http(Arc<dyn HttpClient>),
}

/// Builds a [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: Arc<dyn LocalDataSource>,
    remote: RemoteSource,
    realtime: Option<Arc<dyn RealtimeTransport>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    reachable: bool,
}

impl SyncEngineBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enables the realtime channel over `transport`.
    pub fn realtime(mut self, transport: Arc<dyn RealtimeTransport>) -> Self {
        self.realtime = Some(transport);
        self
    }

    /// Sets the initial reachability. Defaults to online.
    pub fn reachable(mut self, reachable: bool) -> Self {
        self.reachable = reachable;
        self
    }

    /// Builds the engine, restoring any persisted session.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let remote: Arc<dyn RemoteDataSource> = match self.remote {
            RemoteSource::Direct(remote) => remote,
            RemoteSource::Http(client) => Arc::new(
                HttpRemote::new(client, self.clock.clone())
                    .with_timeout(self.config.request_timeout),
            ),
        };
        let events = Arc::new(EventBus::new());
        let gate = Arc::new(AuthGate::new(
            remote.clone(),
            self.store.clone(),
            events.clone(),
            self.clock.clone(),
        )?);
        let realtime = self.realtime.map(|transport| {
            Arc::new(RealtimeManager::new(
                transport,
                self.config.realtime.clone(),
                events.clone(),
            ))
        });
        let worker = Arc::new(SyncWorker::new(
            self.store.clone(),
            remote,
            gate.clone(),
            events.clone(),
            self.clock.clone(),
            self.config,
        ));

        Ok(SyncEngine {
            store: self.store,
            events,
            connectivity: ConnectivityMonitor::new(self.reachable),
            gate,
            worker,
            realtime,
            clock: self.clock,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Client synchronization engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tidesync_engine::{Intent, SyncEngine};
/// use tidesync_engine::testing::{LoopbackHttp, MemoryServer};
/// use tidesync_engine::SystemClock;
/// use tidesync_store::{DurableStore, MemoryJournal};
///
/// # async fn demo() -> tidesync_engine::SyncResult<()> {
/// let server = Arc::new(MemoryServer::new(Arc::new(SystemClock)));
/// let store = Arc::new(DurableStore::open(Box::new(MemoryJournal::new()))?);
/// let engine = SyncEngine::with_http(store, Arc::new(LoopbackHttp::new(server.clone()))).build()?;
///
/// engine.login(server.issue_session(std::time::Duration::from_secs(900)))?;
/// engine.start();
/// let id = engine.submit_intent(Intent::Create { id: None, payload: b"hello".to_vec() })?;
/// # let _ = id;
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    store: Arc<dyn LocalDataSource>,
    events: Arc<EventBus>,
    connectivity: ConnectivityMonitor,
    gate: Arc<AuthGate>,
    worker: Arc<SyncWorker>,
    realtime: Option<Arc<RealtimeManager>>,
    clock: Arc<dyn Clock>,
    running: Mutex<Option<Running>>,
}

impl SyncEngine {
    /// Starts building an engine over a remote data source.
    pub fn builder(
        store: Arc<dyn LocalDataSource>,
        remote: Arc<dyn RemoteDataSource>,
    ) -> SyncEngineBuilder {
        Self::builder_with(store, RemoteSource::Direct(remote))
    }

    /// Starts building an engine that talks HTTP through `client`.
    pub fn with_http(store: Arc<dyn LocalDataSource>, client: Arc<dyn HttpClient>) -> SyncEngineBuilder {
        Self::builder_with(store, RemoteSource::Http(client))
    }

    fn builder_with(store: Arc<dyn LocalDataSource>, remote: RemoteSource) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            remote,
            realtime: None,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            reachable: true,
        }
    }

    /// Records a local change and queues it for the server.
    ///
    /// Returns once the change is durable; never waits on the network.
    pub fn submit_intent(&self, intent: Intent) -> SyncResult<RecordId> {
        let (id, kind, payload) = match intent {
            Intent::Create { id, payload } => {
                (id.unwrap_or_else(RecordId::generate), OperationKind::Create, payload)
            }
            Intent::Update { id, payload } => (id, OperationKind::Update, payload),
            Intent::Delete { id } => (id, OperationKind::Delete, Vec::new()),
        };

        match self
            .store
            .upsert_optimistic(&id, kind, payload, self.clock.now())?
        {
            Some(record) => {
                tracing::debug!(record = %id, %kind, status = ?record.sync_status, "intent recorded");
                self.events.publish(EngineEvent::RecordChanged(record));
            }
            None => {
                tracing::debug!(record = %id, "unsent create cancelled");
                self.events.publish(EngineEvent::RecordRemoved(id.clone()));
            }
        }
        if self.connectivity.state().is_online() {
            self.worker.poke();
        }
        Ok(id)
    }

    /// The app came to the foreground.
    pub fn on_foregrounded(&self) {
        self.connectivity.on_foregrounded();
        self.worker.poke();
    }

    /// The app went to the background.
    pub fn on_backgrounded(&self) {
        self.connectivity.on_backgrounded();
    }

    /// The platform reported a reachability change.
    pub fn on_reachability_changed(&self, reachable: bool) {
        if self.connectivity.on_reachability_changed(reachable) {
            self.worker.poke();
        }
    }

    /// Returns the connectivity state.
    pub fn connectivity(&self) -> ConnectivityState {
        self.connectivity.state()
    }

    /// Installs a session after login.
    pub fn login(&self, session: AuthSession) -> SyncResult<()> {
        self.gate.login(session)?;
        self.worker.poke();
        Ok(())
    }

    /// Destroys the session. Queued changes stay queued.
    pub fn logout(&self) -> SyncResult<()> {
        self.gate.logout()
    }

    /// Returns the session status.
    pub fn session_status(&self) -> SessionStatus {
        self.gate.status()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Registers an observer.
    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.events.add_observer(observer);
    }

    /// Spawns the sync worker and, if configured, the realtime manager.
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            tracing::debug!("engine already running");
            return;
        }

        let cancel = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(
            self.worker
                .clone()
                .run(self.connectivity.subscribe(), cancel.child_token()),
        )];
        if let Some(realtime) = &self.realtime {
            tasks.push(tokio::spawn(
                realtime
                    .clone()
                    .run(self.connectivity.subscribe(), cancel.child_token()),
            ));
        }
        tracing::info!(tasks = tasks.len(), "engine started");
        *running = Some(Running { cancel, tasks });
    }

    /// Stops the background tasks and waits for them to finish.
    ///
    /// Queued work is untouched and resumes on the next start.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        for result in futures::future::join_all(running.tasks).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "engine task failed");
            }
        }
        tracing::info!("engine stopped");
    }

    /// Runs one sync cycle now, regardless of the background loop.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        self.worker.run_cycle().await
    }

    /// Returns a record.
    pub fn record(&self, id: &RecordId) -> SyncResult<Option<Record>> {
        Ok(self.store.get(id)?)
    }

    /// Returns all records.
    pub fn records(&self) -> SyncResult<Vec<Record>> {
        Ok(self.store.records()?)
    }

    /// Returns the outbox, oldest first.
    pub fn outbox(&self) -> SyncResult<Vec<OutboxEntry>> {
        Ok(self.store.outbox()?)
    }

    /// Returns the records waiting on a conflict decision.
    pub fn conflicts(&self) -> SyncResult<Vec<Record>> {
        Ok(self.store.conflicts()?)
    }

    /// Queues a failed record again.
    pub fn retry_failed(&self, id: &RecordId) -> SyncResult<Record> {
        let record = self.store.retry_failed(id, self.clock.now())?;
        tracing::info!(record = %id, "failed record queued again");
        self.events.publish(EngineEvent::RecordChanged(record.clone()));
        self.worker.poke();
        Ok(record)
    }

    /// Drops a record and anything queued for it.
    pub fn discard(&self, id: &RecordId) -> SyncResult<()> {
        self.store.discard(id)?;
        tracing::info!(record = %id, "record discarded");
        self.events.publish(EngineEvent::RecordRemoved(id.clone()));
        Ok(())
    }

    /// Settles a conflict the resolver deferred.
    pub fn resolve_conflict(&self, id: &RecordId, resolution: Resolution) -> SyncResult<()> {
        self.worker.resolve_conflict(id, resolution)
    }

    /// Returns the realtime state, if realtime is enabled.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.realtime.as_ref().map(|r| r.state())
    }

    /// Restarts realtime connection attempts after the reconnect cap.
    pub fn reconnect_realtime(&self) {
        if let Some(realtime) = &self.realtime {
            realtime.reconnect();
        }
    }

    /// Sends a data frame on the realtime channel.
    pub async fn realtime_send(&self, data: Vec<u8>) -> SyncResult<()> {
        match &self.realtime {
            Some(realtime) => realtime.send(data).await,
            None => Err(SyncError::NotConnected),
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventLog;
    use crate::testing::ScriptedRemote;
    use tidesync_protocol::{SyncStatus, Timestamp};
    use tidesync_store::{DurableStore, MemoryJournal};

    fn engine() -> (SyncEngine, Arc<EventLog>) {
        let store = Arc::new(DurableStore::open(Box::new(MemoryJournal::new())).unwrap());
        let engine = SyncEngine::builder(store, Arc::new(ScriptedRemote::new()))
            .clock(Arc::new(ManualClock::new(Timestamp::from_millis(10))))
            .reachable(false)
            .build()
            .unwrap();
        let log = Arc::new(EventLog::new());
        engine.add_observer(log.clone());
        (engine, log)
    }

    #[test]
    fn intents_only_touch_the_store() {
        let (engine, log) = engine();
        let id = engine
            .submit_intent(Intent::Create {
                id: None,
                payload: vec![1],
            })
            .unwrap();

        let record = engine.record(&id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::PendingCreate);
        assert_eq!(engine.outbox().unwrap().len(), 1);

        engine
            .submit_intent(Intent::Update {
                id: id.clone(),
                payload: vec![2],
            })
            .unwrap();
        assert_eq!(engine.outbox().unwrap().len(), 1);
        assert_eq!(engine.outbox().unwrap()[0].payload_snapshot, vec![2]);

        engine.submit_intent(Intent::Delete { id: id.clone() }).unwrap();
        assert!(engine.record(&id).unwrap().is_none());
        assert!(engine.outbox().unwrap().is_empty());
        assert_eq!(log.count(|e| matches!(e, EngineEvent::RecordRemoved(_))), 1);
    }

    #[test]
    fn unknown_record_update_fails() {
        let (engine, _) = engine();
        let result = engine.submit_intent(Intent::Update {
            id: RecordId::from("missing"),
            payload: vec![],
        });
        assert!(matches!(result, Err(SyncError::Store(_))));
    }

    #[test]
    fn realtime_disabled_by_default() {
        let (engine, _) = engine();
        assert!(engine.connection_state().is_none());
        assert_eq!(engine.session_status(), SessionStatus::LoggedOut);
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let (engine, _) = engine();
        engine.start();
        engine.start();
        engine.shutdown().await;
        engine.shutdown().await;
    }
}
