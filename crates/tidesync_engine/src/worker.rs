//! Outbox sync worker.
//!
//! ## Cycle
//!
//! 1. Claim up to `batch_size` due entries, oldest first
//! 2. Dispatch them through the auth gate, `max_in_flight` at a time
//! 3. Write each outcome back to the store
//!
//! A claimed record is never claimed again until its outcome is written,
//! so two dispatches for the same record are never in flight together.
//! Outcomes are keyed by the idempotency key that was sent: an edit that
//! arrives mid-flight is never mistaken for the acknowledged one.

use crate::auth::{AuthGate, SessionStatus};
use crate::clock::Clock;
use crate::config::{EngineConfig, MIN_INTERVAL};
use crate::connectivity::ConnectivityState;
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::remote::RemoteDataSource;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    ConflictCase, ErrorKind, IdempotencyKey, OutboxEntry, RecordError, RecordId, Resolution,
    WriteAck,
};
use tidesync_store::{LocalDataSource, ResolutionOutcome, SyncedOutcome};
use tokio::sync::{watch, Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Counts of what one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Entries sent.
    pub dispatched: usize,
    /// Entries acknowledged.
    pub synced: usize,
    /// Entries parked for a later retry.
    pub retried: usize,
    /// Entries that hit a version conflict.
    pub conflicts: usize,
    /// Entries the server refused for good.
    pub rejected: usize,
    /// Entries that failed for any other terminal reason.
    pub failed: usize,
    /// True if the session expired during the cycle.
    pub session_expired: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: Dispatch) {
        self.dispatched += 1;
        match outcome {
            Dispatch::Synced => self.synced += 1,
            Dispatch::Retried => self.retried += 1,
            Dispatch::Conflict => self.conflicts += 1,
            Dispatch::Rejected => self.rejected += 1,
            Dispatch::Failed => self.failed += 1,
            Dispatch::SessionExpired => self.session_expired = true,
            Dispatch::Untouched => {}
        }
    }
}

/// What happened to one dispatched entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Synced,
    Retried,
    Conflict,
    Rejected,
    Failed,
    SessionExpired,
    Untouched,
}

/// Drains the outbox.
pub struct SyncWorker {
    store: Arc<dyn LocalDataSource>,
    remote: Arc<dyn RemoteDataSource>,
    gate: Arc<AuthGate>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    cycle: Mutex<()>,
    wake: Notify,
}

impl SyncWorker {
    /// Creates a worker.
    pub fn new(
        store: Arc<dyn LocalDataSource>,
        remote: Arc<dyn RemoteDataSource>,
        gate: Arc<AuthGate>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            remote,
            gate,
            events,
            clock,
            config,
            cycle: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    /// Asks the loop to run a cycle soon.
    pub fn poke(&self) {
        self.wake.notify_one();
    }

    /// Runs one cycle.
    ///
    /// Cycles never overlap; a call made while one runs waits for it.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let _cycle = self.cycle.lock().await;
        let mut report = CycleReport::default();

        match self.gate.status() {
            SessionStatus::Active => {}
            SessionStatus::Expired => {
                report.session_expired = true;
                return Ok(report);
            }
            SessionStatus::LoggedOut => return Ok(report),
        }

        let batch = self
            .store
            .claim_due(self.clock.now(), self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(report);
        }

        tracing::debug!(batch = batch.len(), "sync cycle started");

        let outcomes: Vec<SyncResult<Dispatch>> = futures::stream::iter(batch)
            .map(|entry| self.dispatch(entry))
            .buffer_unordered(self.config.max_in_flight)
            .collect()
            .await;

        let mut store_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(dispatch) => report.record(dispatch),
                Err(err) => {
                    tracing::error!(error = %err, "failed to record dispatch outcome");
                    store_error.get_or_insert(err);
                }
            }
        }

        tracing::info!(
            dispatched = report.dispatched,
            synced = report.synced,
            retried = report.retried,
            conflicts = report.conflicts,
            rejected = report.rejected,
            failed = report.failed,
            session_expired = report.session_expired,
            "sync cycle finished"
        );
        match store_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Sends one claimed entry and settles its outcome.
    async fn dispatch(&self, entry: OutboxEntry) -> SyncResult<Dispatch> {
        let remote = &self.remote;
        let sent = &entry;
        let result = self
            .gate
            .call(|token| async move { remote.push(&token, sent).await })
            .await;
        let outcome = self.settle(&entry, result);
        self.store.release(&entry.record_id);
        outcome
    }

    fn settle(
        &self,
        entry: &OutboxEntry,
        result: SyncResult<WriteAck>,
    ) -> SyncResult<Dispatch> {
        let id = &entry.record_id;
        let key = entry.idempotency_key;

        let err = match result {
            Ok(ack) => {
                tracing::debug!(record = %id, kind = %entry.operation_kind, version = ack.version, "acknowledged");
                match self.store.mark_synced(id, key, ack)? {
                    SyncedOutcome::Synced(record) | SyncedOutcome::Superseded(record) => {
                        self.events.publish(EngineEvent::RecordChanged(record));
                    }
                    SyncedOutcome::Removed(id) => {
                        self.events.publish(EngineEvent::RecordRemoved(id));
                    }
                    SyncedOutcome::Stale => {}
                }
                return Ok(Dispatch::Synced);
            }
            Err(err) => err,
        };

        match err {
            SyncError::RefreshFailed(cause) => {
                // Auth trouble never spends the entry's retry budget.
                let at = self.config.retry.next_retry_at(self.clock.now(), 0);
                tracing::debug!(record = %id, retry_at = %at, error = %cause, "session refresh failed, postponing");
                if self
                    .store
                    .postpone(id, key, at, cause.to_record_error())?
                {
                    self.publish_record(id)?;
                }
                Ok(Dispatch::Retried)
            }

            err if err.is_retryable()
                || matches!(err, SyncError::NotConnected | SyncError::Cancelled) =>
            {
                let failures = entry.attempt.saturating_add(1);
                if self.config.retry.is_exhausted(failures) {
                    tracing::warn!(record = %id, failures, error = %err, "retry ceiling reached");
                    let error = RecordError::new(
                        ErrorKind::AttemptsExhausted,
                        err.to_record_error().status,
                        err.to_string(),
                    );
                    self.fail(id, key, error)?;
                    return Ok(Dispatch::Failed);
                }

                let at = self
                    .config
                    .retry
                    .next_retry_at(self.clock.now(), entry.attempt);
                tracing::debug!(record = %id, attempt = failures, retry_at = %at, error = %err, "dispatch failed, retrying later");
                if self
                    .store
                    .schedule_retry(id, key, at, err.to_record_error())?
                {
                    self.publish_record(id)?;
                }
                Ok(Dispatch::Retried)
            }

            SyncError::VersionConflict(remote) => {
                tracing::info!(record = %id, remote_version = remote.version, "version conflict");
                match self.store.mark_conflict(id, key, remote)? {
                    Some(case) => {
                        self.resolve(case)?;
                        Ok(Dispatch::Conflict)
                    }
                    None => {
                        tracing::debug!(record = %id, "conflict on a superseded dispatch, ignored");
                        Ok(Dispatch::Untouched)
                    }
                }
            }

            SyncError::Rejected { status, message } => {
                tracing::warn!(record = %id, status, %message, "rejected");
                let error = RecordError::new(ErrorKind::Rejected, Some(status), message.clone());
                if self.fail(id, key, error)? {
                    self.events.publish(EngineEvent::Rejected {
                        record_id: id.clone(),
                        status,
                        message,
                        payload: entry.payload_snapshot.clone(),
                    });
                }
                Ok(Dispatch::Rejected)
            }

            SyncError::Serialization(message) => {
                tracing::error!(record = %id, %message, "serialization failed");
                let error = RecordError::new(ErrorKind::Serialization, None, message.clone());
                if self.fail(id, key, error)? {
                    self.events.publish(EngineEvent::SerializationFailed {
                        record_id: id.clone(),
                        message,
                    });
                }
                Ok(Dispatch::Failed)
            }

            SyncError::SessionExpired | SyncError::AuthExpired | SyncError::NotLoggedIn => {
                tracing::debug!(record = %id, "left queued, no usable session");
                Ok(Dispatch::SessionExpired)
            }

            SyncError::Store(err) => Err(SyncError::Store(err)),

            other => {
                tracing::debug!(record = %id, error = %other, "dispatch abandoned");
                Ok(Dispatch::Untouched)
            }
        }
    }

    /// Drops the entry and marks the record failed. Returns false if the
    /// entry changed while in flight.
    fn fail(&self, id: &RecordId, key: IdempotencyKey, error: RecordError) -> SyncResult<bool> {
        match self.store.mark_failed(id, key, error)? {
            Some(record) => {
                self.events.publish(EngineEvent::RecordChanged(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn publish_record(&self, id: &RecordId) -> SyncResult<()> {
        if let Some(record) = self.store.get(id)? {
            self.events.publish(EngineEvent::RecordChanged(record));
        }
        Ok(())
    }

    /// Runs the configured resolver on a conflict and applies its decision.
    fn resolve(&self, case: ConflictCase) -> SyncResult<()> {
        let resolver = self.config.conflict_policy.resolver();
        let resolution = resolver.resolve(&case);
        tracing::info!(
            record = %case.record_id,
            resolver = resolver.name(),
            outcome = resolution_name(&resolution),
            "conflict resolved"
        );
        self.apply(&case.record_id, &resolution)
    }

    /// Applies a resolution chosen by the application.
    pub fn resolve_conflict(&self, id: &RecordId, resolution: Resolution) -> SyncResult<()> {
        self.apply(id, &resolution)?;
        self.poke();
        Ok(())
    }

    fn apply(&self, id: &RecordId, resolution: &Resolution) -> SyncResult<()> {
        match self.store.apply_resolution(id, resolution, self.clock.now())? {
            ResolutionOutcome::Finalized {
                record,
                discarded_payload,
                rollback,
            } => {
                let record_id = record.id.clone();
                self.events.publish(EngineEvent::RecordChanged(record));
                if rollback {
                    self.events.publish(EngineEvent::RolledBack {
                        record_id,
                        discarded_payload,
                    });
                }
            }
            ResolutionOutcome::Removed {
                record_id,
                discarded_payload,
                rollback,
            } => {
                self.events
                    .publish(EngineEvent::RecordRemoved(record_id.clone()));
                if rollback {
                    self.events.publish(EngineEvent::RolledBack {
                        record_id,
                        discarded_payload,
                    });
                }
            }
            ResolutionOutcome::Requeued(record) => {
                self.events.publish(EngineEvent::RecordChanged(record));
            }
            ResolutionOutcome::Deferred(record) => {
                let record_id = record.id.clone();
                self.events.publish(EngineEvent::RecordChanged(record));
                self.events.publish(EngineEvent::ConflictUnresolved(record_id));
            }
        }
        Ok(())
    }

    /// Resolves conflicts left behind by a crash between detection and
    /// resolution. Returns how many were found.
    pub fn resolve_stranded(&self) -> SyncResult<usize> {
        let mut found = 0;
        for record in self.store.conflicts()? {
            if let Some(case) = self.store.conflict_case(&record.id)? {
                found += 1;
                self.resolve(case)?;
            }
        }
        if found > 0 {
            tracing::info!(found, "re-resolved stranded conflicts");
        }
        Ok(found)
    }

    /// Runs the worker loop until `cancel` fires.
    ///
    /// A cycle runs whenever syncing is permitted and something may be
    /// due: on start, on every connectivity or session change, when poked,
    /// when the earliest parked entry comes due, and every poll interval.
    pub async fn run(
        self: Arc<Self>,
        mut connectivity: watch::Receiver<ConnectivityState>,
        cancel: CancellationToken,
    ) {
        if let Err(err) = self.resolve_stranded() {
            tracing::error!(error = %err, "could not resolve stranded conflicts");
        }
        let mut auth = self.gate.subscribe();

        loop {
            let state = connectivity.borrow_and_update().clone();
            auth.borrow_and_update();
            let permitted = state.sync_permitted(
                tokio::time::Instant::now(),
                self.config.background_flush_window,
            );

            let mut wait = self.config.poll_interval.max(MIN_INTERVAL);
            if permitted && self.gate.status() == SessionStatus::Active {
                match self.run_cycle().await {
                    Ok(report) if report.dispatched > 0 && !report.session_expired => {
                        if self.due_in().is_some_and(|d| d.is_zero()) {
                            continue;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "sync cycle failed"),
                }
                if let Some(due) = self.due_in() {
                    wait = wait.min(due);
                }
            }
            if let Some(deadline) = state.flush_deadline(self.config.background_flush_window) {
                let until_close = deadline.saturating_duration_since(tokio::time::Instant::now());
                if !until_close.is_zero() {
                    wait = wait.min(until_close);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = auth.changed() => {}
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!("sync worker stopped");
    }

    /// Time until the earliest queued entry is due.
    fn due_in(&self) -> Option<Duration> {
        match self.store.next_due_at() {
            Ok(at) => at.map(|at| at.saturating_duration_since(self.clock.now())),
            Err(err) => {
                tracing::error!(error = %err, "could not read next due time");
                None
            }
        }
    }
}

fn resolution_name(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::KeepLocal { .. } => "keep-local",
        Resolution::AcceptRemote { rollback: false } => "accept-remote",
        Resolution::AcceptRemote { rollback: true } => "rollback",
        Resolution::Defer => "defer",
    }
}
