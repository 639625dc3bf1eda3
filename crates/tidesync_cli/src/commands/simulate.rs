//! Simulate command implementation.
//!
//! Drives a real engine against the in-memory server: records are created
//! while offline, the network comes back with the requested faults armed,
//! and sync cycles run on a manual clock until the outbox drains.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidesync_engine::testing::{LoopbackHttp, MemoryServer};
use tidesync_engine::{Clock, EngineConfig, Intent, ManualClock, SyncEngine};
use tidesync_protocol::{RecordId, SyncStatus, Timestamp};
use tidesync_store::{DurableStore, FileJournal, JournalBackend, LocalDataSource, MemoryJournal};

/// Cycles run before the simulation gives up on draining.
const MAX_CYCLES: usize = 1_000;

/// Scenario knobs.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Records created while offline.
    pub records: usize,
    /// Transient failures injected after reconnecting.
    pub failures: usize,
    /// Responses dropped after the server applied the write.
    pub lost: usize,
    /// Revoke the access token before reconnecting.
    pub revoke: bool,
    /// Journal file; an in-memory journal is used when absent.
    pub journal: Option<PathBuf>,
    /// Engine settings.
    pub config: EngineConfig,
}

/// What the simulation observed.
#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    /// Sync cycles run.
    pub cycles: usize,
    /// Requests dispatched by the worker.
    pub dispatched: usize,
    /// Acknowledged writes.
    pub synced: usize,
    /// Writes parked for retry.
    pub retried: usize,
    /// Version conflicts resolved.
    pub conflicts: usize,
    /// Writes that ended failed.
    pub failed: usize,
    /// Token refreshes the server handled.
    pub refreshes: usize,
    /// Requests the server received.
    pub server_requests: usize,
    /// Writes the server applied.
    pub server_effects: usize,
    /// Simulated time from reconnect to drained outbox.
    pub elapsed_ms: u64,
    /// True if every local record ended synced and matched the server.
    pub converged: bool,
}

/// Runs the scenario and returns the report.
pub fn simulate(options: &Options) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(scenario(options))
}

async fn scenario(options: &Options) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let clock = Arc::new(ManualClock::new(Timestamp::now()));
    let server = Arc::new(MemoryServer::new(clock.clone()));
    let http = Arc::new(LoopbackHttp::new(server.clone()));

    let backend: Box<dyn JournalBackend> = match &options.journal {
        Some(path) => Box::new(FileJournal::open(path)?),
        None => Box::new(MemoryJournal::new()),
    };
    let store = Arc::new(DurableStore::open(backend)?);
    let engine = SyncEngine::with_http(store.clone(), http.clone())
        .clock(clock.clone())
        .config(options.config.clone())
        .reachable(false)
        .build()?;
    engine.login(server.issue_session(Duration::from_secs(15 * 60)))?;

    http.set_online(false);
    for n in 0..options.records {
        engine.submit_intent(Intent::Create {
            id: Some(RecordId::from(format!("sim-{:04}", n).as_str())),
            payload: format!("record {}", n).into_bytes(),
        })?;
    }
    tracing::info!(queued = store.outbox()?.len(), "records queued offline");

    if options.revoke {
        server.revoke_access_tokens();
    }
    for _ in 0..options.failures {
        server.fail_next(503);
    }
    http.lose_responses(options.lost);
    http.set_online(true);
    engine.on_reachability_changed(true);

    let started = clock.now();
    let mut report = SimulationReport::default();
    while report.cycles < MAX_CYCLES {
        let outbox = store.outbox()?;
        let Some(next_due) = outbox.iter().map(|e| e.next_retry_at.unwrap_or(started)).min()
        else {
            break;
        };
        if next_due > clock.now() {
            clock.set(next_due);
        }

        let cycle = engine.run_cycle().await?;
        report.cycles += 1;
        report.dispatched += cycle.dispatched;
        report.synced += cycle.synced;
        report.retried += cycle.retried;
        report.conflicts += cycle.conflicts;
        report.failed += cycle.failed + cycle.rejected;
        if cycle.session_expired {
            tracing::warn!("session expired; stopping");
            break;
        }
    }

    report.refreshes = server.refresh_calls();
    report.server_requests = server.requests().len();
    report.server_effects = server.effects();
    report.elapsed_ms = clock.now().saturating_duration_since(started).as_millis() as u64;

    let records = store.records()?;
    let mut local: Vec<(RecordId, Vec<u8>)> = records
        .iter()
        .map(|r| (r.id.clone(), r.payload.clone()))
        .collect();
    local.sort();
    report.converged = records.iter().all(|r| r.sync_status == SyncStatus::Synced)
        && local == server.live_records();

    Ok(report)
}

/// Runs the simulate command.
pub fn run(options: &Options, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(options)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("Simulation");
            println!("==========");
            println!();
            println!("  Cycles:          {}", report.cycles);
            println!("  Dispatched:      {}", report.dispatched);
            println!("  Synced:          {}", report.synced);
            println!("  Retried:         {}", report.retried);
            println!("  Conflicts:       {}", report.conflicts);
            println!("  Failed:          {}", report.failed);
            println!("  Token refreshes: {}", report.refreshes);
            println!("  Server requests: {}", report.server_requests);
            println!("  Server effects:  {}", report.server_effects);
            println!("  Simulated time:  {} ms", report.elapsed_ms);
            println!();
            println!(
                "Result: {}",
                if report.converged {
                    "converged"
                } else {
                    "NOT converged"
                }
            );
        }
    }

    if report.converged {
        Ok(())
    } else {
        Err("client and server did not converge".into())
    }
}
