//! # tidesync engine
//!
//! Client synchronization and resilience engine.
//!
//! This crate provides:
//! - Outbox sync worker with bounded batches and per-record exclusion
//! - Auth gate serializing token refreshes behind one barrier
//! - HTTP network client with status classification
//! - Retry scheduling with capped exponential backoff and jitter
//! - Pluggable conflict resolution (Last-Write-Wins by default)
//! - Connectivity monitor for reachability and app lifecycle
//! - Heartbeat-checked realtime channel with reconnect policy
//!
//! ## Architecture
//!
//! ```text
//! intent ──► DurableStore ──► SyncWorker ──► AuthGate ──► RemoteDataSource
//!                 ▲               │
//!                 └── outcome ◄───┘ (synced / retry / conflict / failed)
//!
//! ConnectivityMonitor ──► SyncWorker, RealtimeManager
//! ```
//!
//! Intents only touch the store. Everything that waits on the network runs
//! on two background tasks (the worker loop and the realtime manager)
//! which share nothing but the store and the connectivity state.
//!
//! ## Key Invariants
//!
//! - A local write is durable before it is acknowledged to the caller
//! - A record has at most one pending entry and one dispatch in flight
//! - Replays reuse the idempotency key, so the server applies a write once
//! - No request is sent with a token known to be expired
//! - Session expiry is announced once, not once per queued request

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod clock;
mod codec;
mod config;
mod connectivity;
mod engine;
mod error;
mod events;
mod realtime;
mod remote;
mod retry;
mod worker;

pub mod testing;

pub use auth::{AuthGate, AuthState, SessionStatus};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use codec::OFFLOAD_THRESHOLD;
pub use config::{EngineConfig, RealtimeConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, Lifecycle};
pub use engine::{Intent, SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use events::{EngineEvent, EventBus, EventLog, Observer};
pub use realtime::{ConnectionState, RealtimeConnection, RealtimeManager, RealtimeTransport};
pub use remote::{
    record_path, HttpClient, HttpRemote, HttpRequest, HttpResponse, Method, RemoteDataSource,
    AUTHORIZATION, IDEMPOTENCY_KEY, IF_MATCH, REFRESH_PATH,
};
pub use retry::RetryPolicy;
pub use worker::{CycleReport, SyncWorker};
