//! Configuration for the sync engine.

use crate::retry::RetryPolicy;
use std::time::Duration;
use tidesync_protocol::ConflictPolicy;

/// Shortest poll or heartbeat interval accepted. Zero would spin the
/// worker loop and is rejected by `tokio::time::interval`.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the outbox worker and network client.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Entries fetched per cycle.
    pub batch_size: usize,
    /// Entries dispatched concurrently.
    pub max_in_flight: usize,
    /// Idle wake-up interval of the worker loop.
    pub poll_interval: Duration,
    /// How long the worker keeps flushing after the app is backgrounded.
    pub background_flush_window: Duration,
    /// Timeout of one remote call.
    pub request_timeout: Duration,
    /// Conflict resolution policy.
    pub conflict_policy: ConflictPolicy,
    /// Backoff for failed dispatches.
    pub retry: RetryPolicy,
    /// Realtime channel settings.
    pub realtime: RealtimeConfig,
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            batch_size: 32,
            max_in_flight: 4,
            poll_interval: Duration::from_secs(15),
            background_flush_window: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            conflict_policy: ConflictPolicy::default(),
            retry: RetryPolicy::default(),
            realtime: RealtimeConfig::default(),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the dispatch concurrency.
    pub fn with_max_in_flight(mut self, count: usize) -> Self {
        self.max_in_flight = count.max(1);
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Sets the background flush window.
    pub fn with_background_flush_window(mut self, window: Duration) -> Self {
        self.background_flush_window = window;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the realtime configuration.
    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the realtime channel.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered heartbeats before the link is degraded.
    pub missed_heartbeat_threshold: u32,
    /// Limit on one handshake.
    pub handshake_timeout: Duration,
    /// Failed reconnects before the manager parks.
    pub max_reconnect_attempts: u32,
    /// Backoff between reconnects.
    pub reconnect: RetryPolicy,
}

impl RealtimeConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeat_threshold: 3,
            handshake_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 8,
            reconnect: RetryPolicy::default(),
        }
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Sets the missed heartbeat threshold.
    pub fn with_missed_heartbeat_threshold(mut self, threshold: u32) -> Self {
        self.missed_heartbeat_threshold = threshold.max(1);
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the reconnect cap.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Sets the reconnect backoff.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// How long a connection may go without an answered heartbeat.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.missed_heartbeat_threshold)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
