//! Connectivity monitor.
//!
//! Folds platform reachability and app lifecycle signals into one
//! [`ConnectivityState`] published on a `watch` channel. The sync worker
//! and the realtime manager only ever read it.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// App lifecycle as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// The app is visible.
    Foreground,
    /// The app is suspended or hidden.
    Background,
}

/// Combined reachability and lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityState {
    /// Whether the network is reachable.
    pub reachable: bool,
    /// App lifecycle.
    pub lifecycle: Lifecycle,
    /// When the app was last backgrounded, while it stays there.
    pub backgrounded_at: Option<Instant>,
    /// Bumped on every foreground signal.
    pub foreground_epoch: u64,
}

impl ConnectivityState {
    /// Returns true if the network is reachable.
    pub fn is_online(&self) -> bool {
        self.reachable
    }

    /// Returns true if the realtime channel should be open.
    pub fn wants_realtime(&self) -> bool {
        self.reachable && self.lifecycle == Lifecycle::Foreground
    }

    /// Returns true if the outbox may be drained at `now`.
    ///
    /// In the background this holds only within `flush_window` of the
    /// moment the app was backgrounded.
    pub fn sync_permitted(&self, now: Instant, flush_window: Duration) -> bool {
        if !self.reachable {
            return false;
        }
        match (self.lifecycle, self.backgrounded_at) {
            (Lifecycle::Foreground, _) => true,
            (Lifecycle::Background, Some(at)) => now.saturating_duration_since(at) < flush_window,
            (Lifecycle::Background, None) => false,
        }
    }

    /// Returns when the background flush window closes, if it is open.
    pub fn flush_deadline(&self, flush_window: Duration) -> Option<Instant> {
        match (self.lifecycle, self.backgrounded_at) {
            (Lifecycle::Background, Some(at)) => Some(at + flush_window),
            _ => None,
        }
    }
}

/// Publishes connectivity changes.
pub struct ConnectivityMonitor {
    state: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    /// Creates a monitor for a foregrounded app.
    pub fn new(reachable: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            reachable,
            lifecycle: Lifecycle::Foreground,
            backgrounded_at: None,
            foreground_epoch: 0,
        });
        Self { state }
    }

    /// The app came to the foreground.
    pub fn on_foregrounded(&self) {
        self.state.send_modify(|s| {
            s.lifecycle = Lifecycle::Foreground;
            s.backgrounded_at = None;
            s.foreground_epoch += 1;
        });
        tracing::debug!("foregrounded");
    }

    /// The app went to the background.
    pub fn on_backgrounded(&self) {
        self.state.send_if_modified(|s| {
            if s.lifecycle == Lifecycle::Background {
                return false;
            }
            s.lifecycle = Lifecycle::Background;
            s.backgrounded_at = Some(Instant::now());
            true
        });
        tracing::debug!("backgrounded");
    }

    /// Reachability changed. Returns true on an offline to online transition.
    pub fn on_reachability_changed(&self, reachable: bool) -> bool {
        let mut came_online = false;
        self.state.send_if_modified(|s| {
            if s.reachable == reachable {
                return false;
            }
            came_online = reachable;
            s.reachable = reachable;
            true
        });
        if came_online {
            tracing::info!("network reachable");
        } else if !reachable {
            tracing::info!("network unreachable");
        }
        came_online
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectivityState {
        self.state.borrow().clone()
    }

    /// Watches the state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}
