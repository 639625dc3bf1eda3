//! Realtime channel manager.
//!
//! Owns one persistent connection while the app is reachable and in the
//! foreground.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Degraded -> Disconnected
//! ```
//!
//! A transport that reports "open" proves nothing about liveness, so the
//! manager probes it with a heartbeat every `heartbeat_interval`. A tick
//! that finds the previous probe unanswered counts a miss; reaching the
//! threshold degrades the link, closes it and schedules a reconnect.

use crate::codec;
use crate::config::{RealtimeConfig, MIN_INTERVAL};
use crate::connectivity::ConnectivityState;
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use futures::future::BoxFuture;
use std::sync::Arc;
use tidesync_protocol::{from_cbor, to_cbor, ConnectionPhase, Frame};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outbound frames queued while connected.
const OUTBOUND_CAPACITY: usize = 64;

/// An open realtime connection carrying encoded frames.
pub trait RealtimeConnection: Send {
    /// Sends one frame.
    fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, SyncResult<()>>;

    /// Receives the next frame, or `None` once the peer has closed.
    ///
    /// Must be cancel safe: dropping the future loses no frame.
    fn recv(&mut self) -> BoxFuture<'_, SyncResult<Option<Vec<u8>>>>;

    /// Closes the connection.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens realtime connections.
pub trait RealtimeTransport: Send + Sync {
    /// Performs the handshake.
    fn connect(&self) -> BoxFuture<'_, SyncResult<Box<dyn RealtimeConnection>>>;
}

/// Observable state of the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// When a heartbeat was last answered.
    pub last_heartbeat_at: Option<Instant>,
    /// Consecutive unanswered heartbeats.
    pub missed_heartbeats: u32,
    /// Failed connection attempts since the last success.
    pub reconnect_attempt: u32,
}

impl ConnectionState {
    /// Returns true if the channel is connected and a heartbeat was
    /// answered within `window` of `now`.
    pub fn is_live(&self, now: Instant, window: std::time::Duration) -> bool {
        self.phase == ConnectionPhase::Connected
            && self
                .last_heartbeat_at
                .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            last_heartbeat_at: None,
            missed_heartbeats: 0,
            reconnect_attempt: 0,
        }
    }
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    /// Shutdown was requested.
    Cancelled,
    /// Backgrounded or offline.
    Unwanted,
    /// Peer closed, I/O failed or heartbeats went unanswered.
    Lost,
}

/// Drives the realtime connection.
pub struct RealtimeManager {
    transport: Arc<dyn RealtimeTransport>,
    config: RealtimeConfig,
    events: Arc<EventBus>,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Sender<Vec<u8>>,
    queued: parking_lot::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    reconnect: Notify,
}

impl RealtimeManager {
    /// Creates a manager. Nothing connects until [`run`](Self::run).
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        let (outbound, queued) = mpsc::channel(OUTBOUND_CAPACITY);
        Self {
            transport,
            config,
            events,
            state,
            outbound,
            queued: parking_lot::Mutex::new(Some(queued)),
            reconnect: Notify::new(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watches the state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Queues a data frame. Fails with `NotConnected` unless connected.
    pub async fn send(&self, data: Vec<u8>) -> SyncResult<()> {
        if self.state.borrow().phase != ConnectionPhase::Connected {
            return Err(SyncError::NotConnected);
        }
        let size = data.len();
        let frame = codec::encode(Frame::Data(data), size).await?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| SyncError::NotConnected)
    }

    /// Restarts connection attempts after the reconnect cap was reached.
    pub fn reconnect(&self) {
        self.reconnect.notify_one();
    }

    fn update(&self, change: impl FnOnce(&mut ConnectionState)) {
        let mut entered = None;
        self.state.send_if_modified(|state| {
            let before = state.clone();
            change(state);
            if state.phase != before.phase {
                entered = Some(state.phase);
            }
            *state != before
        });
        if let Some(phase) = entered {
            tracing::info!(?phase, "realtime phase changed");
            self.events.publish(EngineEvent::ConnectionPhase(phase));
        }
    }

    /// Runs the manager until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        mut connectivity: watch::Receiver<ConnectivityState>,
        cancel: CancellationToken,
    ) {
        let Some(mut outbound) = self.queued.lock().take() else {
            tracing::warn!("realtime manager is already running");
            return;
        };
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt = 0u32;
        let mut epoch = connectivity.borrow().foreground_epoch;

        loop {
            let state = connectivity.borrow_and_update().clone();
            if state.foreground_epoch != epoch {
                epoch = state.foreground_epoch;
                attempt = 0;
            }

            let wanted = state.wants_realtime();
            if !wanted || attempt >= max_attempts {
                if wanted {
                    tracing::warn!(attempt, "reconnect attempts exhausted, waiting for a new trigger");
                }
                self.update(|s| {
                    s.phase = ConnectionPhase::Disconnected;
                    s.reconnect_attempt = attempt;
                });
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = self.reconnect.notified() => attempt = 0,
                }
                continue;
            }

            self.update(|s| {
                s.phase = ConnectionPhase::Connecting;
                s.reconnect_attempt = attempt;
            });
            if attempt > 0 {
                let delay = self.config.reconnect.delay(attempt - 1);
                tracing::debug!(attempt, ?delay, "realtime reconnect scheduled");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = self.reconnect.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let handshake = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.config.handshake_timeout, self.transport.connect()) => result,
            };
            let connection = match handshake {
                Ok(Ok(connection)) => connection,
                Ok(Err(err)) => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "realtime handshake failed");
                    continue;
                }
                Err(_) => {
                    attempt += 1;
                    tracing::warn!(attempt, "realtime handshake timed out");
                    continue;
                }
            };

            match self
                .drive(connection, &mut connectivity, &mut outbound, &cancel)
                .await
            {
                Session::Cancelled => break,
                Session::Unwanted => attempt = 0,
                Session::Lost => attempt = 1,
            }
        }

        self.update(|s| s.phase = ConnectionPhase::Disconnected);
        tracing::debug!("realtime manager stopped");
    }

    /// Serves one open connection until it ends.
    async fn drive(
        &self,
        mut connection: Box<dyn RealtimeConnection>,
        connectivity: &mut watch::Receiver<ConnectivityState>,
        outbound: &mut mpsc::Receiver<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Session {
        let threshold = self.config.missed_heartbeat_threshold.max(1);
        self.update(|s| {
            s.phase = ConnectionPhase::Connected;
            s.last_heartbeat_at = Some(Instant::now());
            s.missed_heartbeats = 0;
            s.reconnect_attempt = 0;
        });

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq = 0u64;
        let mut awaiting_ack = false;
        let mut missed = 0u32;

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Session::Cancelled,

                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break Session::Cancelled;
                    }
                    if !connectivity.borrow().wants_realtime() {
                        tracing::info!("realtime no longer wanted, closing");
                        break Session::Unwanted;
                    }
                }

                _ = ticker.tick() => {
                    if awaiting_ack {
                        missed += 1;
                        tracing::warn!(missed, threshold, "heartbeat missed");
                        self.update(|s| s.missed_heartbeats = missed);
                        if missed >= threshold {
                            self.update(|s| s.phase = ConnectionPhase::Degraded);
                            break Session::Lost;
                        }
                    }
                    seq += 1;
                    if let Err(err) = send_frame(connection.as_mut(), &Frame::Heartbeat { seq }).await {
                        tracing::warn!(error = %err, "heartbeat send failed");
                        break Session::Lost;
                    }
                    awaiting_ack = true;
                }

                Some(frame) = outbound.recv() => {
                    if let Err(err) = connection.send(frame).await {
                        tracing::warn!(error = %err, "realtime send failed");
                        break Session::Lost;
                    }
                }

                inbound = connection.recv() => match inbound {
                    Ok(Some(bytes)) => match from_cbor::<Frame>(&bytes) {
                        Ok(Frame::HeartbeatAck { seq: acked }) if acked != seq => {
                            tracing::debug!(acked, outstanding = seq, "ignoring stale heartbeat answer");
                        }
                        Ok(Frame::HeartbeatAck { seq: acked }) => {
                            tracing::trace!(acked, "heartbeat answered");
                            awaiting_ack = false;
                            missed = 0;
                            self.update(|s| {
                                s.missed_heartbeats = 0;
                                s.last_heartbeat_at = Some(Instant::now());
                            });
                        }
                        Ok(Frame::Heartbeat { seq: probe }) => {
                            if let Err(err) = send_frame(connection.as_mut(), &Frame::HeartbeatAck { seq: probe }).await {
                                tracing::warn!(error = %err, "heartbeat answer failed");
                                break Session::Lost;
                            }
                        }
                        Ok(Frame::Data(data)) => {
                            self.events.publish(EngineEvent::Realtime(data));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, len = bytes.len(), "dropping malformed realtime frame");
                        }
                    },
                    Ok(None) => {
                        tracing::info!("realtime connection closed by peer");
                        break Session::Lost;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "realtime receive failed");
                        break Session::Lost;
                    }
                },
            }
        };

        connection.close().await;
        let mut dropped = 0usize;
        while outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "discarded frames queued for the closed connection");
        }
        self.update(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.missed_heartbeats = 0;
        });
        end
    }
}

async fn send_frame(connection: &mut dyn RealtimeConnection, frame: &Frame) -> SyncResult<()> {
    let bytes = to_cbor(frame)?;
    connection.send(bytes).await
}
