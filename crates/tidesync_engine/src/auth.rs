//! Auth gate.
//!
//! Every remote call goes through [`AuthGate::call`]. The gate owns the
//! session and a refresh barrier:
//!
//! - while a refresh is in flight, callers wait on the barrier instead of
//!   dispatching with the old token (waiting never spends a retry attempt)
//! - the first caller to see a 401 for the current token generation runs
//!   the only refresh; later callers just replay with the new token
//! - a replay that is refused again, or a refresh token that is refused,
//!   expires the session for every caller at once
//!
//! State lives in a `watch` cell so waiters are woken rather than polling.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineEvent, EventBus};
use crate::remote::RemoteDataSource;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tidesync_protocol::AuthSession;
use tidesync_store::LocalDataSource;
use tokio::sync::watch;

/// Lifecycle of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session; `login` is required.
    LoggedOut,
    /// A session is installed and usable.
    Active,
    /// The session could not be refreshed; `login` is required.
    Expired,
}

/// Observable state of the gate.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthState {
    /// Current session.
    pub session: Option<AuthSession>,
    /// Bumped on every login, logout and successful refresh.
    pub generation: u64,
    /// True while the single refresh call is outstanding.
    pub refresh_in_flight: bool,
    /// Session lifecycle.
    pub status: SessionStatus,
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("session", &self.session)
            .field("generation", &self.generation)
            .field("refresh_in_flight", &self.refresh_in_flight)
            .field("status", &self.status)
            .finish()
    }
}

/// A usable token and the generation it belongs to.
struct Credential {
    access_token: String,
    generation: u64,
}

/// Clears the refresh barrier if a refresh is abandoned mid-flight.
struct RefreshGuard<'a> {
    state: &'a watch::Sender<AuthState>,
    armed: bool,
}

impl RefreshGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_modify(|s| s.refresh_in_flight = false);
        }
    }
}

/// Serializes token refreshes and wraps every remote call.
pub struct AuthGate {
    state: watch::Sender<AuthState>,
    remote: Arc<dyn RemoteDataSource>,
    store: Arc<dyn LocalDataSource>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl AuthGate {
    /// Creates a gate, restoring any persisted session.
    pub fn new(
        remote: Arc<dyn RemoteDataSource>,
        store: Arc<dyn LocalDataSource>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let session = store.load_session()?;
        let status = if session.is_some() {
            SessionStatus::Active
        } else {
            SessionStatus::LoggedOut
        };
        let (state, _) = watch::channel(AuthState {
            session,
            generation: 0,
            refresh_in_flight: false,
            status,
        });
        Ok(Self {
            state,
            remote,
            store,
            events,
            clock,
        })
    }

    /// Installs a session.
    pub fn login(&self, session: AuthSession) -> SyncResult<()> {
        self.store.save_session(&session)?;
        self.state.send_modify(|s| {
            s.session = Some(session);
            s.generation += 1;
            s.refresh_in_flight = false;
            s.status = SessionStatus::Active;
        });
        tracing::info!("session installed");
        Ok(())
    }

    /// Destroys the session.
    pub fn logout(&self) -> SyncResult<()> {
        self.store.clear_session()?;
        self.state.send_modify(|s| {
            s.session = None;
            s.generation += 1;
            s.refresh_in_flight = false;
            s.status = SessionStatus::LoggedOut;
        });
        tracing::info!("session destroyed");
        Ok(())
    }

    /// Returns the session status.
    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Returns a copy of the gate state.
    pub fn snapshot(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Watches the gate state.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Runs a remote call with the current token.
    ///
    /// `op` receives the access token. If it fails with `AuthExpired`, the
    /// session is refreshed (or a concurrent refresh is awaited) and `op`
    /// runs exactly once more with the new token.
    pub async fn call<T, F, Fut>(&self, op: F) -> SyncResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let credential = self.acquire().await?;
        match op(credential.access_token).await {
            Err(SyncError::AuthExpired) => {}
            other => return other,
        }

        tracing::debug!(generation = credential.generation, "access token refused");
        let credential = self.refresh_after(credential.generation).await?;
        match op(credential.access_token).await {
            Err(SyncError::AuthExpired) => {
                tracing::warn!("refreshed token refused");
                self.expire();
                Err(SyncError::SessionExpired)
            }
            other => other,
        }
    }

    /// Waits out any refresh and returns a token not known to be expired.
    async fn acquire(&self) -> SyncResult<Credential> {
        let state = self.settled().await?;
        let Some(session) = state.session else {
            return Err(SyncError::NotLoggedIn);
        };
        if session.is_expired(self.clock.now()) {
            tracing::debug!("access token past expiry, refreshing before dispatch");
            return self.refresh_after(state.generation).await;
        }
        Ok(Credential {
            access_token: session.access_token,
            generation: state.generation,
        })
    }

    /// Waits until no refresh is in flight and the session is usable.
    async fn settled(&self) -> SyncResult<AuthState> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !s.refresh_in_flight)
            .await
            .map_err(|_| SyncError::Cancelled)?
            .clone();
        match state.status {
            SessionStatus::Active => Ok(state),
            SessionStatus::LoggedOut => Err(SyncError::NotLoggedIn),
            SessionStatus::Expired => Err(SyncError::SessionExpired),
        }
    }

    /// Makes sure the token of `observed` generation is replaced.
    ///
    /// Runs the refresh if nobody has started one for that generation,
    /// otherwise waits for the running one.
    async fn refresh_after(&self, observed: u64) -> SyncResult<Credential> {
        let mut claimed = false;
        self.state.send_if_modified(|s| {
            if s.status == SessionStatus::Active && s.generation == observed && !s.refresh_in_flight
            {
                s.refresh_in_flight = true;
                claimed = true;
            }
            claimed
        });
        if claimed {
            return self.perform_refresh().await;
        }

        let state = self.settled().await?;
        match state.session {
            Some(session) if state.generation != observed => Ok(Credential {
                access_token: session.access_token,
                generation: state.generation,
            }),
            Some(_) => Err(SyncError::RefreshFailed(Box::new(SyncError::transient(
                None,
                "session refresh did not complete",
            )))),
            None => Err(SyncError::NotLoggedIn),
        }
    }

    async fn perform_refresh(&self) -> SyncResult<Credential> {
        let guard = RefreshGuard {
            state: &self.state,
            armed: true,
        };
        let refresh_token = match &self.state.borrow().session {
            Some(session) => session.refresh_token.clone(),
            None => return Err(SyncError::NotLoggedIn),
        };

        tracing::info!("refreshing session");
        match self.remote.refresh(&refresh_token).await {
            Ok(session) => {
                self.store.save_session(&session)?;
                let access_token = session.access_token.clone();
                let mut generation = 0;
                self.state.send_modify(|s| {
                    s.session = Some(session);
                    s.generation += 1;
                    s.refresh_in_flight = false;
                    generation = s.generation;
                });
                guard.disarm();
                tracing::info!(generation, "session refreshed");
                Ok(Credential {
                    access_token,
                    generation,
                })
            }
            Err(SyncError::SessionExpired) | Err(SyncError::AuthExpired) => {
                tracing::warn!("refresh token refused");
                guard.disarm();
                self.expire();
                Err(SyncError::SessionExpired)
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(error = %err, "session refresh failed");
                Err(SyncError::RefreshFailed(Box::new(err)))
            }
            Err(err) => {
                tracing::warn!(error = %err, "session refresh failed");
                Err(err)
            }
        }
    }

    /// Marks the session terminally expired and announces it once.
    fn expire(&self) {
        let changed = self.state.send_if_modified(|s| {
            s.refresh_in_flight = false;
            if s.status == SessionStatus::Active {
                s.status = SessionStatus::Expired;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::warn!("session expired, login required");
            self.events.publish(EngineEvent::SessionExpired);
        }
    }
}
