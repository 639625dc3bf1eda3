//! In-memory fakes for tests and simulations.
//!
//! - [`MemoryServer`]: a record server with bearer tokens, version
//!   preconditions, tombstones and an idempotency-key reply cache
//! - [`LoopbackHttp`]: an [`HttpClient`] routing straight into a
//!   `MemoryServer`, with an offline switch and lost responses
//! - [`ScriptedRemote`]: a [`RemoteDataSource`] answering from per-record
//!   scripts
//! - [`MockRealtime`]: a [`RealtimeTransport`] that can go silent, refuse
//!   handshakes and push inbound frames

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::realtime::{RealtimeConnection, RealtimeTransport};
use crate::remote::{
    HttpClient, HttpRequest, HttpResponse, Method, RemoteDataSource, IDEMPOTENCY_KEY, IF_MATCH,
    REFRESH_PATH,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    classify_status, from_cbor, to_cbor, AuthSession, ErrorBody, Frame, IdempotencyKey,
    OperationKind, OutboxEntry, RecordId, RefreshRequest, RemoteSnapshot, StatusClass, Timestamp,
    TokenGrant, WriteAck, WriteRequest,
};
use tokio::sync::mpsc;

/// A record as the server holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    /// Payload; `None` once deleted.
    pub payload: Option<Vec<u8>>,
    /// Server version.
    pub version: u64,
    /// Server time of the last write.
    pub updated_at: Timestamp,
}

impl RemoteRecord {
    fn snapshot(&self) -> RemoteSnapshot {
        RemoteSnapshot {
            payload: self.payload.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Default)]
struct ServerState {
    records: HashMap<RecordId, RemoteRecord>,
    replies: HashMap<String, HttpResponse>,
    access_tokens: HashMap<String, Timestamp>,
    refresh_tokens: HashSet<String>,
    token_ttl: Duration,
    issued: u64,
    effects: usize,
    refresh_calls: usize,
    injected: VecDeque<u16>,
    requests: Vec<HttpRequest>,
}

impl ServerState {
    fn issue(&mut self, now: Timestamp) -> TokenGrant {
        self.issued += 1;
        let access_token = format!("access-{}", self.issued);
        let refresh_token = format!("refresh-{}", self.issued);
        self.access_tokens
            .insert(access_token.clone(), now.saturating_add(self.token_ttl));
        self.refresh_tokens.insert(refresh_token.clone());
        TokenGrant {
            access_token,
            refresh_token,
            expires_in_ms: u64::try_from(self.token_ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// An in-memory record server.
///
/// Writes carry an `If-Match` version precondition; a mismatch answers
/// 409 with the current snapshot. A write whose idempotency key was
/// already applied is answered from the reply cache without a second
/// side effect.
pub struct MemoryServer {
    clock: Arc<dyn Clock>,
    state: Mutex<ServerState>,
}

impl MemoryServer {
    /// Creates a server issuing tokens valid for 15 minutes.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ServerState {
                token_ttl: Duration::from_secs(15 * 60),
                ..ServerState::default()
            }),
        }
    }

    /// Issues a session valid for `ttl`, as a login would.
    pub fn issue_session(&self, ttl: Duration) -> AuthSession {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.token_ttl = ttl;
        state.issue(now).into_session(now)
    }

    /// Invalidates every access token; refresh tokens keep working.
    pub fn revoke_access_tokens(&self) {
        self.state.lock().access_tokens.clear();
    }

    /// Invalidates every refresh token.
    pub fn revoke_refresh_tokens(&self) {
        self.state.lock().refresh_tokens.clear();
    }

    /// Answers the next record write with `status` instead of applying it.
    pub fn fail_next(&self, status: u16) {
        self.state.lock().injected.push_back(status);
    }

    /// Writes a record directly, as another device would. Returns the new version.
    pub fn put_remote(&self, id: &RecordId, payload: Option<Vec<u8>>, updated_at: Timestamp) -> u64 {
        let mut state = self.state.lock();
        let version = state.records.get(id).map_or(0, |r| r.version) + 1;
        state.records.insert(
            id.clone(),
            RemoteRecord {
                payload,
                version,
                updated_at,
            },
        );
        version
    }

    /// Returns a record.
    pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        self.state.lock().records.get(id).cloned()
    }

    /// Returns the live (non-deleted) records.
    pub fn live_records(&self) -> Vec<(RecordId, Vec<u8>)> {
        let state = self.state.lock();
        let mut live: Vec<_> = state
            .records
            .iter()
            .filter_map(|(id, r)| r.payload.clone().map(|p| (id.clone(), p)))
            .collect();
        live.sort();
        live
    }

    /// Number of writes applied.
    pub fn effects(&self) -> usize {
        self.state.lock().effects
    }

    /// Number of refresh requests received.
    pub fn refresh_calls(&self) -> usize {
        self.state.lock().refresh_calls
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    /// Handles one request.
    pub fn handle(&self, request: HttpRequest) -> HttpResponse {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        if request.path == REFRESH_PATH {
            return Self::refresh(&mut state, &request, now);
        }
        if let Some(status) = state.injected.pop_front() {
            return error(status, "injected failure");
        }

        let authorized = request
            .bearer_token()
            .and_then(|token| state.access_tokens.get(token))
            .is_some_and(|expires_at| *expires_at > now);
        if !authorized {
            return error(401, "invalid or expired access token");
        }

        let key = request.header(IDEMPOTENCY_KEY).map(str::to_string);
        if let Some(reply) = key.as_ref().and_then(|k| state.replies.get(k)) {
            return reply.clone();
        }

        let write: WriteRequest = match from_cbor(&request.body) {
            Ok(write) => write,
            Err(err) => return error(400, &err.to_string()),
        };
        let Some(id) = request.path.strip_prefix("/records/") else {
            return error(404, "no such route");
        };
        if id != write.record_id.as_str() {
            return error(400, "record id does not match path");
        }
        let expected = request
            .header(IF_MATCH)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(write.expected_version);

        let reply = Self::apply(&mut state, request.method, write, expected, now);
        if (200..300).contains(&reply.status) {
            state.effects += 1;
            if let Some(key) = key {
                state.replies.insert(key, reply.clone());
            }
        }
        reply
    }

    fn apply(
        state: &mut ServerState,
        method: Method,
        write: WriteRequest,
        expected: u64,
        now: Timestamp,
    ) -> HttpResponse {
        let current = state.records.get(&write.record_id).cloned();
        let next = match (method, &current) {
            (Method::Post, None) => RemoteRecord {
                payload: write.payload,
                version: 1,
                updated_at: now,
            },
            // Re-creating a deleted record against its tombstone.
            (Method::Post, Some(r)) if r.payload.is_none() && r.version == expected => {
                RemoteRecord {
                    payload: write.payload,
                    version: r.version + 1,
                    updated_at: now,
                }
            }
            (_, None) => return error(404, "record not found"),
            (_, Some(r)) if r.payload.is_none() || r.version != expected => return conflict(r),
            (Method::Put, Some(r)) => RemoteRecord {
                payload: write.payload,
                version: r.version + 1,
                updated_at: now,
            },
            (Method::Delete, Some(r)) => RemoteRecord {
                payload: None,
                version: r.version + 1,
                updated_at: now,
            },
            (Method::Post, Some(r)) => return conflict(r),
        };

        let ack = WriteAck {
            version: next.version,
            updated_at: next.updated_at,
        };
        state.records.insert(write.record_id, next);
        match to_cbor(&ack) {
            Ok(body) => HttpResponse::new(200, body),
            Err(err) => error(500, &err.to_string()),
        }
    }

    fn refresh(state: &mut ServerState, request: &HttpRequest, now: Timestamp) -> HttpResponse {
        state.refresh_calls += 1;
        let Ok(body) = from_cbor::<RefreshRequest>(&request.body) else {
            return error(400, "malformed refresh request");
        };
        // Refresh tokens are single use.
        if !state.refresh_tokens.remove(&body.refresh_token) {
            return error(401, "invalid refresh token");
        }
        let grant = state.issue(now);
        match to_cbor(&grant) {
            Ok(body) => HttpResponse::new(200, body),
            Err(err) => error(500, &err.to_string()),
        }
    }
}

fn error(status: u16, message: &str) -> HttpResponse {
    let body = to_cbor(&ErrorBody {
        message: message.to_string(),
    })
    .unwrap_or_default();
    HttpResponse::new(status, body)
}

fn conflict(record: &RemoteRecord) -> HttpResponse {
    match to_cbor(&record.snapshot()) {
        Ok(body) => HttpResponse::new(409, body),
        Err(err) => error(500, &err.to_string()),
    }
}

/// An [`HttpClient`] wired directly to a [`MemoryServer`].
pub struct LoopbackHttp {
    server: Arc<MemoryServer>,
    online: AtomicBool,
    latency: Mutex<Duration>,
    lost_responses: AtomicUsize,
}

impl LoopbackHttp {
    /// Creates an online client.
    pub fn new(server: Arc<MemoryServer>) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            lost_responses: AtomicUsize::new(0),
        }
    }

    /// Switches the network on or off.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delays every request.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// The next `count` requests reach the server but their responses are lost.
    pub fn lose_responses(&self, count: usize) {
        self.lost_responses.store(count, Ordering::SeqCst);
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }
}

impl HttpClient for LoopbackHttp {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, SyncResult<HttpResponse>> {
        Box::pin(async move {
            if !self.online.load(Ordering::SeqCst) {
                return Err(SyncError::NetworkUnavailable("offline".into()));
            }
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let response = self.server.handle(request);
            let lost = self
                .lost_responses
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lost {
                return Err(SyncError::NetworkUnavailable("connection reset".into()));
            }
            Ok(response)
        })
    }
}

/// One scripted answer of [`ScriptedRemote`].
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Acknowledge with this version.
    Ack {
        /// Server version.
        version: u64,
    },
    /// Answer with an HTTP status, classified as a real response would be.
    Status(u16),
    /// Refuse the access token.
    Unauthorized,
    /// Report a version conflict.
    Conflict(RemoteSnapshot),
    /// The network is unreachable.
    Offline,
    /// A response body that cannot be decoded.
    Garbled,
    /// Never answer.
    Hang,
}

/// A push seen by [`ScriptedRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    /// Record pushed.
    pub record_id: RecordId,
    /// Operation kind.
    pub operation_kind: OperationKind,
    /// Key carried by the push.
    pub idempotency_key: IdempotencyKey,
    /// Token the push was sent with.
    pub access_token: String,
    /// Version precondition.
    pub base_version: u64,
}

#[derive(Default)]
struct Script {
    answers: HashMap<RecordId, VecDeque<Scripted>>,
    grants: VecDeque<SyncResult<AuthSession>>,
    pushes: Vec<Push>,
    refresh_calls: usize,
    in_flight: usize,
    peak_in_flight: usize,
}

/// A [`RemoteDataSource`] answering from scripts.
///
/// A record without a script is acknowledged with `base_version + 1`.
/// Refreshes hand out the granted sessions in order and fail with
/// `SessionExpired` once none are left.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<Script>,
    latency: Mutex<Duration>,
}

impl ScriptedRemote {
    /// Creates a remote with no scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends answers for a record.
    pub fn script(&self, id: &RecordId, answers: impl IntoIterator<Item = Scripted>) {
        self.script
            .lock()
            .answers
            .entry(id.clone())
            .or_default()
            .extend(answers);
    }

    /// Queues a session for the next refresh.
    pub fn grant(&self, session: AuthSession) {
        self.script.lock().grants.push_back(Ok(session));
    }

    /// Fails the next refresh with `err`.
    pub fn fail_refresh(&self, err: SyncError) {
        self.script.lock().grants.push_back(Err(err));
    }

    /// Delays every push.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Every push, in order.
    pub fn pushes(&self) -> Vec<Push> {
        self.script.lock().pushes.clone()
    }

    /// Records pushed, in order.
    pub fn pushed_ids(&self) -> Vec<RecordId> {
        self.pushes().into_iter().map(|p| p.record_id).collect()
    }

    /// Tokens used, in order.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.pushes().into_iter().map(|p| p.access_token).collect()
    }

    /// Number of refresh calls.
    pub fn refresh_calls(&self) -> usize {
        self.script.lock().refresh_calls
    }

    /// Highest number of pushes outstanding at once.
    pub fn peak_in_flight(&self) -> usize {
        self.script.lock().peak_in_flight
    }
}

/// Decrements the in-flight count when a push completes or is dropped.
struct InFlight<'a>(&'a Mutex<Script>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().in_flight -= 1;
    }
}

impl RemoteDataSource for ScriptedRemote {
    fn push<'a>(
        &'a self,
        access_token: &'a str,
        entry: &'a OutboxEntry,
    ) -> BoxFuture<'a, SyncResult<WriteAck>> {
        let answer = {
            let mut script = self.script.lock();
            script.pushes.push(Push {
                record_id: entry.record_id.clone(),
                operation_kind: entry.operation_kind,
                idempotency_key: entry.idempotency_key,
                access_token: access_token.to_string(),
                base_version: entry.base_version,
            });
            script.in_flight += 1;
            script.peak_in_flight = script.peak_in_flight.max(script.in_flight);
            script
                .answers
                .get_mut(&entry.record_id)
                .and_then(VecDeque::pop_front)
        };
        let latency = *self.latency.lock();

        Box::pin(async move {
            let _in_flight = InFlight(&self.script);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let ack = |version| WriteAck {
                version,
                updated_at: entry.created_at,
            };
            match answer {
                None => Ok(ack(entry.base_version + 1)),
                Some(Scripted::Ack { version }) => Ok(ack(version)),
                Some(Scripted::Status(status)) => match classify_status(status) {
                    StatusClass::Success => Ok(ack(entry.base_version + 1)),
                    StatusClass::AuthExpired => Err(SyncError::AuthExpired),
                    StatusClass::Conflict => Err(SyncError::Serialization(
                        "conflict response without a snapshot".into(),
                    )),
                    StatusClass::Rejected => Err(SyncError::Rejected {
                        status,
                        message: format!("scripted {}", status),
                    }),
                    StatusClass::Retryable => {
                        Err(SyncError::transient(Some(status), format!("scripted {}", status)))
                    }
                },
                Some(Scripted::Unauthorized) => Err(SyncError::AuthExpired),
                Some(Scripted::Conflict(remote)) => Err(SyncError::VersionConflict(remote)),
                Some(Scripted::Offline) => Err(SyncError::NetworkUnavailable("scripted".into())),
                Some(Scripted::Garbled) => {
                    Err(SyncError::Serialization("garbled response body".into()))
                }
                Some(Scripted::Hang) => futures::future::pending().await,
            }
        })
    }

    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> BoxFuture<'a, SyncResult<AuthSession>> {
        let grant = {
            let mut script = self.script.lock();
            script.refresh_calls += 1;
            script.grants.pop_front()
        };
        Box::pin(async move {
            tokio::task::yield_now().await;
            grant.unwrap_or(Err(SyncError::SessionExpired))
        })
    }
}

#[derive(Default)]
struct Link {
    responsive: bool,
    refuse_connects: u32,
    connects: usize,
    sent: Vec<Frame>,
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// A [`RealtimeTransport`] for tests.
///
/// While responsive it answers every heartbeat; while silent it keeps the
/// connection open and answers nothing.
#[derive(Clone)]
pub struct MockRealtime {
    link: Arc<Mutex<Link>>,
}

impl MockRealtime {
    /// Creates a responsive transport.
    pub fn new() -> Self {
        Self {
            link: Arc::new(Mutex::new(Link {
                responsive: true,
                ..Link::default()
            })),
        }
    }

    /// Makes the peer answer heartbeats or go silent.
    pub fn set_responsive(&self, responsive: bool) {
        self.link.lock().responsive = responsive;
    }

    /// Refuses the next `count` handshakes.
    pub fn fail_connects(&self, count: u32) {
        self.link.lock().refuse_connects = count;
    }

    /// Handshakes attempted.
    pub fn connects(&self) -> usize {
        self.link.lock().connects
    }

    /// Frames received from the client.
    pub fn sent(&self) -> Vec<Frame> {
        self.link.lock().sent.clone()
    }

    /// Data frames received from the client.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Data(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Heartbeats received from the client.
    pub fn heartbeats_sent(&self) -> usize {
        self.sent()
            .iter()
            .filter(|frame| matches!(frame, Frame::Heartbeat { .. }))
            .count()
    }

    /// Pushes a data frame to the client. Returns false if not connected.
    pub fn push_inbound(&self, data: Vec<u8>) -> bool {
        self.push_frame(&Frame::Data(data))
    }

    /// Pushes any frame to the client. Returns false if not connected.
    pub fn push_frame(&self, frame: &Frame) -> bool {
        let link = self.link.lock();
        match (&link.inbound, to_cbor(frame)) {
            (Some(inbound), Ok(bytes)) => inbound.send(bytes).is_ok(),
            _ => false,
        }
    }

    /// Closes the connection from the server side.
    pub fn hang_up(&self) {
        self.link.lock().inbound = None;
    }
}

impl Default for MockRealtime {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeTransport for MockRealtime {
    fn connect(&self) -> BoxFuture<'_, SyncResult<Box<dyn RealtimeConnection>>> {
        Box::pin(async move {
            let mut link = self.link.lock();
            link.connects += 1;
            if link.refuse_connects > 0 {
                link.refuse_connects -= 1;
                return Err(SyncError::NetworkUnavailable("handshake refused".into()));
            }
            let (inbound, frames) = mpsc::unbounded_channel();
            link.inbound = Some(inbound);
            Ok(Box::new(MockConnection {
                link: self.link.clone(),
                frames,
            }) as Box<dyn RealtimeConnection>)
        })
    }
}

struct MockConnection {
    link: Arc<Mutex<Link>>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl RealtimeConnection for MockConnection {
    fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, SyncResult<()>> {
        let result = from_cbor::<Frame>(&frame)
            .map_err(SyncError::from)
            .and_then(|frame| {
                let mut link = self.link.lock();
                let Some(inbound) = link.inbound.clone() else {
                    return Err(SyncError::NotConnected);
                };
                if let (Frame::Heartbeat { seq }, true) = (&frame, link.responsive) {
                    let ack = to_cbor(&Frame::HeartbeatAck { seq: *seq })?;
                    let _ = inbound.send(ack);
                }
                link.sent.push(frame);
                Ok(())
            });
        Box::pin(async move { result })
    }

    fn recv(&mut self) -> BoxFuture<'_, SyncResult<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.frames.recv().await) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.frames.close();
        Box::pin(async {})
    }
}
