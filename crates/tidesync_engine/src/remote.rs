//! Network client.
//!
//! [`HttpClient`] is the raw send primitive and is meant to be swapped:
//! a real HTTP stack in production, a loopback in tests. [`HttpRemote`]
//! builds record writes and token refreshes on top of it and classifies
//! each response into the engine's error taxonomy.

use crate::clock::Clock;
use crate::codec;
use crate::error::{SyncError, SyncResult};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tidesync_protocol::{
    classify_status, AuthSession, ErrorBody, OperationKind, OutboxEntry, RefreshRequest,
    RemoteSnapshot, StatusClass, TokenGrant, WriteAck, WriteRequest,
};

/// Header carrying the bearer token.
pub const AUTHORIZATION: &str = "Authorization";
/// Header carrying the idempotency key.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
/// Header carrying the expected record version.
pub const IF_MATCH: &str = "If-Match";

/// Path of the token refresh endpoint.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// POST.
    Post,
    /// PUT.
    Put,
    /// DELETE.
    Delete,
}

impl Method {
    /// Returns the method used for an operation kind.
    pub fn for_operation(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Create => Method::Post,
            OperationKind::Update => Method::Put,
            OperationKind::Delete => Method::Delete,
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Path, starting with `/`.
    pub path: String,
    /// Headers as name/value pairs.
    pub headers: Vec<(String, String)>,
    /// CBOR body.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a request without headers.
    pub fn new(method: Method, path: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Returns the first value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the bearer token, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header(AUTHORIZATION)?.strip_prefix("Bearer ")
    }
}

/// A response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// CBOR body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }
}

/// HTTP client abstraction.
///
/// Implementations return `Err(SyncError::NetworkUnavailable)` when the
/// server cannot be reached and `Ok` for every response, whatever its status.
pub trait HttpClient: Send + Sync {
    /// Performs one request.
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, SyncResult<HttpResponse>>;
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, SyncResult<HttpResponse>> {
        (**self).execute(request)
    }
}

/// The remote operations the sync engine depends on.
pub trait RemoteDataSource: Send + Sync {
    /// Sends one outbox entry.
    ///
    /// Errors follow the engine taxonomy: `AuthExpired` for a refused token,
    /// `VersionConflict` with the remote state, `Rejected` for a terminal
    /// refusal and a retryable error for everything transient.
    fn push<'a>(
        &'a self,
        access_token: &'a str,
        entry: &'a OutboxEntry,
    ) -> BoxFuture<'a, SyncResult<WriteAck>>;

    /// Exchanges a refresh token for a new session.
    ///
    /// Fails with `SessionExpired` if the refresh token itself is dead.
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, SyncResult<AuthSession>>;
}

/// Returns the path of a record.
pub fn record_path(id: &tidesync_protocol::RecordId) -> String {
    format!("/records/{}", id)
}

/// Remote data source over an [`HttpClient`].
pub struct HttpRemote<C: HttpClient> {
    client: C,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates a remote with a 30 s request timeout.
    pub fn new(client: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the client.
    pub fn client(&self) -> &C {
        &self.client
    }

    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        match tokio::time::timeout(self.timeout, self.client.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::transient(
                None,
                format!("request timed out after {:?}", self.timeout),
            )),
        }
    }

    async fn push_entry(&self, access_token: &str, entry: &OutboxEntry) -> SyncResult<WriteAck> {
        let body = WriteRequest {
            record_id: entry.record_id.clone(),
            operation_kind: entry.operation_kind,
            payload: match entry.operation_kind {
                OperationKind::Delete => None,
                _ => Some(entry.payload_snapshot.clone()),
            },
            expected_version: entry.base_version,
            client_updated_at: entry.created_at,
        };
        let body = codec::encode(body, entry.payload_snapshot.len()).await?;

        let mut request = HttpRequest::new(
            Method::for_operation(entry.operation_kind),
            record_path(&entry.record_id),
            body,
        )
        .with_header(AUTHORIZATION, format!("Bearer {}", access_token))
        .with_header(IDEMPOTENCY_KEY, entry.idempotency_key.to_string());
        if entry.operation_kind != OperationKind::Create {
            request = request.with_header(IF_MATCH, entry.base_version.to_string());
        }

        let response = self.send(request).await?;
        match classify_status(response.status) {
            StatusClass::Success => codec::decode::<WriteAck>(response.body).await,
            StatusClass::AuthExpired => Err(SyncError::AuthExpired),
            StatusClass::Conflict => {
                let remote = codec::decode::<RemoteSnapshot>(response.body).await?;
                Err(SyncError::VersionConflict(remote))
            }
            StatusClass::Rejected => Err(SyncError::Rejected {
                status: response.status,
                message: error_message(&response.body),
            }),
            StatusClass::Retryable => Err(SyncError::transient(
                Some(response.status),
                error_message(&response.body),
            )),
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> SyncResult<AuthSession> {
        let body = codec::encode(
            RefreshRequest {
                refresh_token: refresh_token.to_string(),
            },
            0,
        )
        .await?;
        let response = self
            .send(HttpRequest::new(Method::Post, REFRESH_PATH, body))
            .await?;

        match response.status {
            200..=299 => {
                let grant = codec::decode::<TokenGrant>(response.body).await?;
                Ok(grant.into_session(self.clock.now()))
            }
            400 | 401 => Err(SyncError::SessionExpired),
            status => Err(SyncError::transient(
                Some(status),
                error_message(&response.body),
            )),
        }
    }
}

impl<C: HttpClient> RemoteDataSource for HttpRemote<C> {
    fn push<'a>(
        &'a self,
        access_token: &'a str,
        entry: &'a OutboxEntry,
    ) -> BoxFuture<'a, SyncResult<WriteAck>> {
        Box::pin(self.push_entry(access_token, entry))
    }

    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, SyncResult<AuthSession>> {
        Box::pin(self.refresh_session(refresh_token))
    }
}

/// Extracts a readable message from an error body.
fn error_message(body: &[u8]) -> String {
    match tidesync_protocol::from_cbor::<ErrorBody>(body) {
        Ok(err) => err.message,
        Err(_) if body.is_empty() => "no response body".to_string(),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use tidesync_protocol::{to_cbor, RecordId, Timestamp};

    /// Answers every request with a fixed response and keeps the requests.
    struct FixedClient {
        response: Mutex<Option<SyncResult<HttpResponse>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl FixedClient {
        fn answering(status: u16, body: Vec<u8>) -> Self {
            Self {
                response: Mutex::new(Some(Ok(HttpResponse::new(status, body)))),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for FixedClient {
        fn execute(&self, request: HttpRequest) -> BoxFuture<'_, SyncResult<HttpResponse>> {
            self.seen.lock().push(request);
            let response = self
                .response
                .lock()
                .take()
                .unwrap_or_else(|| Err(SyncError::NetworkUnavailable("no response".into())));
            Box::pin(async move { response })
        }
    }

    struct Silent;

    impl HttpClient for Silent {
        fn execute(&self, _request: HttpRequest) -> BoxFuture<'_, SyncResult<HttpResponse>> {
            Box::pin(futures::future::pending())
        }
    }

    fn remote<C: HttpClient>(client: C) -> HttpRemote<C> {
        HttpRemote::new(client, Arc::new(ManualClock::new(Timestamp::from_millis(1_000))))
    }

    fn update_entry() -> OutboxEntry {
        OutboxEntry::new(
            RecordId::from("r1"),
            OperationKind::Update,
            vec![1, 2],
            Timestamp::from_millis(5),
            7,
        )
    }

    #[tokio::test]
    async fn success_builds_request_and_decodes_ack() {
        let ack = WriteAck {
            version: 8,
            updated_at: Timestamp::from_millis(900),
        };
        let remote = remote(FixedClient::answering(200, to_cbor(&ack).unwrap()));
        let entry = update_entry();

        assert_eq!(remote.push("tok", &entry).await.unwrap(), ack);

        let seen = remote.client().seen.lock();
        let request = &seen[0];
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.path, "/records/r1");
        assert_eq!(request.bearer_token(), Some("tok"));
        assert_eq!(request.header("if-match"), Some("7"));
        assert_eq!(
            request.header(IDEMPOTENCY_KEY),
            Some(entry.idempotency_key.to_string().as_str())
        );
        let body: WriteRequest = tidesync_protocol::from_cbor(&request.body).unwrap();
        assert_eq!(body.payload, Some(vec![1, 2]));
        assert_eq!(body.expected_version, 7);
    }

    #[tokio::test]
    async fn status_classification() {
        let entry = update_entry();

        let err = remote(FixedClient::answering(401, vec![]))
            .push("t", &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));

        let body = to_cbor(&ErrorBody {
            message: "title too long".into(),
        })
        .unwrap();
        let err = remote(FixedClient::answering(422, body))
            .push("t", &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: 422, ref message } if message == "title too long"));

        for status in [500, 503, 408, 429] {
            let err = remote(FixedClient::answering(status, vec![]))
                .push("t", &entry)
                .await
                .unwrap_err();
            assert!(err.is_retryable(), "status {} should be retryable", status);
        }
    }

    #[tokio::test]
    async fn conflict_carries_remote_snapshot() {
        let snapshot = RemoteSnapshot {
            payload: Some(vec![9]),
            version: 12,
            updated_at: Timestamp::from_millis(70),
        };
        let err = remote(FixedClient::answering(409, to_cbor(&snapshot).unwrap()))
            .push("t", &update_entry())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::VersionConflict(ref s) if *s == snapshot));

        let err = remote(FixedClient::answering(409, b"not cbor".to_vec()))
            .push("t", &update_entry())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient() {
        let remote = remote(Silent).with_timeout(Duration::from_secs(2));
        let err = remote.push("t", &update_entry()).await.unwrap_err();
        assert!(matches!(err, SyncError::ServerTransient { status: None, .. }));
    }

    #[tokio::test]
    async fn refresh_outcomes() {
        let grant = TokenGrant {
            access_token: "a2".into(),
            refresh_token: "r2".into(),
            expires_in_ms: 60_000,
        };
        let remote_ok = remote(FixedClient::answering(200, to_cbor(&grant).unwrap()));
        let session = remote_ok.refresh("r1").await.unwrap();
        assert_eq!(session.access_token, "a2");
        assert_eq!(session.expires_at, Timestamp::from_millis(61_000));
        assert_eq!(remote_ok.client().seen.lock()[0].path, REFRESH_PATH);

        let err = remote(FixedClient::answering(401, vec![]))
            .refresh("r1")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionExpired));

        let err = remote(FixedClient::answering(502, vec![]))
            .refresh("r1")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn create_has_no_precondition_and_delete_no_payload() {
        let ack = to_cbor(&WriteAck {
            version: 1,
            updated_at: Timestamp::ZERO,
        })
        .unwrap();

        let create = OutboxEntry::new(
            RecordId::from("n"),
            OperationKind::Create,
            vec![1],
            Timestamp::ZERO,
            0,
        );
        let r = remote(FixedClient::answering(201, ack.clone()));
        r.push("t", &create).await.unwrap();
        assert_eq!(r.client().seen.lock()[0].header(IF_MATCH), None);
        assert_eq!(r.client().seen.lock()[0].method, Method::Post);

        let delete = OutboxEntry::new(
            RecordId::from("n"),
            OperationKind::Delete,
            vec![1],
            Timestamp::ZERO,
            3,
        );
        let r = remote(FixedClient::answering(200, ack));
        r.push("t", &delete).await.unwrap();
        let body: WriteRequest = tidesync_protocol::from_cbor(&r.client().seen.lock()[0].body).unwrap();
        assert_eq!(body.payload, None);
    }
}
