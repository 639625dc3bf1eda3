//! Request, response and realtime frame bodies.
//!
//! All bodies travel as CBOR. Credentials and idempotency keys travel in
//! headers, not in bodies.

use crate::outbox::OperationKind;
use crate::record::RecordId;
use crate::session::AuthSession;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of a record write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Target record.
    pub record_id: RecordId,
    /// Operation kind.
    pub operation_kind: OperationKind,
    /// New payload; absent for deletes.
    pub payload: Option<Vec<u8>>,
    /// Version the change was made against (0 for creates).
    pub expected_version: u64,
    /// Client time of the edit.
    pub client_updated_at: Timestamp,
}

/// Body of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Version assigned by the server.
    pub version: u64,
    /// Server time of the write.
    pub updated_at: Timestamp,
}

/// Body of any non-2xx response that is not a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Server-provided reason.
    pub message: String,
}

/// Body of a token refresh request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// The refresh token to exchange.
    pub refresh_token: String,
}

/// Body of a successful token refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    /// New access token.
    pub access_token: String,
    /// New refresh token (rotated).
    pub refresh_token: String,
    /// Lifetime of the access token in milliseconds.
    pub expires_in_ms: u64,
}

impl TokenGrant {
    /// Turns the grant into a session issued at `now`.
    pub fn into_session(self, now: Timestamp) -> AuthSession {
        AuthSession::new(
            self.access_token,
            self.refresh_token,
            now.saturating_add(Duration::from_millis(self.expires_in_ms)),
        )
    }
}

/// A frame on the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Liveness probe sent by the client.
    Heartbeat {
        /// Probe sequence number.
        seq: u64,
    },
    /// Server acknowledgment of a probe.
    HeartbeatAck {
        /// Sequence number being acknowledged.
        seq: u64,
    },
    /// Application data.
    Data(Vec<u8>),
}

/// Lifecycle phase of the realtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionPhase {
    /// No connection, none being attempted.
    Disconnected,
    /// Handshake in progress (or waiting to retry one).
    Connecting,
    /// Open and answering heartbeats.
    Connected,
    /// Open but silent; about to be torn down.
    Degraded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_cbor, to_cbor};

    #[test]
    fn frame_cbor() {
        for frame in [
            Frame::Heartbeat { seq: 7 },
            Frame::HeartbeatAck { seq: 7 },
            Frame::Data(vec![0xde, 0xad]),
        ] {
            let bytes = to_cbor(&frame).unwrap();
            assert_eq!(from_cbor::<Frame>(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn grant_expiry_is_relative_to_issue_time() {
        let grant = TokenGrant {
            access_token: "a2".into(),
            refresh_token: "r2".into(),
            expires_in_ms: 60_000,
        };
        let session = grant.into_session(Timestamp::from_millis(1_000));
        assert_eq!(session.expires_at, Timestamp::from_millis(61_000));
        assert_eq!(session.access_token, "a2");
    }
}
