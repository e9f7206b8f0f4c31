// sync-protocol: persistent-channel message types and serialization for the
// bookmark sync hub.
//
// All WebSocket messages use a top-level `type` field for discriminated
// deserialization. The enum variants map 1:1 to the frame kinds in the
// service's wire protocol.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Kind of entity a mutation or change event applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Bookmark,
    Collection,
}

/// Operation a mutation or change event performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Create,
    Update,
    Delete,
}

/// Outcome reported back to the originating device for a `mutation` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Accepted,
    Duplicate,
    Rejected,
}

/// Frozen wire-level reason codes for rejected mutations and protocol errors.
pub mod error_codes {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const STALE: &str = "stale";
    pub const TRANSIENT: &str = "transient";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const TOO_MANY_CONNECTIONS: &str = "too_many_connections";
    pub const UNKNOWN_ENTITY: &str = "unknown_entity";
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    pub const CATCHUP_TRUNCATED: &str = "catchup_truncated";
}

/// Reasons the server may close a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Superseded,
    Backpressure,
    SendTimeout,
    RateLimited,
    TooManyConnections,
    ServerShutdown,
    AuthExpired,
}

// ---------------------------------------------------------------------------
// Client -> Server frames
// ---------------------------------------------------------------------------

/// First frame on a new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub device_id: String,
    pub auth_token: String,
    #[serde(default)]
    pub since_seq: i64,
    pub protocol_version: u32,
}

/// A proposed local mutation, keyed for at-most-once processing by
/// `(device_id, client_msg_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    pub client_msg_id: String,
    pub op: Op,
    pub entity_kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    pub payload: serde_json::Value,
    pub client_timestamp: i64,
}

/// Advisory client-side last-seen marker; not used for server-side ack/retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub seq: i64,
}

/// Explicit resync request, also implied by `Hello.since_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupRequest {
    pub since_seq: i64,
}

/// Client-originated heartbeat probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub nonce: String,
}

// ---------------------------------------------------------------------------
// Server -> Client frames
// ---------------------------------------------------------------------------

/// Handshake acknowledgement, sent once admission succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub session_id: String,
    pub current_seq: i64,
    pub retention_min_seq: i64,
    pub server_time: i64,
    pub heartbeat_interval_s: u64,
}

/// Result of processing a `mutation` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub client_msg_id: String,
    pub status: MutationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A committed change log entry fanned out to interested devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_device_id: Option<String>,
    pub op: Op,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub post_image: serde_json::Value,
    pub server_timestamp: i64,
}

/// Sent once a catchup replay has drained the log up to `up_to_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupComplete {
    pub up_to_seq: i64,
}

/// Sent instead of a replay when the requested cursor precedes the
/// retained horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupTruncated {
    pub current_min_seq: i64,
}

/// Server reply to a client `ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: String,
}

/// Protocol/resource error. `fatal` implies the connection is about to close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}

/// Server-initiated close notice, sent best-effort before the socket drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    pub reason: CloseReason,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// Every frame exchanged on the persistent sync channel.
///
/// Serializes/deserializes using the `type` field as a tag:
///
/// ```json
/// { "type": "hello", "device_id": "...", ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum WsMessage {
    Hello(Hello),
    Mutation(MutationEnvelope),
    Ack(Ack),
    Catchup(CatchupRequest),
    Ping(Ping),
    HelloAck(HelloAck),
    MutationResult(MutationResult),
    Event(ChangeEvent),
    CatchupComplete(CatchupComplete),
    CatchupTruncated(CatchupTruncated),
    Pong(Pong),
    Error(ErrorMessage),
    Close(Close),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips_through_json() {
        let hello = WsMessage::Hello(Hello {
            device_id: "D1".to_owned(),
            auth_token: "tok".to_owned(),
            since_seq: 0,
            protocol_version: 1,
        });
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"type\":\"hello\""));
        let back: WsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(hello, back);
    }

    #[test]
    fn mutation_entity_id_is_omitted_when_absent() {
        let mutation = MutationEnvelope {
            client_msg_id: "a".to_owned(),
            op: Op::Create,
            entity_kind: EntityKind::Bookmark,
            entity_id: None,
            payload: serde_json::json!({"url": "https://x"}),
            client_timestamp: 100,
        };
        let json = serde_json::to_value(&mutation).unwrap();
        assert!(json.get("entity_id").is_none());
    }

    #[test]
    fn event_tag_matches_contract() {
        let event = WsMessage::Event(ChangeEvent {
            seq: 1,
            origin_device_id: Some("D1".to_owned()),
            op: Op::Create,
            entity_kind: EntityKind::Bookmark,
            entity_id: Uuid::nil(),
            post_image: serde_json::json!({}),
            server_timestamp: 1000,
        });
        let json = serde_json::to_string(&event).unwrap();
        let back: WsMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
