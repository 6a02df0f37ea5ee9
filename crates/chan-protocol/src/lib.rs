// chan-protocol: Channel server wire protocol types and serialization.
//
// All outbound WebSocket envelopes use a top-level `type` field for
// discriminated serialization.  Inbound frames cannot use a plain tagged
// enum because the classification rules treat a `route` field with no
// `type` as a virtual-HTTP request; `ClientFrame::parse` implements the
// classification explicitly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// Coarse authorization label attached to a registered route or frame type.
///
/// `System` is reserved for internal server-to-server calls and is never
/// reachable from a regular client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Public,
    Read,
    Write,
    Private,
    System,
}

// ---------------------------------------------------------------------------
// Frozen wire error codes
// ---------------------------------------------------------------------------

pub mod error_codes {
    pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const CAPACITY_EXHAUSTED: &str = "CAPACITY_EXHAUSTED";
    pub const AUTH_MALFORMED: &str = "AUTH_MALFORMED";
    pub const AUTH_BAD_SIGNATURE: &str = "AUTH_BAD_SIGNATURE";
    pub const AUTH_EXPIRED: &str = "AUTH_EXPIRED";
    pub const AUTH_PROFILE_NOT_FOUND: &str = "AUTH_PROFILE_NOT_FOUND";
    pub const TASK_FAILED: &str = "TASK_FAILED";
    pub const PERSISTENCE_ERROR: &str = "PERSISTENCE_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// Identity of an authenticated session as exposed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub account_id: i64,
    pub profile_id: i64,
    /// Tenant scope; None for accounts without an entity binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<i64>,
}

/// Acknowledgement level for a delivery.
///
/// `app` implies `client` semantics: a delivery that reaches `app` is
/// considered fully acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckLevel {
    Client,
    App,
}

/// HTTP-semantic method carried by virtual-HTTP frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

/// Typed form of the `X-Account-ID` / `X-Profile-ID` / `X-Client-FD` /
/// `X-Trace-ID` meta headers injected by the Frame Router for task workers.
/// Passed alongside the request envelope instead of free-form headers to
/// avoid serialization ambiguities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedIdentity {
    pub account_id: i64,
    pub profile_id: i64,
    pub client_fd: u64,
    pub trace_id: String,
}

// ---------------------------------------------------------------------------
// Inbound frames (client -> server)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFrame {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeFrame {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeFrame {
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishFrame {
    pub channel: String,
    pub message: Value,
    /// Client-supplied id for idempotent republish; the server assigns one
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub message_id: String,
    pub level: AckLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFrame {
    /// Optional channel filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// A virtual-HTTP request carried inside a WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub route: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Auth(AuthFrame),
    Subscribe(SubscribeFrame),
    Unsubscribe(UnsubscribeFrame),
    Publish(PublishFrame),
    Ack(AckFrame),
    Ping,
    Pending(PendingFrame),
    Fingerprint,
    Endpoint(EndpointRequest),
}

/// Why an inbound frame failed to classify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    InvalidJson(String),
    /// Decoded JSON is not an object.
    NotAnObject,
    /// No `type` and no `route` field.
    MissingType,
    UnknownType(String),
    /// `type` was recognized but the payload did not match its schema.
    InvalidPayload { frame_type: String, detail: String },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(e) => write!(f, "invalid JSON: {e}"),
            Self::NotAnObject => write!(f, "frame is not a JSON object"),
            Self::MissingType => write!(f, "frame has no type or route field"),
            Self::UnknownType(t) => write!(f, "unknown frame type '{t}'"),
            Self::InvalidPayload { frame_type, detail } => {
                write!(f, "invalid {frame_type} payload: {detail}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl ClientFrame {
    /// Classify and decode one inbound text frame.
    ///
    /// Classification rules, in order:
    /// 1. `type == "api"` or `type == "endpoint"`, or a `route` field with
    ///    no `type` at all, is a virtual-HTTP request.
    /// 2. Otherwise `type` must name a registered native frame kind.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let obj = value.as_object().ok_or(FrameError::NotAnObject)?;

        let frame_type = obj.get("type").and_then(Value::as_str);
        let has_route = obj.contains_key("route");

        match frame_type {
            Some("api" | "endpoint") => decode("endpoint", &value).map(Self::Endpoint),
            None if has_route => decode("endpoint", &value).map(Self::Endpoint),
            None => Err(FrameError::MissingType),
            Some("auth") => decode("auth", &value).map(Self::Auth),
            Some("subscribe") => decode("subscribe", &value).map(Self::Subscribe),
            Some("unsubscribe") => decode("unsubscribe", &value).map(Self::Unsubscribe),
            Some("publish") => decode("publish", &value).map(Self::Publish),
            Some("ack") => decode("ack", &value).map(Self::Ack),
            Some("ping") => Ok(Self::Ping),
            Some("pending") => decode("pending", &value).map(Self::Pending),
            Some("fingerprint") => Ok(Self::Fingerprint),
            Some(other) => Err(FrameError::UnknownType(other.to_owned())),
        }
    }

    /// The native type name this frame is dispatched under, as registered in
    /// the handler registry.  Virtual-HTTP frames dispatch by route instead.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Publish(_) => "publish",
            Self::Ack(_) => "ack",
            Self::Ping => "ping",
            Self::Pending(_) => "pending",
            Self::Fingerprint => "fingerprint",
            Self::Endpoint(_) => "endpoint",
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(frame_type: &str, value: &Value) -> Result<T, FrameError> {
    serde_json::from_value(value.clone()).map_err(|e| FrameError::InvalidPayload {
        frame_type: frame_type.to_owned(),
        detail: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Outbound envelopes (server -> client)
// ---------------------------------------------------------------------------

/// System envelope, e.g. the `connected` greeting sent on open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEnvelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub fd: u64,
    pub timestamp: i64,
}

/// Error envelope.  `message` carries the human-readable reason; `code` is
/// one of the frozen codes in [`error_codes`].  `status` carries the
/// HTTP-semantic marker (401, 403, 404) where the taxonomy defines one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserIdentity>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub success: bool,
    pub channel: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeResponse {
    pub success: bool,
    pub channel: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub success: bool,
    pub message_id: String,
    /// Online subscribers the message was pushed to.
    pub sent_to: u64,
    pub timestamp: i64,
}

/// Fan-out delivery of a published message to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelivery {
    pub channel: String,
    pub message: Value,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub from: UserIdentity,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub message_id: String,
    pub level: AckLevel,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongEnvelope {
    pub timestamp: i64,
}

/// One delivery row in a `pending` response, ordered
/// `priority desc, created_at asc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub message_id: String,
    pub channel: String,
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    pub priority: i64,
    pub state: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingResponse {
    pub deliveries: Vec<PendingDelivery>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintResponse {
    /// The device hash the session authenticated with, verbatim.
    pub device_hash: String,
    /// SHA-256 over `device_hash || fd`, hex-encoded.
    pub fingerprint: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestChannel {
    pub channel: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Rollup of missed messages, delivered once after reconnect auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestFrame {
    pub total: u64,
    pub channels: Vec<DigestChannel>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointQueued {
    pub correlation_id: String,
    pub task_id: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub correlation_id: String,
    pub status: ApiStatus,
    pub data: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub correlation_id: String,
    pub status: u16,
    pub message: String,
    pub timestamp: i64,
}

/// All outbound envelope kinds.
///
/// Serializes using the `type` field as a tag:
///
/// ```json
/// { "type": "publish", "success": true, ... }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    System(SystemEnvelope),
    Error(ErrorEnvelope),
    Auth(AuthResponse),
    Subscribe(SubscribeResponse),
    Unsubscribe(UnsubscribeResponse),
    Publish(PublishResponse),
    Message(MessageDelivery),
    Ack(AckResponse),
    Pong(PongEnvelope),
    Pending(PendingResponse),
    Fingerprint(FingerprintResponse),
    Digest(DigestFrame),
    EndpointQueued(EndpointQueued),
    ApiResponse(ApiResponse),
    ApiError(ApiError),
}
