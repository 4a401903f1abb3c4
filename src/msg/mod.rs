//! Wire message types and codec.
//!
//! Every frame on the transport is a JSON object with a `meta` header
//! (`uuid`, `type`, `timestamp`) and a type-specific `payload`. The codec is
//! pure: it touches no I/O and keeps no state. Opaque `args` bytes travel
//! base64-encoded because the transport frames are text.
//!
//! This module also defines the broker payload families ([`CallPayload`],
//! [`ResPayload`], [`PubPayload`], [`EvntPayload`]) that adapters serialize
//! into their backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Codec result type.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors produced by the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// The frame is not a well-formed JSON object.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The `meta.type` discriminator is not a known message type.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A required header or payload field is missing or has the wrong shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The message could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// NACK codes carried on the wire alongside the error message.
pub mod nack_code {
    pub const MALFORMED_FRAME: i32 = 1;
    pub const UNKNOWN_TYPE: i32 = 2;
    pub const INVALID_PAYLOAD: i32 = 3;
    pub const BROKER_UNAVAILABLE: i32 = 4;
    pub const BROKER_TIMEOUT: i32 = 5;
    pub const AUTH_FAILED: i32 = 6;
}

impl ProtoError {
    /// The NACK code for this decode error.
    pub fn nack_code(&self) -> i32 {
        match self {
            ProtoError::MalformedFrame(_) => nack_code::MALFORMED_FRAME,
            ProtoError::UnknownType(_) => nack_code::UNKNOWN_TYPE,
            ProtoError::InvalidPayload(_) => nack_code::INVALID_PAYLOAD,
            ProtoError::Encode(_) => nack_code::MALFORMED_FRAME,
        }
    }
}

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    Auth,
    Call,
    Pub,
    Sub,
    Unsb,
    Ack,
    Nack,
    Res,
    Evnt,
}

impl MsgType {
    /// Wire discriminator string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Auth => "auth",
            MsgType::Call => "call",
            MsgType::Pub => "pub",
            MsgType::Sub => "sub",
            MsgType::Unsb => "unsb",
            MsgType::Ack => "ack",
            MsgType::Nack => "nack",
            MsgType::Res => "res",
            MsgType::Evnt => "evnt",
        }
    }

    fn from_wire(s: &str) -> Option<MsgType> {
        Some(match s {
            "auth" => MsgType::Auth,
            "call" => MsgType::Call,
            "pub" => MsgType::Pub,
            "sub" => MsgType::Sub,
            "unsb" => MsgType::Unsb,
            "ack" => MsgType::Ack,
            "nack" => MsgType::Nack,
            "res" => MsgType::Res,
            "evnt" => MsgType::Evnt,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame header: message UUID, type discriminator, UTC-millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Meta {
    /// Stamp a fresh header: random v4 UUID and the current time.
    ///
    /// The timestamp is truncated to millisecond precision, matching the wire
    /// resolution so that an encoded message decodes back equal.
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            msg_type,
            timestamp: now_ms(),
        }
    }
}

/// Current UTC time truncated to wire (millisecond) resolution.
pub(crate) fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
        .expect("current time is representable")
}

/// Base64 transport encoding for opaque argument bytes.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Wire payloads (client <-> server)
// ---------------------------------------------------------------------------

/// AUTH payload: opaque credential bytes for the pluggable authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    #[serde(with = "b64")]
    pub args: Vec<u8>,
}

/// CALL payload as sent by a caller.
///
/// `timeout_ns` is optional; the server clamps it and the broker substitutes
/// its configured default when absent or zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub uri: String,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ns: Option<u64>,
}

impl CallRequest {
    /// The requested timeout, if one was set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ns.map(Duration::from_nanos)
    }
}

/// PUB payload as sent by a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubRequest {
    pub channel: String,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
}

/// SUB payload: subscribe to a channel, or to a glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRequest {
    pub channel: String,
    #[serde(default)]
    pub pattern: bool,
}

/// UNSB payload: mirror of [`SubRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsbRequest {
    pub channel: String,
    #[serde(default)]
    pub pattern: bool,
}

/// ACK payload: positive acknowledgement of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    pub for_type: MsgType,
}

/// NACK payload: rejection of an inbound message.
///
/// `for_type` is absent when the offending frame was too malformed to carry
/// one; `for` is the nil UUID in that case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackPayload {
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_type: Option<MsgType>,
    pub code: i32,
    pub message: String,
}

/// RES payload as written to the caller connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResFrame {
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    pub conn_uuid: Uuid,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
}

/// EVNT payload as written to a subscriber connection.
///
/// `for` is the UUID of the originating PUB message; `pattern` is empty when
/// the subscription matched by exact channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvntFrame {
    #[serde(rename = "for")]
    pub for_uuid: Uuid,
    pub channel: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Broker payload families
// ---------------------------------------------------------------------------

/// A call request as shuttled through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPayload {
    pub msg_uuid: Uuid,
    pub conn_uuid: Uuid,
    pub uri: String,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
    /// Stamped by the broker at submit time: `now + timeout`.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl CallPayload {
    /// Build a call payload for submission.
    ///
    /// `expires_at` is provisional; the broker stamps the real expiration
    /// from the submit timeout.
    pub fn new(msg_uuid: Uuid, conn_uuid: Uuid, uri: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            msg_uuid,
            conn_uuid,
            uri: uri.into(),
            args,
            expires_at: now_ms(),
        }
    }

    /// Whether the in-queue lifetime of this call has elapsed.
    pub fn expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// A call result as shuttled through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResPayload {
    pub msg_uuid: Uuid,
    pub conn_uuid: Uuid,
    pub for_uuid: Uuid,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
}

impl ResPayload {
    /// Build the result for a consumed call request.
    pub fn for_call(cp: &CallPayload, args: Vec<u8>) -> Self {
        Self {
            msg_uuid: Uuid::new_v4(),
            conn_uuid: cp.conn_uuid,
            for_uuid: cp.msg_uuid,
            args,
        }
    }
}

/// A published event as shuttled through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubPayload {
    pub msg_uuid: Uuid,
    pub channel: String,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
}

/// An event as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvntPayload {
    /// UUID of the originating PUB message.
    pub msg_uuid: Uuid,
    /// Channel the event was published on.
    pub channel: String,
    /// Pattern that matched the subscription; empty for an exact match.
    pub pattern: String,
    #[serde(with = "b64")]
    pub args: Vec<u8>,
}

impl EvntPayload {
    /// Build the event delivered for a published payload.
    pub fn from_pub(pp: &PubPayload, channel: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            msg_uuid: pp.msg_uuid,
            channel: channel.into(),
            pattern: pattern.into(),
            args: pp.args.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message union
// ---------------------------------------------------------------------------

/// A decoded frame: header plus type-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Auth { meta: Meta, payload: AuthPayload },
    Call { meta: Meta, payload: CallRequest },
    Pub { meta: Meta, payload: PubRequest },
    Sub { meta: Meta, payload: SubRequest },
    Unsb { meta: Meta, payload: UnsbRequest },
    Ack { meta: Meta, payload: AckPayload },
    Nack { meta: Meta, payload: NackPayload },
    Res { meta: Meta, payload: ResFrame },
    Evnt { meta: Meta, payload: EvntFrame },
}

impl Msg {
    /// New AUTH message.
    pub fn auth(args: Vec<u8>) -> Msg {
        Msg::Auth {
            meta: Meta::new(MsgType::Auth),
            payload: AuthPayload { args },
        }
    }

    /// New CALL message.
    pub fn call(uri: impl Into<String>, args: Vec<u8>, timeout: Option<Duration>) -> Msg {
        Msg::Call {
            meta: Meta::new(MsgType::Call),
            payload: CallRequest {
                uri: uri.into(),
                args,
                timeout_ns: timeout.map(|t| t.as_nanos() as u64),
            },
        }
    }

    /// New PUB message.
    pub fn publish(channel: impl Into<String>, args: Vec<u8>) -> Msg {
        Msg::Pub {
            meta: Meta::new(MsgType::Pub),
            payload: PubRequest {
                channel: channel.into(),
                args,
            },
        }
    }

    /// New SUB message.
    pub fn sub(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg::Sub {
            meta: Meta::new(MsgType::Sub),
            payload: SubRequest {
                channel: channel.into(),
                pattern,
            },
        }
    }

    /// New UNSB message.
    pub fn unsb(channel: impl Into<String>, pattern: bool) -> Msg {
        Msg::Unsb {
            meta: Meta::new(MsgType::Unsb),
            payload: UnsbRequest {
                channel: channel.into(),
                pattern,
            },
        }
    }

    /// New ACK for a received message header.
    pub fn ack(for_meta: &Meta) -> Msg {
        Msg::Ack {
            meta: Meta::new(MsgType::Ack),
            payload: AckPayload {
                for_uuid: for_meta.uuid,
                for_type: for_meta.msg_type,
            },
        }
    }

    /// New NACK for a received message header.
    pub fn nack(for_meta: &Meta, code: i32, message: impl Into<String>) -> Msg {
        Msg::Nack {
            meta: Meta::new(MsgType::Nack),
            payload: NackPayload {
                for_uuid: for_meta.uuid,
                for_type: Some(for_meta.msg_type),
                code,
                message: message.into(),
            },
        }
    }

    /// New NACK for a frame that could not be decoded at all.
    pub fn nack_undecodable(code: i32, message: impl Into<String>) -> Msg {
        Msg::Nack {
            meta: Meta::new(MsgType::Nack),
            payload: NackPayload {
                for_uuid: Uuid::nil(),
                for_type: None,
                code,
                message: message.into(),
            },
        }
    }

    /// New RES message carrying a broker result to the caller.
    pub fn res(rp: &ResPayload) -> Msg {
        Msg::Res {
            meta: Meta::new(MsgType::Res),
            payload: ResFrame {
                for_uuid: rp.for_uuid,
                conn_uuid: rp.conn_uuid,
                args: rp.args.clone(),
            },
        }
    }

    /// New EVNT message carrying a broker event to a subscriber.
    pub fn evnt(ep: &EvntPayload) -> Msg {
        Msg::Evnt {
            meta: Meta::new(MsgType::Evnt),
            payload: EvntFrame {
                for_uuid: ep.msg_uuid,
                channel: ep.channel.clone(),
                pattern: ep.pattern.clone(),
                args: ep.args.clone(),
            },
        }
    }

    /// The frame header.
    pub fn meta(&self) -> &Meta {
        match self {
            Msg::Auth { meta, .. }
            | Msg::Call { meta, .. }
            | Msg::Pub { meta, .. }
            | Msg::Sub { meta, .. }
            | Msg::Unsb { meta, .. }
            | Msg::Ack { meta, .. }
            | Msg::Nack { meta, .. }
            | Msg::Res { meta, .. }
            | Msg::Evnt { meta, .. } => meta,
        }
    }

    /// The message UUID.
    pub fn uuid(&self) -> Uuid {
        self.meta().uuid
    }

    /// The message type.
    pub fn msg_type(&self) -> MsgType {
        self.meta().msg_type
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Frame<'a, P: Serialize> {
    meta: &'a Meta,
    payload: &'a P,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    meta: Option<RawMeta>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawMeta {
    #[serde(default)]
    uuid: Option<Uuid>,
    #[serde(rename = "type", default)]
    msg_type: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Encode a message to its wire form.
pub fn encode(msg: &Msg) -> Result<String> {
    fn frame<P: Serialize>(meta: &Meta, payload: &P) -> Result<String> {
        serde_json::to_string(&Frame { meta, payload })
            .map_err(|e| ProtoError::Encode(e.to_string()))
    }

    match msg {
        Msg::Auth { meta, payload } => frame(meta, payload),
        Msg::Call { meta, payload } => frame(meta, payload),
        Msg::Pub { meta, payload } => frame(meta, payload),
        Msg::Sub { meta, payload } => frame(meta, payload),
        Msg::Unsb { meta, payload } => frame(meta, payload),
        Msg::Ack { meta, payload } => frame(meta, payload),
        Msg::Nack { meta, payload } => frame(meta, payload),
        Msg::Res { meta, payload } => frame(meta, payload),
        Msg::Evnt { meta, payload } => frame(meta, payload),
    }
}

/// Decode a wire frame into a message.
pub fn decode(raw: &str) -> Result<Msg> {
    let frame: RawFrame =
        serde_json::from_str(raw).map_err(|e| ProtoError::MalformedFrame(e.to_string()))?;

    let meta = frame
        .meta
        .ok_or_else(|| ProtoError::InvalidPayload("missing meta".into()))?;
    let uuid = meta
        .uuid
        .ok_or_else(|| ProtoError::InvalidPayload("missing meta.uuid".into()))?;
    let type_str = meta
        .msg_type
        .ok_or_else(|| ProtoError::InvalidPayload("missing meta.type".into()))?;
    let ts = meta
        .timestamp
        .ok_or_else(|| ProtoError::InvalidPayload("missing meta.timestamp".into()))?;

    let msg_type =
        MsgType::from_wire(&type_str).ok_or_else(|| ProtoError::UnknownType(type_str.clone()))?;
    let timestamp = DateTime::from_timestamp_millis(ts)
        .ok_or_else(|| ProtoError::InvalidPayload(format!("timestamp out of range: {ts}")))?;

    let meta = Meta {
        uuid,
        msg_type,
        timestamp,
    };
    let payload = frame
        .payload
        .ok_or_else(|| ProtoError::InvalidPayload("missing payload".into()))?;

    fn parse<P: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<P> {
        serde_json::from_value(v).map_err(|e| ProtoError::InvalidPayload(e.to_string()))
    }

    Ok(match msg_type {
        MsgType::Auth => Msg::Auth {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Call => Msg::Call {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Pub => Msg::Pub {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Sub => Msg::Sub {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Unsb => Msg::Unsb {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Ack => Msg::Ack {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Nack => Msg::Nack {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Res => Msg::Res {
            meta,
            payload: parse(payload)?,
        },
        MsgType::Evnt => Msg::Evnt {
            meta,
            payload: parse(payload)?,
        },
    })
}
