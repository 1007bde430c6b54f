use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque token chosen by a consumer to correlate a request with its
/// response. Unique only within the consumer that chose it.
pub type RequestId = String;

/// Reasons an inbound frame could not be turned into an [`Inbound`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("message is not a JSON object")]
    Malformed,
    #[error("{kind} message carries no string reqId")]
    MissingRequestId { kind: &'static str },
    #[error("register message is missing required fields or names an unknown role")]
    InvalidRegistration,
}

impl EnvelopeError {
    pub fn reply(&self) -> Reply {
        match self {
            EnvelopeError::Malformed | EnvelopeError::MissingRequestId { .. } => Reply::BadJson,
            EnvelopeError::InvalidRegistration => Reply::InvalidRegister,
        }
    }
}

/// A well-formed `register` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The endpoint that performs the real HTTP calls.
    Provider { id: String, token: String },
    /// A client asking to be bound to provider `target`.
    Consumer { target: String, token: String },
}

/// An inbound message, parsed once at the connection boundary.
///
/// Only the fields the relay routes on are extracted. Everything else in a
/// `proxy_req` / `proxy_res` envelope (method, url, headers, body, status)
/// stays opaque and is forwarded as the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Register(Registration),
    ProxyRequest { req_id: RequestId },
    /// `req_id` is checked by the router once the sender is known to be a
    /// provider; responses from anyone else are dropped unread.
    ProxyResponse { req_id: Option<RequestId> },
    /// Any other `type`, including a missing or non-string one.
    Unknown { kind: Option<String> },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let fields: Map<String, Value> =
            serde_json::from_str(text).map_err(|_| EnvelopeError::Malformed)?;

        match fields.get("type").and_then(Value::as_str) {
            Some("register") => parse_registration(&fields).map(Inbound::Register),
            Some("proxy_req") => Ok(Inbound::ProxyRequest {
                req_id: request_id(&fields, "proxy_req")?,
            }),
            Some("proxy_res") => Ok(Inbound::ProxyResponse {
                req_id: request_id(&fields, "proxy_res").ok(),
            }),
            other => Ok(Inbound::Unknown {
                kind: other.map(str::to_string),
            }),
        }
    }
}

fn parse_registration(fields: &Map<String, Value>) -> Result<Registration, EnvelopeError> {
    let token = non_empty(fields, "token");

    // `phone` / `client` are the role names the first mobile builds sent.
    match fields.get("role").and_then(Value::as_str) {
        Some("provider" | "phone") => match (non_empty(fields, "id"), token) {
            (Some(id), Some(token)) => Ok(Registration::Provider { id, token }),
            _ => Err(EnvelopeError::InvalidRegistration),
        },
        Some("consumer" | "client") => match (non_empty(fields, "target"), token) {
            (Some(target), Some(token)) => Ok(Registration::Consumer { target, token }),
            _ => Err(EnvelopeError::InvalidRegistration),
        },
        _ => Err(EnvelopeError::InvalidRegistration),
    }
}

fn non_empty(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn request_id(fields: &Map<String, Value>, kind: &'static str) -> Result<RequestId, EnvelopeError> {
    fields
        .get("reqId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(EnvelopeError::MissingRequestId { kind })
}

/// A message originated by the relay itself.
///
/// Registration outcomes carry `ok`; routing failures carry only `error`.
/// The `error` strings are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    ProviderRegistered,
    ConsumerRegistered,
    InvalidRegister,
    AlreadyRegistered,
    AuthenticationFailed,
    BadJson,
    NotRegisteredAsClient,
    TargetNotAvailable,
    FailedForward,
    UnknownType,
}

#[derive(Serialize)]
struct ReplyBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

impl Reply {
    fn body(self) -> ReplyBody {
        let (ok, msg, error) = match self {
            Reply::ProviderRegistered => (Some(true), Some("provider registered"), None),
            Reply::ConsumerRegistered => (Some(true), Some("consumer registered"), None),
            Reply::InvalidRegister => (Some(false), None, Some("invalid_register")),
            Reply::AlreadyRegistered => (Some(false), None, Some("already_registered")),
            Reply::AuthenticationFailed => {
                (Some(false), None, Some("target_not_found_or_bad_token"))
            }
            Reply::BadJson => (None, None, Some("bad-json")),
            Reply::NotRegisteredAsClient => (None, None, Some("not_registered_as_client")),
            Reply::TargetNotAvailable => (None, None, Some("target_not_available")),
            Reply::FailedForward => (None, None, Some("failed_forward")),
            Reply::UnknownType => (Some(false), None, Some("unknown_type")),
        };
        ReplyBody { ok, msg, error }
    }
}

impl Serialize for Reply {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body().serialize(serializer)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
