use thiserror::Error;

use crate::connection::{AlreadyRegistered, SendError};
use crate::envelope::{EnvelopeError, Reply};

/// Everything that can go wrong while routing one inbound message.
///
/// Each variant maps to the [`Reply`] sent back to the originating peer.
/// Only [`RouteError::AuthenticationFailed`] also closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    AlreadyRegistered(#[from] AlreadyRegistered),

    #[error("no provider '{target}' with a matching token")]
    AuthenticationFailed { target: String },

    #[error("sender is not registered as a consumer")]
    NotRegistered,

    #[error("provider '{target}' is not available")]
    TargetUnavailable { target: String },

    #[error("failed to forward to provider '{target}': {source}")]
    ForwardFailed { target: String, source: SendError },

    #[error("unknown message type {kind:?}")]
    UnknownType { kind: Option<String> },
}

impl RouteError {
    pub fn reply(&self) -> Reply {
        match self {
            RouteError::Envelope(err) => err.reply(),
            RouteError::AlreadyRegistered(_) => Reply::AlreadyRegistered,
            RouteError::AuthenticationFailed { .. } => Reply::AuthenticationFailed,
            RouteError::NotRegistered => Reply::NotRegisteredAsClient,
            RouteError::TargetUnavailable { .. } => Reply::TargetNotAvailable,
            RouteError::ForwardFailed { .. } => Reply::FailedForward,
            RouteError::UnknownType { .. } => Reply::UnknownType,
        }
    }

    /// Whether the connection must be closed after replying.
    pub fn closes_connection(&self) -> bool {
        matches!(self, RouteError::AuthenticationFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Role;

    #[test]
    fn only_authentication_failure_closes() {
        let errors = [
            RouteError::Envelope(EnvelopeError::Malformed),
            RouteError::AlreadyRegistered(AlreadyRegistered(Role::Provider)),
            RouteError::NotRegistered,
            RouteError::TargetUnavailable { target: "P1".into() },
            RouteError::ForwardFailed {
                target: "P1".into(),
                source: SendError::Closed,
            },
            RouteError::UnknownType { kind: None },
        ];
        for err in &errors {
            assert!(!err.closes_connection(), "{err}");
        }
        assert!(RouteError::AuthenticationFailed { target: "P1".into() }.closes_connection());
    }

    #[test]
    fn envelope_errors_keep_their_reply() {
        assert_eq!(
            RouteError::from(EnvelopeError::InvalidRegistration).reply(),
            Reply::InvalidRegister
        );
        assert_eq!(
            RouteError::from(EnvelopeError::MissingRequestId { kind: "proxy_res" }).reply(),
            Reply::BadJson
        );
    }
}
