//! Error taxonomy shared by the engine and the harness.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::ids::RequestId;
use crate::message::{EnvelopeError, ResponseError};
use crate::session::{ExitInfo, SessionState};

/// Failure of a caller-issued operation.
///
/// `Clone` so one transport failure can be delivered to every outstanding call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("failed to start language server `{command}`: {reason}")]
    ProcessSpawn { command: String, reason: String },

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("language server exited ({0})")]
    ProcessExited(ExitInfo),

    #[error("`{method}` is not allowed while the session is {state}")]
    SessionNotReady { method: String, state: SessionState },

    #[error("initialize failed: {cause}")]
    InitializeFailed { cause: Box<ClientError> },

    #[error("request {id} `{method}` timed out after {after:?}")]
    Timeout {
        method: String,
        id: RequestId,
        after: Duration,
    },

    #[error("request {id} was cancelled")]
    Cancelled { id: RequestId },

    #[error("server error: {0}")]
    Protocol(ResponseError),

    #[error("invalid method name {0:?}")]
    InvalidMethod(String),

    #[error("server does not advertise `{0}`")]
    CapabilityNotSupported(String),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl ClientError {
    /// The server's error code, for [`ClientError::Protocol`].
    #[must_use]
    pub fn protocol_code(&self) -> Option<i64> {
        match self {
            Self::Protocol(err) => Some(err.code),
            Self::InitializeFailed { cause } => cause.protocol_code(),
            _ => None,
        }
    }

    /// Whether the connection is gone for good.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::TransportClosed(_) | Self::ProcessExited(_))
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("version mismatch for {uri}: expected {expected}, found {actual}")]
    VersionMismatch {
        uri: String,
        expected: i32,
        actual: i32,
    },
}

/// A frame the codec could not turn into a [`crate::Message`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Framing or JSON syntax failure. The offending bytes were discarded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Valid JSON that is not a routable JSON-RPC 2.0 message.
    #[error("invalid envelope: {error}")]
    InvalidEnvelope { error: EnvelopeError, raw: Value },
}

/// Non-fatal protocol irregularity observed on a live connection.
///
/// Anomalies never fail an in-flight call; they are logged and published to
/// event subscribers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Anomaly {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid envelope: {error}")]
    InvalidEnvelope { error: EnvelopeError, raw: Value },

    #[error("response for unknown request id {0}")]
    UnsolicitedResponse(RequestId),

    /// Response for an id that was cancelled or timed out.
    #[error("late response for request {id} `{method}`")]
    LateResponse { id: RequestId, method: String },

    #[error("duplicate response for request {id} `{method}`")]
    DuplicateResponse { id: RequestId, method: String },

    #[error("no handler for notification `{0}`")]
    UnhandledNotification(String),
}

impl Anomaly {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "MalformedFrame",
            Self::InvalidEnvelope { .. } => "InvalidEnvelope",
            Self::UnsolicitedResponse(_) => "UnsolicitedResponse",
            Self::LateResponse { .. } => "LateResponse",
            Self::DuplicateResponse { .. } => "DuplicateResponse",
            Self::UnhandledNotification(_) => "UnhandledNotification",
        }
    }
}

impl From<DecodeError> for Anomaly {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::MalformedFrame(reason) => Self::MalformedFrame(reason),
            DecodeError::InvalidEnvelope { error, raw } => Self::InvalidEnvelope { error, raw },
        }
    }
}
