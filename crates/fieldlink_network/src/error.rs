//! Network error types.

use crate::message::MessageKind;

/// Errors raised inside the transport layer. None of these travel back to
/// the remote sender; the coordinator logs and drops.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (socket or broker client).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The link is not connected, so the send was refused.
    #[error("Link not connected")]
    NotConnected,

    /// The route does not fit the link it was handed to.
    #[error("Route not supported by this link: {0}")]
    UnsupportedRoute(String),

    /// Wire encoding / decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A kind-specific payload failed validation.
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// The signing/encryption collaborator rejected an envelope.
    #[error("Seal error: {0}")]
    Seal(String),

    /// Delivery-state persistence failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors turning raw bytes into an envelope, or an envelope into bytes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown message type `{0}`")]
    UnknownKind(String),

    #[error("unknown topic `{0}`")]
    UnknownTopic(String),

    #[error("payload uses reserved key `{0}`")]
    ReservedKey(String),
}

/// Errors validating a kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("{kind} payload missing required field `{field}`")]
    MissingField { kind: MessageKind, field: String },

    #[error("{kind} payload malformed: {reason}")]
    Malformed { kind: MessageKind, reason: String },

    #[error("expected a {expected} payload, got {actual}")]
    WrongKind {
        expected: MessageKind,
        actual: MessageKind,
    },
}

impl PayloadError {
    /// Classifies a serde failure, lifting "missing field" into its own variant.
    pub(crate) fn from_serde(kind: MessageKind, err: serde_json::Error) -> Self {
        let reason = err.to_string();
        if let Some(rest) = reason.strip_prefix("missing field `") {
            if let Some(field) = rest.split('`').next() {
                return Self::MissingField {
                    kind,
                    field: field.to_string(),
                };
            }
        }
        Self::Malformed { kind, reason }
    }
}
