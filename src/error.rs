//! Error types for the AMQP client orchestration layer
//!
//! Maps the protocol-level failure surface (AMQP error conditions carried by
//! detach/disposition frames) and the client-local failure surface (deadlines,
//! misconfiguration, aggregate batch failures) onto typed errors.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type ClientResult<T> = std::result::Result<T, AmqpClientError>;

/// Standard AMQP 1.0 error condition symbols, plus a `Custom` escape hatch
/// for vendor-specific conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    InternalError,
    NotFound,
    UnauthorizedAccess,
    DecodeError,
    ResourceLimitExceeded,
    NotAllowed,
    InvalidField,
    NotImplemented,
    ResourceLocked,
    PreconditionFailed,
    ResourceDeleted,
    IllegalState,
    FrameSizeTooSmall,
    ConnectionForced,
    FramingError,
    ConnectionRedirect,
    WindowViolation,
    ErrantLink,
    HandleInUse,
    UnattachedHandle,
    DetachForced,
    TransferLimitExceeded,
    MessageSizeExceeded,
    LinkRedirect,
    Stolen,
    /// Condition symbol outside the core specification.
    Custom(String),
}

impl ErrorCondition {
    /// The wire symbol for this condition.
    pub fn as_symbol(&self) -> &str {
        match self {
            ErrorCondition::InternalError => "amqp:internal-error",
            ErrorCondition::NotFound => "amqp:not-found",
            ErrorCondition::UnauthorizedAccess => "amqp:unauthorized-access",
            ErrorCondition::DecodeError => "amqp:decode-error",
            ErrorCondition::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            ErrorCondition::NotAllowed => "amqp:not-allowed",
            ErrorCondition::InvalidField => "amqp:invalid-field",
            ErrorCondition::NotImplemented => "amqp:not-implemented",
            ErrorCondition::ResourceLocked => "amqp:resource-locked",
            ErrorCondition::PreconditionFailed => "amqp:precondition-failed",
            ErrorCondition::ResourceDeleted => "amqp:resource-deleted",
            ErrorCondition::IllegalState => "amqp:illegal-state",
            ErrorCondition::FrameSizeTooSmall => "amqp:frame-size-too-small",
            ErrorCondition::ConnectionForced => "amqp:connection:forced",
            ErrorCondition::FramingError => "amqp:connection:framing-error",
            ErrorCondition::ConnectionRedirect => "amqp:connection:redirect",
            ErrorCondition::WindowViolation => "amqp:session:window-violation",
            ErrorCondition::ErrantLink => "amqp:session:errant-link",
            ErrorCondition::HandleInUse => "amqp:session:handle-in-use",
            ErrorCondition::UnattachedHandle => "amqp:session:unattached-handle",
            ErrorCondition::DetachForced => "amqp:link:detach-forced",
            ErrorCondition::TransferLimitExceeded => "amqp:link:transfer-limit-exceeded",
            ErrorCondition::MessageSizeExceeded => "amqp:link:message-size-exceeded",
            ErrorCondition::LinkRedirect => "amqp:link:redirect",
            ErrorCondition::Stolen => "amqp:link:stolen",
            ErrorCondition::Custom(symbol) => symbol,
        }
    }

    /// Parse a wire symbol into a typed condition.
    /// Unknown symbols are preserved verbatim as `Custom`.
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "amqp:internal-error" => ErrorCondition::InternalError,
            "amqp:not-found" => ErrorCondition::NotFound,
            "amqp:unauthorized-access" => ErrorCondition::UnauthorizedAccess,
            "amqp:decode-error" => ErrorCondition::DecodeError,
            "amqp:resource-limit-exceeded" => ErrorCondition::ResourceLimitExceeded,
            "amqp:not-allowed" => ErrorCondition::NotAllowed,
            "amqp:invalid-field" => ErrorCondition::InvalidField,
            "amqp:not-implemented" => ErrorCondition::NotImplemented,
            "amqp:resource-locked" => ErrorCondition::ResourceLocked,
            "amqp:precondition-failed" => ErrorCondition::PreconditionFailed,
            "amqp:resource-deleted" => ErrorCondition::ResourceDeleted,
            "amqp:illegal-state" => ErrorCondition::IllegalState,
            "amqp:frame-size-too-small" => ErrorCondition::FrameSizeTooSmall,
            "amqp:connection:forced" => ErrorCondition::ConnectionForced,
            "amqp:connection:framing-error" => ErrorCondition::FramingError,
            "amqp:connection:redirect" => ErrorCondition::ConnectionRedirect,
            "amqp:session:window-violation" => ErrorCondition::WindowViolation,
            "amqp:session:errant-link" => ErrorCondition::ErrantLink,
            "amqp:session:handle-in-use" => ErrorCondition::HandleInUse,
            "amqp:session:unattached-handle" => ErrorCondition::UnattachedHandle,
            "amqp:link:detach-forced" => ErrorCondition::DetachForced,
            "amqp:link:transfer-limit-exceeded" => ErrorCondition::TransferLimitExceeded,
            "amqp:link:message-size-exceeded" => ErrorCondition::MessageSizeExceeded,
            "amqp:link:redirect" => ErrorCondition::LinkRedirect,
            "amqp:link:stolen" => ErrorCondition::Stolen,
            other => ErrorCondition::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// A protocol error reported by the peer: condition symbol plus optional
/// description and info map, as carried by error frames.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpError {
    pub condition: ErrorCondition,
    pub description: Option<String>,
    pub info: HashMap<String, serde_json::Value>,
}

impl AmqpError {
    pub fn new(condition: ErrorCondition) -> Self {
        Self {
            condition,
            description: None,
            info: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.info.insert(key.into(), value);
        self
    }

    /// Synthesized error for an absent or empty delivery outcome.
    pub fn unknown() -> Self {
        Self::new(ErrorCondition::Custom("unknown-error".to_string()))
            .with_description("delivery failed without a reported outcome")
    }
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl std::error::Error for AmqpError {}

/// Main error type for client operations.
///
/// Message-level failures are resolved into each message's terminal outcome
/// and surfaced only in aggregate (`SendFailed`); this type raises out of
/// `do_work()` only for client/session/connection-level fatal errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AmqpClientError {
    /// A client-side deadline elapsed (message send timeout, batch deadline).
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The CBS token handshake window expired before completing.
    #[error("authentication handshake expired before completion")]
    AuthTimeout,

    /// A protocol error reported by the peer.
    #[error(transparent)]
    Amqp(#[from] AmqpError),

    /// The link handler entered an error state. Fatal for this client
    /// instance: close it and construct a new one.
    #[error("link handler error: {0}")]
    Handler(AmqpError),

    /// Aggregate failure summary over a batch send.
    #[error("{failed} of {total} messages failed to send")]
    SendFailed {
        total: usize,
        failed: usize,
        errors: Vec<AmqpClientError>,
    },

    /// An argument outside the allowed range (e.g. a batch size exceeding
    /// the configured prefetch).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A construction-time configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The client has been closed and cannot be reused.
    #[error("client has been closed")]
    ClientClosed,
}

impl AmqpClientError {
    /// Create a client-side timeout error.
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout(context.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error came from the peer (as opposed to a local
    /// deadline or misuse).
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, AmqpClientError::Amqp(_) | AmqpClientError::Handler(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_symbol_round_trip() {
        let conditions = vec![
            ErrorCondition::InternalError,
            ErrorCondition::ResourceLimitExceeded,
            ErrorCondition::DetachForced,
            ErrorCondition::LinkRedirect,
            ErrorCondition::Stolen,
        ];
        for condition in conditions {
            let symbol = condition.as_symbol().to_string();
            assert_eq!(ErrorCondition::from_symbol(&symbol), condition);
        }
    }

    #[test]
    fn test_unknown_symbol_preserved_as_custom() {
        let condition = ErrorCondition::from_symbol("com.example:server-busy");
        assert_eq!(
            condition,
            ErrorCondition::Custom("com.example:server-busy".to_string())
        );
        assert_eq!(condition.as_symbol(), "com.example:server-busy");
    }

    #[test]
    fn test_amqp_error_display() {
        let bare = AmqpError::new(ErrorCondition::NotFound);
        assert_eq!(bare.to_string(), "amqp:not-found");

        let described =
            AmqpError::new(ErrorCondition::InternalError).with_description("server hiccup");
        assert_eq!(described.to_string(), "amqp:internal-error: server hiccup");
    }

    #[test]
    fn test_client_error_display_non_empty() {
        let errors = vec![
            AmqpClientError::timeout("message expired"),
            AmqpClientError::AuthTimeout,
            AmqpClientError::Handler(AmqpError::new(ErrorCondition::DetachForced)),
            AmqpClientError::SendFailed {
                total: 3,
                failed: 1,
                errors: vec![AmqpClientError::timeout("message expired")],
            },
            AmqpClientError::invalid_argument("batch too large"),
            AmqpClientError::ClientClosed,
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_send_failed_summary() {
        let error = AmqpClientError::SendFailed {
            total: 5,
            failed: 2,
            errors: vec![],
        };
        assert_eq!(error.to_string(), "2 of 5 messages failed to send");
    }
}
