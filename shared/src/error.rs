//! Typed error taxonomy and fault classification
//!
//! Raw faults (I/O errors, codec errors, timeouts, or anything else that
//! implements `std::error::Error`) are mapped once into a [`TypedError`] that
//! carries a severity, a category, a recoverability flag and the recovery
//! strategy recommended for it. Classification first looks at the concrete
//! error type and only falls back to keyword inspection of the message when
//! the type says nothing useful.

use crate::protocol::{SerializationError, SerializationErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Connection,
    Protocol,
    Security,
    GameState,
    Resource,
    Configuration,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStrategyKind {
    Retry,
    Reconnect,
    Resync,
    Fallback,
}

/// The specific fault, which fixes category, severity and default handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionTimeout,
    ConnectionRefused,
    ConnectionLost,
    ProtocolMalformed,
    ProtocolOutOfOrder,
    ProtocolVersionMismatch,
    AuthenticationFailed,
    AuthorizationDenied,
    StateDesync,
    StateCorruption,
    ResourceExhausted,
    ConnectionLimit,
    Timeout,
    Configuration,
    Application,
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::ConnectionTimeout
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionLost => ErrorCategory::Connection,
            ErrorKind::ProtocolMalformed
            | ErrorKind::ProtocolOutOfOrder
            | ErrorKind::ProtocolVersionMismatch => ErrorCategory::Protocol,
            ErrorKind::AuthenticationFailed | ErrorKind::AuthorizationDenied => {
                ErrorCategory::Security
            }
            ErrorKind::StateDesync | ErrorKind::StateCorruption => ErrorCategory::GameState,
            ErrorKind::ResourceExhausted | ErrorKind::ConnectionLimit => ErrorCategory::Resource,
            ErrorKind::Configuration => ErrorCategory::Configuration,
            ErrorKind::Timeout | ErrorKind::Application => ErrorCategory::Application,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::ConnectionTimeout | ErrorKind::Timeout | ErrorKind::ProtocolOutOfOrder => {
                Severity::Warn
            }
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionLost
            | ErrorKind::ProtocolMalformed
            | ErrorKind::StateDesync
            | ErrorKind::ConnectionLimit
            | ErrorKind::AuthenticationFailed
            | ErrorKind::AuthorizationDenied => Severity::Error,
            ErrorKind::ProtocolVersionMismatch
            | ErrorKind::StateCorruption
            | ErrorKind::ResourceExhausted
            | ErrorKind::Configuration
            | ErrorKind::Application => Severity::Critical,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::Configuration | ErrorKind::Application)
    }

    pub fn recommended_strategy(&self) -> RecoveryStrategyKind {
        match self {
            ErrorKind::ConnectionTimeout | ErrorKind::Timeout => RecoveryStrategyKind::Retry,
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionLost => {
                RecoveryStrategyKind::Reconnect
            }
            ErrorKind::StateDesync | ErrorKind::StateCorruption => RecoveryStrategyKind::Resync,
            ErrorKind::ProtocolMalformed
            | ErrorKind::ProtocolOutOfOrder
            | ErrorKind::ProtocolVersionMismatch
            | ErrorKind::AuthenticationFailed
            | ErrorKind::AuthorizationDenied
            | ErrorKind::ResourceExhausted
            | ErrorKind::ConnectionLimit
            | ErrorKind::Configuration
            | ErrorKind::Application => RecoveryStrategyKind::Fallback,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} ({severity:?}/{category:?}): {message}")]
pub struct TypedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub category: ErrorCategory,
    pub recoverable: bool,
    pub strategy: RecoveryStrategyKind,
    pub message: String,
}

impl TypedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            category: kind.category(),
            recoverable: kind.is_recoverable(),
            strategy: kind.recommended_strategy(),
            message: message.into(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

/// What the caller was doing when the fault happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationHint {
    ConnectionAttempt,
    Handshake,
    StateSync,
    Serialization,
}

const KEYWORDS: &[(&[&str], ErrorKind)] = &[
    (&["out of order", "sequence gap"], ErrorKind::ProtocolOutOfOrder),
    (&["timeout", "timed out"], ErrorKind::Timeout),
    (&["refused"], ErrorKind::ConnectionRefused),
    (
        &["reset", "broken pipe", "connection lost", "connection closed", "disconnected"],
        ErrorKind::ConnectionLost,
    ),
    (
        &["authentication", "unauthenticated", "credential"],
        ErrorKind::AuthenticationFailed,
    ),
    (
        &["authorization", "permission", "forbidden", "not allowed"],
        ErrorKind::AuthorizationDenied,
    ),
    (&["corrupt"], ErrorKind::StateCorruption),
    (&["desync", "out of sync"], ErrorKind::StateDesync),
    (&["too many connections", "connection limit"], ErrorKind::ConnectionLimit),
    (&["out of memory", "memory"], ErrorKind::ResourceExhausted),
    (&["version"], ErrorKind::ProtocolVersionMismatch),
    (&["malformed", "unknown message", "invalid packet"], ErrorKind::ProtocolMalformed),
    (&["config"], ErrorKind::Configuration),
];

fn classify_io(err: &io::Error) -> Option<ErrorKind> {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Some(ErrorKind::ConnectionTimeout),
        io::ErrorKind::ConnectionRefused => Some(ErrorKind::ConnectionRefused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(ErrorKind::ConnectionLost),
        io::ErrorKind::PermissionDenied => Some(ErrorKind::AuthorizationDenied),
        io::ErrorKind::OutOfMemory => Some(ErrorKind::ResourceExhausted),
        io::ErrorKind::InvalidData => Some(ErrorKind::ProtocolMalformed),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
            Some(ErrorKind::Configuration)
        }
        _ => None,
    }
}

fn classify_serialization(err: &SerializationError) -> ErrorKind {
    match err.kind {
        SerializationErrorKind::UnsupportedVersion(_) => ErrorKind::ProtocolVersionMismatch,
        _ => ErrorKind::ProtocolMalformed,
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|word| lowered.contains(word)))
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Application)
}

fn apply_hint(kind: ErrorKind, hint: Option<ClassificationHint>) -> ErrorKind {
    match (kind, hint) {
        (ErrorKind::Timeout, Some(ClassificationHint::ConnectionAttempt))
        | (ErrorKind::Timeout, Some(ClassificationHint::Handshake)) => ErrorKind::ConnectionTimeout,
        (ErrorKind::Timeout, Some(ClassificationHint::StateSync)) => ErrorKind::StateDesync,
        (ErrorKind::Application, Some(ClassificationHint::Serialization)) => {
            ErrorKind::ProtocolMalformed
        }
        (kind, _) => kind,
    }
}

/// Maps a raw fault to a typed error.
///
/// Already-typed errors come back unchanged, hint or not.
pub fn classify(
    fault: &(dyn std::error::Error + 'static),
    hint: Option<ClassificationHint>,
) -> TypedError {
    if let Some(typed) = fault.downcast_ref::<TypedError>() {
        return typed.clone();
    }

    let message = fault.to_string();
    let kind = if let Some(io_err) = fault.downcast_ref::<io::Error>() {
        classify_io(io_err).unwrap_or_else(|| classify_message(&message))
    } else if let Some(ser_err) = fault.downcast_ref::<SerializationError>() {
        classify_serialization(ser_err)
    } else if fault.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        ErrorKind::Timeout
    } else {
        classify_message(&message)
    };

    TypedError::new(apply_hint(kind, hint), message)
}

/// Convenience for faults that only exist as a message.
pub fn classify_message_only(message: &str, hint: Option<ClassificationHint>) -> TypedError {
    TypedError::new(apply_hint(classify_message(message), hint), message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("{0}")]
    struct Opaque(String);

    fn opaque(message: &str) -> Opaque {
        Opaque(message.to_string())
    }

    #[test]
    fn test_severity_is_totally_ordered() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_typed_error_passes_through_unchanged() {
        let original = TypedError::new(ErrorKind::StateDesync, "checksum differs")
            .with_severity(Severity::Info);
        let classified = classify(&original, Some(ClassificationHint::ConnectionAttempt));
        assert_eq!(classified, original);
    }

    #[test]
    fn test_io_errors_map_by_kind() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(classify(&refused, None).kind, ErrorKind::ConnectionRefused);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        let typed = classify(&reset, None);
        assert_eq!(typed.kind, ErrorKind::ConnectionLost);
        assert_eq!(typed.strategy, RecoveryStrategyKind::Reconnect);
        assert_eq!(typed.category, ErrorCategory::Connection);
    }

    #[test]
    fn test_io_error_with_generic_kind_uses_message() {
        let err = io::Error::new(io::ErrorKind::Other, "state corrupt at offset 12");
        assert_eq!(classify(&err, None).kind, ErrorKind::StateCorruption);
    }

    #[test]
    fn test_serialization_errors_are_protocol_faults() {
        let err = SerializationError {
            protocol: "bincode",
            operation: crate::protocol::Operation::Deserialize,
            kind: SerializationErrorKind::UnsupportedVersion("3.0".to_string()),
        };
        let typed = classify(&err, None);
        assert_eq!(typed.kind, ErrorKind::ProtocolVersionMismatch);
        assert_eq!(typed.category, ErrorCategory::Protocol);
        assert_eq!(typed.strategy, RecoveryStrategyKind::Fallback);
    }

    #[test]
    fn test_keyword_classification() {
        let cases = [
            ("connection refused by host", ErrorKind::ConnectionRefused),
            ("authentication failed for seat 2", ErrorKind::AuthenticationFailed),
            ("snapshot corrupt", ErrorKind::StateCorruption),
            ("packet arrived out of order", ErrorKind::ProtocolOutOfOrder),
            ("too many connections", ErrorKind::ConnectionLimit),
            ("something odd", ErrorKind::Application),
        ];

        for (message, expected) in cases {
            assert_eq!(classify(&opaque(message), None).kind, expected, "{}", message);
        }
    }

    #[test]
    fn test_hint_disambiguates_timeout() {
        let generic = classify(&opaque("operation timed out"), None);
        assert_eq!(generic.kind, ErrorKind::Timeout);
        assert_eq!(generic.category, ErrorCategory::Application);

        let connect = classify(
            &opaque("operation timed out"),
            Some(ClassificationHint::ConnectionAttempt),
        );
        assert_eq!(connect.kind, ErrorKind::ConnectionTimeout);
        assert_eq!(connect.category, ErrorCategory::Connection);
        assert_eq!(connect.strategy, RecoveryStrategyKind::Retry);
    }

    #[test]
    fn test_application_errors_are_not_recoverable() {
        let typed = classify(&opaque("index out of bounds"), None);
        assert!(!typed.recoverable);
        assert_eq!(typed.severity, Severity::Critical);
    }

    #[test]
    fn test_message_only_faults() {
        let refused = classify_message_only("seat 1 is taken", None);
        assert_eq!(refused.kind, ErrorKind::Application);
        assert!(!refused.recoverable);

        let reason = "protocol version mismatch: server speaks 1.0, client sent 2.0";
        let mismatch = classify_message_only(reason, Some(ClassificationHint::Handshake));
        assert_eq!(mismatch.kind, ErrorKind::ProtocolVersionMismatch);
        assert_eq!(mismatch.message, reason);

        let slow = classify_message_only("handshake timed out", Some(ClassificationHint::Handshake));
        assert_eq!(slow.kind, ErrorKind::ConnectionTimeout);
    }

    #[test]
    fn test_recoverability_can_be_revoked() {
        let typed = TypedError::new(ErrorKind::ConnectionLost, "lost").unrecoverable();
        assert!(!typed.recoverable);
    }

    #[tokio::test]
    async fn test_elapsed_is_a_timeout() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert_eq!(
            classify(&elapsed, Some(ClassificationHint::StateSync)).kind,
            ErrorKind::StateDesync
        );
    }
}
