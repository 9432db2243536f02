//! Error types for the meshbus transport.
//!
//! The first group of variants mirrors the protocol status codes exchanged in
//! RPC responses (see [`crate::protocol::StatusCode`]). The remaining variants
//! describe local transport and lifecycle conditions that never cross the wire
//! as themselves.

use thiserror::Error;

/// Main error type for the meshbus library.
#[derive(Debug, Error)]
pub enum MeshbusError {
    // Status-code backed errors
    #[error("Authorization validation failed: {0}")]
    AuthorizationValidation(String),

    #[error("Bad arguments: {0}")]
    BadArgs(String),

    #[error("No connection: {0}")]
    NoConnection(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Does not exist: {0}")]
    DoesNotExist(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Set request failed: {0}")]
    SetRequest(String),

    #[error("UART communication error: {0}")]
    UartCommunication(String),

    #[error("{0}")]
    General(String),

    // Operation was cancelled cooperatively
    #[error("Cancelled: {0}")]
    Cancelled(String),

    // Connection admission errors
    #[error("Unauthorized peer: {0}")]
    Unauthorized(String),

    #[error("Expected {name} to be {expected:?}, got {actual:?}")]
    ParameterMismatch {
        name: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("Name already in use: {0}")]
    NameInUse(String),

    // Addressing and transport errors
    #[error("Invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Send queue full for {0}")]
    SendQueueFull(String),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for meshbus operations.
pub type Result<T> = std::result::Result<T, MeshbusError>;

/// Fieldless discriminant of [`MeshbusError`], used as the key of the
/// status-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthorizationValidation,
    BadArgs,
    NoConnection,
    Consistency,
    DoesNotExist,
    PermissionDenied,
    Timeout,
    Protocol,
    SetRequest,
    UartCommunication,
    General,
    Cancelled,
    Unauthorized,
    ParameterMismatch,
    NameInUse,
    InvalidAddress,
    Unsupported,
    AddressInUse,
    SendQueueFull,
    Io,
    Json,
    Config,
}

// Conversion implementations for common error types

impl From<std::io::Error> for MeshbusError {
    fn from(err: std::io::Error) -> Self {
        MeshbusError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MeshbusError {
    fn from(err: serde_json::Error) -> Self {
        MeshbusError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tokio::time::error::Elapsed> for MeshbusError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        MeshbusError::Timeout(err.to_string())
    }
}

impl MeshbusError {
    /// Build an error of the given kind carrying `message`.
    ///
    /// Kinds with structured payloads receive the message in their most
    /// descriptive field.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::AuthorizationValidation => MeshbusError::AuthorizationValidation(message),
            ErrorKind::BadArgs => MeshbusError::BadArgs(message),
            ErrorKind::NoConnection => MeshbusError::NoConnection(message),
            ErrorKind::Consistency => MeshbusError::Consistency(message),
            ErrorKind::DoesNotExist => MeshbusError::DoesNotExist(message),
            ErrorKind::PermissionDenied => MeshbusError::PermissionDenied(message),
            ErrorKind::Timeout => MeshbusError::Timeout(message),
            ErrorKind::Protocol => MeshbusError::Protocol(message),
            ErrorKind::SetRequest => MeshbusError::SetRequest(message),
            ErrorKind::UartCommunication => MeshbusError::UartCommunication(message),
            ErrorKind::General => MeshbusError::General(message),
            ErrorKind::Cancelled => MeshbusError::Cancelled(message),
            ErrorKind::Unauthorized => MeshbusError::Unauthorized(message),
            ErrorKind::ParameterMismatch => MeshbusError::ParameterMismatch {
                name: message,
                expected: String::new(),
                actual: None,
            },
            ErrorKind::NameInUse => MeshbusError::NameInUse(message),
            ErrorKind::InvalidAddress => MeshbusError::InvalidAddress {
                address: String::new(),
                reason: message,
            },
            ErrorKind::Unsupported => MeshbusError::Unsupported(message),
            ErrorKind::AddressInUse => MeshbusError::AddressInUse(message),
            ErrorKind::SendQueueFull => MeshbusError::SendQueueFull(message),
            ErrorKind::Io => MeshbusError::Io {
                message,
                source: None,
            },
            ErrorKind::Json => MeshbusError::Json {
                message,
                source: None,
            },
            ErrorKind::Config => MeshbusError::Config { message },
        }
    }

    /// The fieldless kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshbusError::AuthorizationValidation(_) => ErrorKind::AuthorizationValidation,
            MeshbusError::BadArgs(_) => ErrorKind::BadArgs,
            MeshbusError::NoConnection(_) => ErrorKind::NoConnection,
            MeshbusError::Consistency(_) => ErrorKind::Consistency,
            MeshbusError::DoesNotExist(_) => ErrorKind::DoesNotExist,
            MeshbusError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MeshbusError::Timeout(_) => ErrorKind::Timeout,
            MeshbusError::Protocol(_) => ErrorKind::Protocol,
            MeshbusError::SetRequest(_) => ErrorKind::SetRequest,
            MeshbusError::UartCommunication(_) => ErrorKind::UartCommunication,
            MeshbusError::General(_) => ErrorKind::General,
            MeshbusError::Cancelled(_) => ErrorKind::Cancelled,
            MeshbusError::Unauthorized(_) => ErrorKind::Unauthorized,
            MeshbusError::ParameterMismatch { .. } => ErrorKind::ParameterMismatch,
            MeshbusError::NameInUse(_) => ErrorKind::NameInUse,
            MeshbusError::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            MeshbusError::Unsupported(_) => ErrorKind::Unsupported,
            MeshbusError::AddressInUse(_) => ErrorKind::AddressInUse,
            MeshbusError::SendQueueFull(_) => ErrorKind::SendQueueFull,
            MeshbusError::Io { .. } => ErrorKind::Io,
            MeshbusError::Json { .. } => ErrorKind::Json,
            MeshbusError::Config { .. } => ErrorKind::Config,
        }
    }

    /// Text carried in a response's `error_msg`. Status-backed variants send
    /// their bare message since the status code already names the kind.
    pub fn message(&self) -> String {
        match self {
            MeshbusError::AuthorizationValidation(m)
            | MeshbusError::BadArgs(m)
            | MeshbusError::NoConnection(m)
            | MeshbusError::Consistency(m)
            | MeshbusError::DoesNotExist(m)
            | MeshbusError::PermissionDenied(m)
            | MeshbusError::Timeout(m)
            | MeshbusError::Protocol(m)
            | MeshbusError::SetRequest(m)
            | MeshbusError::UartCommunication(m)
            | MeshbusError::General(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Create an invalid-address error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        MeshbusError::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        MeshbusError::Config {
            message: message.into(),
        }
    }

    /// Whether this error describes a lost or refused link rather than a
    /// failure of the remote application.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MeshbusError::NoConnection(_) | MeshbusError::Cancelled(_) | MeshbusError::Io { .. }
        )
    }

    /// Conditions that are part of normal transport churn. Admission of a new
    /// peer that fails with one of these discards the peer quietly.
    pub fn is_discardable_during_start(&self) -> bool {
        matches!(
            self,
            MeshbusError::Unauthorized(_)
                | MeshbusError::Timeout(_)
                | MeshbusError::NoConnection(_)
                | MeshbusError::Io { .. }
        )
    }

    /// Check if this error should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshbusError::NoConnection(_)
                | MeshbusError::Timeout(_)
                | MeshbusError::SendQueueFull(_)
                | MeshbusError::Io { .. }
        )
    }
}
