//! Bidirectional mapping between [`StatusCode`] and [`ErrorKind`].

use super::message::{Response, StatusCode, StatusResponse};
use crate::error::{ErrorKind, MeshbusError, Result};
use tracing::{error, warn};

/// Status codes with a dedicated error kind. The first entry for a code is
/// the kind it decodes to.
const STATUS_TABLE: &[(StatusCode, ErrorKind)] = &[
    (
        StatusCode::AuthorizationValidationError,
        ErrorKind::AuthorizationValidation,
    ),
    (StatusCode::BadArgsError, ErrorKind::BadArgs),
    (StatusCode::ConnectionError, ErrorKind::NoConnection),
    (StatusCode::ConnectionError, ErrorKind::Cancelled),
    (StatusCode::ConsistencyError, ErrorKind::Consistency),
    (StatusCode::DoesNotExistError, ErrorKind::DoesNotExist),
    (StatusCode::PermissionError, ErrorKind::PermissionDenied),
    (StatusCode::Timeout, ErrorKind::Timeout),
    (StatusCode::ProtocolError, ErrorKind::Protocol),
    (StatusCode::SetRequestError, ErrorKind::SetRequest),
    (StatusCode::UartCommunicationError, ErrorKind::UartCommunication),
];

impl StatusCode {
    /// Status for an error kind, or `None` for kinds without a dedicated code.
    pub fn for_error_kind(kind: ErrorKind) -> Option<StatusCode> {
        STATUS_TABLE
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(code, _)| *code)
    }

    /// Error kind raised for this status. `NoError` has none; unknown
    /// failures decode as [`ErrorKind::General`].
    pub fn error_kind(self) -> Option<ErrorKind> {
        if self == StatusCode::NoError {
            return None;
        }
        Some(
            STATUS_TABLE
                .iter()
                .find(|(code, _)| *code == self)
                .map(|(_, kind)| *kind)
                .unwrap_or(ErrorKind::General),
        )
    }
}

/// Convert a handler failure into the status sent back to the caller.
///
/// Errors without a dedicated code become `GENERAL_ERROR` and are logged at
/// error level; the rest are expected conditions and are not.
pub fn status_for_error(command: &str, err: &MeshbusError) -> StatusResponse {
    let status_code = match StatusCode::for_error_kind(err.kind()) {
        Some(code) => code,
        None => {
            error!(command, error = %err, "Caught exception when handling request");
            StatusCode::GeneralError
        }
    };
    if status_code == StatusCode::ConnectionError {
        warn!(command, error = %err, "Received connection error when handling request");
    }
    StatusResponse {
        status_code,
        error_msg: Some(err.message()),
    }
}

pub fn error_response(command: &str, err: &MeshbusError) -> Response {
    Response {
        status: status_for_error(command, err),
        result_serialized: Default::default(),
    }
}

/// The error a caller sees for a non-success status.
pub fn error_for_status(status: &StatusResponse) -> Option<MeshbusError> {
    let kind = status.status_code.error_kind()?;
    Some(MeshbusError::from_kind(
        kind,
        status.error_msg.clone().unwrap_or_default(),
    ))
}

impl Response {
    /// The result payload, or the error its status maps to.
    pub fn into_result(self) -> Result<bytes::Bytes> {
        match error_for_status(&self.status) {
            Some(err) => Err(err),
            None => Ok(self.result_serialized),
        }
    }
}
