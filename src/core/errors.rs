// src/core/errors.rs

//! Defines the primary error type and error-kind taxonomy for the control plane.

use std::sync::Arc;
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Classification of a failure, independent of the `Result` type it travels in.
///
/// This is the taxonomy from the error-handling design: it drives which handler
/// `ExceptionMonitor` invokes and which HTTP status a boundary validator returns.
/// A single kind (e.g. `UNREACHABLE`) can be raised by many different concrete errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    InvalidParameter,
    NotFound,
    Unreachable,
    CallError,
    ResourceExhausted,
    OperationRepeat,
    Exception,
    SendPErr,
    SendMixErr,
    ConnPErr,
    ConnDErr,
    ConnMixErr,
    UserDisConn,
    DecodeDisConn,
    ScheduleTimeout,
    FirstTokenTimeout,
    InferTimeout,
    TokenizerTimeout,
    RetryDuplicateReqId,
    Retry,
}

impl ErrorKind {
    /// Kinds that `ReqManager` retries, given budget and a still-connected client.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Retry
                | ErrorKind::SendPErr
                | ErrorKind::SendMixErr
                | ErrorKind::ConnPErr
                | ErrorKind::ConnDErr
                | ErrorKind::ConnMixErr
                | ErrorKind::DecodeDisConn
                | ErrorKind::FirstTokenTimeout
        )
    }

    /// Kinds reported to the client as a terminal 5xx rather than retried.
    pub fn is_terminal_timeout(self) -> bool {
        matches!(
            self,
            ErrorKind::ScheduleTimeout | ErrorKind::InferTimeout | ErrorKind::TokenizerTimeout
        )
    }

    /// The HTTP status a boundary validator or ExceptionMonitor answers with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidInput | ErrorKind::InvalidParameter => 400,
            ErrorKind::RetryDuplicateReqId => 409,
            ErrorKind::ResourceExhausted => 503,
            ErrorKind::ScheduleTimeout
            | ErrorKind::FirstTokenTimeout
            | ErrorKind::InferTimeout
            | ErrorKind::TokenizerTimeout => 504,
            ErrorKind::SendPErr
            | ErrorKind::SendMixErr
            | ErrorKind::ConnPErr
            | ErrorKind::ConnDErr
            | ErrorKind::ConnMixErr
            | ErrorKind::DecodeDisConn => 502,
            ErrorKind::Exception | ErrorKind::CallError => 500,
            ErrorKind::NotFound | ErrorKind::OperationRepeat | ErrorKind::UserDisConn => 200,
        }
    }
}

/// The main error enum, representing all possible failures within the control plane.
#[derive(Error, Debug, Clone)]
pub enum ControlPlaneError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("operation already in progress: {0}")]
    OperationRepeat(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("shared-memory ring error: {0}")]
    Ring(String),

    #[error("leader election error: {0}")]
    Leader(String),

    #[error("schedule timed out after {0:?}")]
    ScheduleTimeout(std::time::Duration),

    #[error("duplicate request id: {0}")]
    DuplicateRequestId(String),
}

impl From<std::io::Error> for ControlPlaneError {
    fn from(e: std::io::Error) -> Self {
        ControlPlaneError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(e: reqwest::Error) -> Self {
        ControlPlaneError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(e: serde_json::Error) -> Self {
        ControlPlaneError::Internal(format!("JSON error: {e}"))
    }
}

impl ControlPlaneError {
    /// Maps a concrete error back onto the classification taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlPlaneError::InvalidInput(_) => ErrorKind::InvalidInput,
            ControlPlaneError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            ControlPlaneError::NotFound(_) => ErrorKind::NotFound,
            ControlPlaneError::Unreachable(_) | ControlPlaneError::HttpClient(_) => {
                ErrorKind::Unreachable
            }
            ControlPlaneError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ControlPlaneError::OperationRepeat(_) => ErrorKind::OperationRepeat,
            ControlPlaneError::ScheduleTimeout(_) => ErrorKind::ScheduleTimeout,
            ControlPlaneError::DuplicateRequestId(_) => ErrorKind::RetryDuplicateReqId,
            ControlPlaneError::Io(_)
            | ControlPlaneError::Internal(_)
            | ControlPlaneError::Ring(_)
            | ControlPlaneError::Leader(_) => ErrorKind::Exception,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

impl axum::response::IntoResponse for ControlPlaneError {
    fn into_response(self) -> axum::response::Response {
        let status = axum::http::StatusCode::from_u16(self.kind().http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_send_failures_are_retryable_but_terminal_timeouts_are_not() {
        for kind in [
            ErrorKind::ConnPErr,
            ErrorKind::ConnDErr,
            ErrorKind::ConnMixErr,
            ErrorKind::SendPErr,
            ErrorKind::SendMixErr,
            ErrorKind::DecodeDisConn,
            ErrorKind::FirstTokenTimeout,
            ErrorKind::Retry,
        ] {
            assert!(kind.is_retryable(), "{kind} should be retryable");
        }
        for kind in [
            ErrorKind::ScheduleTimeout,
            ErrorKind::InferTimeout,
            ErrorKind::TokenizerTimeout,
            ErrorKind::InvalidInput,
            ErrorKind::UserDisConn,
            ErrorKind::RetryDuplicateReqId,
        ] {
            assert!(!kind.is_retryable(), "{kind} should not be retryable");
        }
    }

    #[test]
    fn terminal_timeouts_map_to_504_and_client_errors_map_to_4xx() {
        for kind in [ErrorKind::ScheduleTimeout, ErrorKind::InferTimeout, ErrorKind::TokenizerTimeout] {
            assert!(kind.is_terminal_timeout());
            assert_eq!(kind.http_status(), 504);
        }
        assert_eq!(ErrorKind::InvalidInput.http_status(), 400);
        assert_eq!(ErrorKind::RetryDuplicateReqId.http_status(), 409);
    }

    #[test]
    fn concrete_errors_classify_back_onto_their_kind() {
        assert_eq!(ControlPlaneError::InvalidInput("x".into()).kind(), ErrorKind::InvalidInput);
        assert_eq!(
            ControlPlaneError::ScheduleTimeout(std::time::Duration::from_secs(1)).kind(),
            ErrorKind::ScheduleTimeout
        );
        assert_eq!(
            ControlPlaneError::DuplicateRequestId("r1".into()).kind(),
            ErrorKind::RetryDuplicateReqId
        );
    }
}
