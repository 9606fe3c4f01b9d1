use thiserror::Error;

/// Coarse error taxonomy surfaced to control-layer callers (spec.md §7).
///
/// Distinguishes expected, typed failure modes from bugs. `Transient` and
/// `Permanent` are handled locally by the component that saw them (retried
/// or recorded against the affected unit); only `Fatal` and `Cancelled`
/// usually propagate all the way to a `Company` status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InvalidState,
    Transient,
    Permanent,
    Fatal,
    Cancelled,
}

/// Crate-level error that spans components. Individual modules keep their
/// own `thiserror` enums (`RateGateError`, `RobotsError`, ...) and convert
/// into this one at the boundary where code needs to talk about several of
/// them at once (the pipeline, the scheduler, the control API).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::InvalidState(_) => ErrorKind::InvalidState,
            CoreError::Transient(_) => ErrorKind::Transient,
            CoreError::Permanent(_) => ErrorKind::Permanent,
            CoreError::Fatal(_) => ErrorKind::Fatal,
            CoreError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Map to the `{code, message, details?}` shape spec.md §7 says is all
    /// that should ever reach a user — internal retries are never exposed.
    pub fn to_api_error(&self) -> ApiError {
        let code = match self.kind() {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Transient => "transient_error",
            ErrorKind::Permanent => "permanent_error",
            ErrorKind::Fatal => "fatal_error",
            ErrorKind::Cancelled => "cancelled",
        };
        ApiError {
            code: code.to_string(),
            message: self.to_string(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

pub type CoreResult<T> = Result<T, CoreError>;
