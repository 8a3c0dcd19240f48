use serde::Serialize;
use thiserror::Error;

/// Caller-facing error for every job and metadata operation.
///
/// A transport renders these as `{error, status}` bodies via [`PatchError::to_body`].
#[derive(Debug, Error)]
pub enum PatchError {
    /// Rejected before any job state changed (bad id, missing upload, bad JSON).
    #[error("{0}")]
    InvalidInput(String),

    /// Loading, selecting, executing, applying or signing failed.
    #[error("{message}")]
    Processing { message: String },

    /// Anything not anticipated. The detail never leaves the process.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl PatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        PatchError::InvalidInput(message.into())
    }

    pub fn processing(message: impl Into<String>) -> Self {
        PatchError::Processing {
            message: message.into(),
        }
    }

    pub fn status(&self) -> ErrorStatus {
        match self {
            PatchError::InvalidInput(_) => ErrorStatus::BadRequest,
            PatchError::Processing { .. } => ErrorStatus::PatchFailure,
            PatchError::Unexpected(_) => ErrorStatus::ServerError,
        }
    }

    /// Wire body for this error. Unexpected errors are logged here and
    /// replaced by a generic message.
    pub fn to_body(&self) -> ErrorBody {
        let error = match self {
            PatchError::Unexpected(detail) => {
                tracing::error!(detail = %detail, "unexpected server error");
                "Unexpected server error".to_string()
            }
            other => other.to_string(),
        };
        ErrorBody {
            error,
            status: self.status(),
        }
    }
}

impl From<EngineError> for PatchError {
    fn from(err: EngineError) -> Self {
        PatchError::processing(err.to_string())
    }
}

impl From<SelectionError> for PatchError {
    fn from(err: SelectionError) -> Self {
        PatchError::processing(err.to_string())
    }
}

impl From<std::io::Error> for PatchError {
    fn from(err: std::io::Error) -> Self {
        PatchError::Unexpected(err.to_string())
    }
}

/// Coarse outcome class of a [`PatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    BadRequest,
    PatchFailure,
    ServerError,
}

impl ErrorStatus {
    pub fn http_code(self) -> u16 {
        match self {
            ErrorStatus::BadRequest => 400,
            ErrorStatus::PatchFailure => 422,
            ErrorStatus::ServerError => 500,
        }
    }
}

impl std::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorStatus::BadRequest => write!(f, "bad_request"),
            ErrorStatus::PatchFailure => write!(f, "patch_failure"),
            ErrorStatus::ServerError => write!(f, "server_error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub status: ErrorStatus,
}

/// Failures reported by the patch engine or the artifact tools.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to load patches: {0}")]
    Load(String),

    #[error("Failed to open target artifact: {0}")]
    Session(String),

    #[error("Patch execution failed: {0}")]
    Execution(String),

    #[error("Failed to apply patches: {0}")]
    Apply(String),

    #[error("Failed to sign artifact: {0}")]
    Signing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors found while computing the patch closure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("Dependency cycle detected: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Patch \"{patch}\" depends on a patch missing from the loaded set")]
    UnknownDependency { patch: String },
}
