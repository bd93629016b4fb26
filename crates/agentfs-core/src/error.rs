use std::path::PathBuf;

/// Core error types for agentfs.
#[derive(Debug, thiserror::Error)]
pub enum AgentFsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Rejected virtual paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Path traversal not allowed: {0}")]
    Traversal(String),

    #[error("Path must start with one of {allowed:?}: {path}")]
    NotAllowed { path: String, allowed: Vec<String> },

    #[error("Path {path} resolves outside root directory {root}")]
    OutsideRoot { path: String, root: String },
}

/// Failures a backend reports out of band.
///
/// Not-found, already-exists and ambiguous-edit outcomes are not errors: they
/// travel in-band as strings or `error` fields so the calling agent can react.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    InvalidPath(#[from] PathError),

    #[error("{0}")]
    InvalidPattern(String),

    #[error("State backend called without file state in the call context")]
    MissingState,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{operation} is not implemented by the {backend} backend")]
    NotImplemented {
        operation: &'static str,
        backend: &'static str,
    },

    #[error("Partial failure: {0}")]
    PartialFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn not_implemented(operation: &'static str, backend: &'static str) -> Self {
        Self::NotImplemented { operation, backend }
    }

    /// True for failures of the medium itself rather than of the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_)
                | Self::StoreUnavailable(_)
                | Self::Timeout(_)
                | Self::PermissionDenied(_)
                | Self::Store(_)
                | Self::Io(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize store item: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid store key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Sandbox unreachable: {0}")]
    Unreachable(String),

    #[error("Sandbox command timed out after {0} seconds")]
    Timeout(u64),

    #[error("Sandbox error ({code}): {message}")]
    Remote { code: i64, message: String },

    #[error("File not found in sandbox: {0}")]
    NotFound(String),

    #[error("Sandbox protocol error: {0}")]
    Protocol(String),
}

impl From<SandboxError> for BackendError {
    fn from(e: SandboxError) -> Self {
        match e {
            SandboxError::Timeout(secs) => BackendError::Timeout(secs),
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Rendered to the agent as `Error: {0}`.
    #[error("{0}")]
    InvalidParams(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, AgentFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_timeout_maps_to_backend_timeout() {
        let err: BackendError = SandboxError::Timeout(30).into();
        assert!(matches!(err, BackendError::Timeout(30)));
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_sandbox_unreachable_is_unavailable() {
        let err: BackendError = SandboxError::Unreachable("connection refused".into()).into();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_area_errors_convert_with_question_mark() {
        fn build() -> Result<()> {
            Err(ConfigError::Invalid("sandbox route needs an endpoint".into()))?
        }
        let err = build().unwrap_err();
        assert!(matches!(err, AgentFsError::Config(ConfigError::Invalid(_))));
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid config: sandbox route needs an endpoint"
        );
    }

    #[test]
    fn test_validation_errors_are_not_unavailable() {
        let err = BackendError::InvalidPattern("Invalid regex pattern: x".into());
        assert!(!err.is_unavailable());
        let err: BackendError = PathError::Traversal("../x".into()).into();
        assert_eq!(err.to_string(), "Path traversal not allowed: ../x");
    }
}
