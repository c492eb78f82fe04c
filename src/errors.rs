use crate::guard::WriteAttempt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid input path {}: {reason}", path.display())]
    InvalidInputPath { path: PathBuf, reason: String },

    #[error("Execution environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("Write denied: {0}")]
    WriteDenied(WriteAttempt),

    #[error("Agent execution failed: {0}")]
    AgentExecution(String),

    #[error("Failed to copy artifact '{name}': {reason}")]
    ArtifactCopy { name: String, reason: String },

    #[error("Session cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl SandboxError {
    pub(crate) fn invalid_input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SandboxError::InvalidInputPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Policy denials are recoverable inside the agent loop; everything else is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SandboxError::WriteDenied(_))
    }
}
