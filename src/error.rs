//! Error types for the worker node.

use std::time::Duration;

/// Top-level error type for a task attempt.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Cancelled during {stage}")]
    Cancelled { stage: &'static str },
}

impl Error {
    /// Pipeline stage this error belongs to, used as a log field.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Workspace(WorkspaceError::Fetch { .. }) => "fetch",
            Self::Workspace(_) => "extract",
            Self::Execution(ExecutionError::DependencyInstall { .. }) => "prepare",
            Self::Execution(_) => "execute",
            Self::Publish(PublishError::Packaging(_)) => "package",
            Self::Publish(PublishError::Upload(_)) => "upload",
            Self::Queue(QueueError::Read(_)) => "queue_read",
            Self::Queue(QueueError::Write(_)) => "confirm",
            Self::Cancelled { stage } => *stage,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid credentials file {path}: {reason}")]
    Credentials { path: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workspace fetch and extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to fetch workspace archive from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Failed to extract workspace archive: {0}")]
    Extract(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime preparation and script execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Dependency installation failed at `{step}`: {reason}")]
    DependencyInstall { step: String, reason: String },

    #[error("Entry script {entry} exited with code {exit_code}: {stderr}")]
    Execution {
        entry: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("Command `{command}` was cancelled")]
    Cancelled { command: String },

    #[error("Failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
}

/// Result packaging and upload errors.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Packaging failed: {0}")]
    Packaging(String),

    #[error("Upload failed: {0}")]
    Upload(String),
}

/// Ledger (task queue) errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to read task queue: {0}")]
    Read(String),

    #[error("Failed to submit confirmation: {0}")]
    Write(String),
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
