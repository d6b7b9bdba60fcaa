//! Error types shared across the vault runtime.

use std::path::PathBuf;

use crate::vault::VaultState;

/// Errors from vault layout, transitions and file bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("illegal transition {from} -> {to} for {name}")]
    IllegalTransition {
        name: String,
        from: VaultState,
        to: VaultState,
    },
    #[error("file {0} is not inside a known vault state")]
    UnknownLocation(PathBuf),
    #[error("malformed document {name}: {reason}")]
    Malformed { name: String, reason: String },
    #[error("another instance holds the lock {0}")]
    Locked(PathBuf),
    #[error("timed out after {secs}s waiting for decision on {name}")]
    ApprovalTimeout { name: String, secs: u64 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure returned by an action collaborator (email, social, accounting).
///
/// Collaborators only report a message; classification into transient, auth
/// or structural happens in [`crate::retry::classify`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
}

impl ActionError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Errors from the process supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("process {name} has an empty launch command")]
    EmptyCommand { name: String },
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Errors from assembling the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("failed to build classifier: {0}")]
    Classifier(#[from] regex::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
