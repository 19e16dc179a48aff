//! Error types for the TDS registry.
//!
//! Registry operations themselves never fail: lookups return `Option`, and
//! store trouble during bootstrap is absorbed by the fail-open path. The
//! errors here cover the collaborators (store, config) and the self-test.

/// Errors raised by a [`ProjectStore`](crate::store::ProjectStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no active session")]
    NoSession,
    #[error("could not open a session")]
    SessionUnavailable,
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a registry self-test failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    #[error("No logger available.")]
    LoggerUnavailable,
    #[error("No accessor pool available.")]
    PoolUnavailable,
    #[error("No projects to check against.")]
    NoProjects,
    #[error("Pool key {key} maps to accessor for project {project_id}.")]
    KeyMismatch { key: i64, project_id: i64 },
    #[error("Request for project {project_id} got someone else.")]
    Aliasing { project_id: i64 },
}
