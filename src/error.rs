//! Error types for task-logger.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ArgKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("log store {} is not open", path.display())]
    StoreNotOpen { path: PathBuf },

    #[error("log session is not open")]
    SessionNotOpen,

    #[error("log store {} is already open", path.display())]
    AlreadyOpen { path: PathBuf },

    #[error("cannot open log store {}: {source}", path.display())]
    MalformedStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("log store {} is open read-only", path.display())]
    ReadOnly { path: PathBuf },

    #[error("invalid attempt state {0:?}; expected one of new, attempting, completed, errored")]
    InvalidState(String),

    /// A processing step raised the batch-fatal kind. Already recorded in the log.
    #[error("attempt for {key} aborted the batch: {cause:#}")]
    NonSuppressed { key: ArgKey, cause: anyhow::Error },

    /// A processing step failed while the session propagates every failure.
    #[error("attempt for {key} failed: {cause:#}")]
    Propagated { key: ArgKey, cause: anyhow::Error },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl Error {
    /// Misuse errors raised when the store or session is touched outside its open window.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, Error::StoreNotOpen { .. } | Error::SessionNotOpen)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
