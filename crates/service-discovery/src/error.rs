use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("store error: {0}")]
    Store(#[source] StoreError),

    #[error("version conflict at {path}: expected version {expected}")]
    VersionConflict { path: String, expected: i64 },

    #[error("path missing: {path}")]
    PathMissing { path: String },

    #[error("path has children: {path}")]
    NotEmpty { path: String },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("invalid service data: {0}")]
    InvalidServiceData(String),

    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session expired")]
    SessionExpired,

    #[error("session closed")]
    SessionClosed,
}

impl RegistryError {
    /// True when the session backing the registry is gone. Every ephemeral
    /// registration made through it has been dropped by the store and must be
    /// re-registered on a fresh session.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            Self::SessionExpired | Self::SessionClosed | Self::ConnectionError(_)
        )
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoNode { path } => Self::PathMissing { path },
            StoreError::BadVersion { path, expected, .. } => {
                Self::VersionConflict { path, expected }
            }
            StoreError::NotEmpty { path } => Self::NotEmpty { path },
            StoreError::InvalidPath { path, reason } => Self::InvalidPath { path, reason },
            StoreError::SessionExpired => Self::SessionExpired,
            StoreError::SessionClosed => Self::SessionClosed,
            StoreError::Connection(msg) => Self::ConnectionError(msg),
            other => Self::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
