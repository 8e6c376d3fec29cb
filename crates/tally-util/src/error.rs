//! Error types for tallyd

use thiserror::Error;

use crate::{MeterId, SeriesId};

/// Core error type for tallyd operations
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("Series not found: {0}")]
    SeriesNotFound(SeriesId),

    #[error("Meter not found: {0}")]
    MeterNotFound(MeterId),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreError(msg.into())
    }

    pub fn ipc(msg: impl Into<String>) -> Self {
        Self::IpcError(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;
