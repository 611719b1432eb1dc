use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::gadget::store::NodeKind;

/// Why a store root could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// Root path (or its usb_gadget group) does not exist
    NotFound,
    /// Root exists but is not writable by this process
    PermissionDenied,
    /// Another live handle already owns this root
    AlreadyInitialized,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnavailableReason::NotFound => write!(f, "not found"),
            UnavailableReason::PermissionDenied => write!(f, "permission denied"),
            UnavailableReason::AlreadyInitialized => write!(f, "already initialized"),
        }
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store unavailable at {}: {reason}", root.display())]
    StoreUnavailable {
        root: PathBuf,
        reason: UnavailableReason,
    },

    #[error("Name conflict: {kind} '{name}' already exists")]
    NameConflict { kind: NodeKind, name: String },

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid attributes: {0}")]
    InvalidAttrs(String),

    #[error("Store I/O error: {context}: {source}")]
    StoreIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{node} still has dependents: {}", dependents.join(", "))]
    HasDependents {
        node: String,
        dependents: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Build deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wrap an I/O failure on a store path
    pub fn store_io(context: impl Into<String>, source: std::io::Error) -> Self {
        AppError::StoreIo {
            context: context.into(),
            source,
        }
    }

    /// Short machine-friendly name of the error class
    pub fn kind_name(&self) -> &'static str {
        match self {
            AppError::StoreUnavailable { .. } => "StoreUnavailable",
            AppError::NameConflict { .. } => "NameConflict",
            AppError::InvalidReference(_) => "InvalidReference",
            AppError::InvalidAttrs(_) => "InvalidAttrs",
            AppError::StoreIo { .. } => "StoreIO",
            AppError::HasDependents { .. } => "HasDependents",
            AppError::NotFound(_) => "NotFound",
            AppError::Timeout(_) => "Timeout",
            AppError::Config(_) => "Config",
            AppError::Internal(_) => "Internal",
        }
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, AppError>;
