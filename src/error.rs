use thiserror::Error;

use crate::model::patch::{PatchId, PatchStatus};
use crate::model::port::PortId;

/// Central error type for portd operations.
#[derive(Error, Debug)]
pub enum PortdError {
    #[error("Unsupported source: {0} (expected 'cran' or 'pip')")]
    UnsupportedSource(String),

    #[error("Port already exists: {ecosystem}/{name}")]
    AlreadyExists { ecosystem: String, name: String },

    #[error("Invalid maintainer transition: {from} -> {to}")]
    InvalidMaintainerTransition { from: String, to: String },

    #[error("Port {port} already has patch {patch} in progress")]
    PatchInProgress { port: PortId, patch: PatchId },

    #[error("Patch {patch} depends on unresolved patches: {pending:?}")]
    DependencyUnresolved {
        patch: PatchId,
        pending: Vec<PatchId>,
    },

    #[error("Field not writable: {0}")]
    FieldNotWritable(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: PatchStatus, to: PatchStatus },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Port not found: {0}")]
    PortNotFound(PortId),

    #[error("Patch not found: {0}")]
    PatchNotFound(PatchId),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for portd results.
pub type PortdResult<T> = Result<T, PortdError>;
