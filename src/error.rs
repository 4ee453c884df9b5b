//! Operator-facing error taxonomy.

use thiserror::Error;

use crate::ingest::ArchiveError;
use crate::synchronise::{PartialFailure, SyncError};

/// The single error type surfaced by the session coordinator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("operator '{operator}' is not authorised")]
    Unauthorized { operator: String },

    #[error("{0}")]
    OutOfOrder(String),

    #[error("archive rejected ({reason}): {0}", reason = .0.reason())]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{0}")]
    Usage(String),

    #[error("invalid repository name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("superseded by a newer command before any remote change was made")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Unauthorized { .. } => "unauthorized",
            PipelineError::OutOfOrder(_) => "out_of_order",
            PipelineError::Archive(_) => "archive",
            PipelineError::Sync(e) => match e {
                SyncError::AlreadyExists(_) => "already_exists",
                SyncError::NotFound(_) => "not_found",
                SyncError::InsufficientScope { .. } => "insufficient_scope",
                SyncError::RemoteTimeout { .. } => "remote_timeout",
                SyncError::PartialFailure(PartialFailure::CreatedButNotPushed { .. }) => {
                    "partial_failure"
                }
                SyncError::Remote { .. } => "remote",
            },
            PipelineError::Usage(_) => "usage",
            PipelineError::InvalidName { .. } => "invalid_name",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Internal(_) => "internal",
        }
    }
}
