//! Cell coordination error types

use std::time::Duration;

use thiserror::Error;

use crate::address::CellPath;
use crate::envelope::RemoteFailure;
use crate::records::ResourceId;

/// Errors that can occur while coordinating cells
#[derive(Debug, Error)]
pub enum CellError {
    /// Address literal could not be parsed
    #[error("Malformed address '{input}': {reason}")]
    MalformedAddress { input: String, reason: String },

    /// Targeted cell is not known to the transport
    #[error("Cell not found: {0}")]
    CellNotFound(CellPath),

    /// Resource record is absent from the record store
    #[error("Resource not found: {0}")]
    ResourceNotFound(ResourceId),

    /// A call did not complete before its deadline
    #[error("Timed out after {after:?} waiting for cell {cell}")]
    Timeout { cell: CellPath, after: Duration },

    /// Failure captured on the remote side, attributed to the cell that raised it
    #[error("Cell {cell} failed: {failure}")]
    Remote { cell: CellPath, failure: RemoteFailure },

    /// Aggregation invariant broken
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport driver error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Record store error
    #[error("Record store error: {0}")]
    Store(String),

    /// Reply payload did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CellError {
    pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> Self {
        Self::MalformedAddress {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// True for the "target does not exist" family of errors
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CellNotFound(_) | Self::ResourceNotFound(_))
    }

    /// The cell this error is attributed to, if any
    pub fn cell(&self) -> Option<&CellPath> {
        match self {
            Self::CellNotFound(cell) | Self::Timeout { cell, .. } | Self::Remote { cell, .. } => {
                Some(cell)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CellError>;
