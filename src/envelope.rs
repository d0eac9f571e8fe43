//! Per-cell deferred results
//!
//! A [`ResultEnvelope`] is what the transport hands back for one cell's reply.
//! Failures are captured, not raised: nothing is surfaced until the caller (or
//! an aggregator) unwraps the envelope.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::CellPath;
use crate::error::{CellError, Result};

/// Failure kind for a cell that did not answer before the deadline
pub const TIMEOUT_KIND: &str = "Timeout";

/// Opaque error raised on the remote side of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Error class as reported by the remote cell
    pub kind: String,
    /// Human readable message
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture a handler error without losing its context chain
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::new("RemoteError", format!("{err:#}"))
    }

    /// The cell did not reply within `after`
    pub fn timed_out(after: Duration) -> Self {
        Self::new(TIMEOUT_KIND, format!("no reply within {after:?}"))
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TIMEOUT_KIND
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One cell's reply: a value, or the failure it raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Cell that produced this reply
    pub cell_name: CellPath,
    /// The reply itself
    pub outcome: std::result::Result<Value, RemoteFailure>,
}

impl ResultEnvelope {
    pub fn ok(cell_name: CellPath, value: Value) -> Self {
        Self {
            cell_name,
            outcome: Ok(value),
        }
    }

    pub fn failed(cell_name: CellPath, failure: RemoteFailure) -> Self {
        Self {
            cell_name,
            outcome: Err(failure),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_err()
    }

    /// Return the value or raise the captured failure, tagged with its cell
    pub fn unwrap(self) -> Result<Value> {
        let cell = self.cell_name;
        self.outcome
            .map_err(|failure| CellError::Remote { cell, failure })
    }

    /// Unwrap and keep the cell name alongside the value
    pub fn unwrap_with_cell(self) -> Result<(CellPath, Value)> {
        let cell = self.cell_name.clone();
        self.unwrap().map(|value| (cell, value))
    }
}
