//! Call and cast helpers over a [`Transport`]
//!
//! Targeted calls enforce their deadline no matter how the driver behaves.
//! Broadcast calls hand the deadline to the driver, which reports each late
//! cell. Casts are fire-and-forget: remote failures never reach the caller
//! and are only logged.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::address::CellPath;
use crate::envelope::ResultEnvelope;
use crate::error::{CellError, Result};
use crate::message::{CellMessage, Direction};
use crate::transport::Transport;

/// Sends messages through the configured driver
#[derive(Clone)]
pub struct Router {
    transport: Arc<dyn Transport>,
    /// Deadline for calls that do not bring their own
    default_timeout: Option<Duration>,
}

impl Router {
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            default_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send to one cell and wait for its reply
    pub async fn call(
        &self,
        cell: &CellPath,
        message: CellMessage,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope> {
        let timeout = timeout.or(self.default_timeout);
        let send = self.transport.send_targeted(cell, message, true, timeout);
        match timeout {
            Some(after) => tokio::time::timeout(after, send)
                .await
                .map_err(|_| CellError::Timeout {
                    cell: cell.clone(),
                    after,
                })?,
            None => send.await,
        }
    }

    /// Send to one cell without waiting.
    ///
    /// Routing errors (unknown cell, closed driver) are returned; anything the
    /// remote side does with the message is not.
    pub async fn cast(&self, cell: &CellPath, message: CellMessage) -> Result<()> {
        let method = message.method();
        let envelope = self.transport.send_targeted(cell, message, false, None).await?;
        if let Err(failure) = envelope.outcome {
            warn!(cell = %envelope.cell_name, method, error = %failure, "Cast failed");
        }
        Ok(())
    }

    /// Send to many cells and collect every reply.
    ///
    /// Under a deadline, a cell that has not answered in time fails the whole
    /// call with [`CellError::Timeout`] naming that cell.
    pub async fn call_broadcast(
        &self,
        root: Option<&CellPath>,
        direction: Direction,
        message: CellMessage,
        timeout: Option<Duration>,
    ) -> Result<Vec<ResultEnvelope>> {
        let timeout = timeout.or(self.default_timeout);
        let envelopes = self
            .transport
            .send_broadcast(root, direction, message, true, timeout)
            .await?;

        if let Some(after) = timeout {
            let late = envelopes
                .iter()
                .find(|e| matches!(&e.outcome, Err(failure) if failure.is_timeout()));
            if let Some(late) = late {
                return Err(CellError::Timeout {
                    cell: late.cell_name.clone(),
                    after,
                });
            }
        }
        Ok(envelopes)
    }

    /// Best-effort broadcast. Returns false if the send itself failed; the
    /// failure has already been logged.
    pub async fn cast_broadcast(&self, root: Option<&CellPath>, direction: Direction, message: CellMessage) -> bool {
        let method = message.method();
        match self.transport.send_broadcast(root, direction, message, false, None).await {
            Ok(envelopes) => {
                log_failures(method, &envelopes);
                debug!(method, ?direction, "Broadcast sent");
                true
            }
            Err(e) => {
                warn!(method, ?direction, error = %e, "Broadcast failed");
                false
            }
        }
    }
}

/// Turn captured failures into log records
pub fn log_failures(method: &str, envelopes: &[ResultEnvelope]) {
    for envelope in envelopes {
        if let Err(failure) = &envelope.outcome {
            warn!(cell = %envelope.cell_name, method, error = %failure, "Cell reported failure");
        }
    }
}
