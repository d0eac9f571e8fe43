//! Contract between the coordination layer and the inter-cell driver

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::address::CellPath;
use crate::envelope::ResultEnvelope;
use crate::error::Result;
use crate::message::{CellMessage, Direction};

/// Moves messages between cells.
///
/// Every reply comes back as a [`ResultEnvelope`] tagged with the responding
/// cell. A failure raised by the remote handler is captured in the envelope;
/// only failures of the driver itself (unknown cell, closed mailbox) are
/// returned as `Err`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver to exactly one cell. The empty path means this cell.
    ///
    /// With `call == false` the returned envelope carries `Value::Null` as soon
    /// as the message is queued.
    async fn send_targeted(
        &self,
        cell: &CellPath,
        message: CellMessage,
        call: bool,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope>;

    /// Deliver to a whole subtree (`Down`, rooted at `root` or this cell) or
    /// to every ancestor of this cell (`Up`).
    ///
    /// Calls return one envelope per cell in completion order; casts return
    /// an empty list. With a `timeout`, a cell that has not replied by then
    /// gets a failed envelope built by [`RemoteFailure::timed_out`] instead
    /// of holding up the others.
    ///
    /// [`RemoteFailure::timed_out`]: crate::envelope::RemoteFailure::timed_out
    async fn send_broadcast(
        &self,
        root: Option<&CellPath>,
        direction: Direction,
        message: CellMessage,
        call: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<ResultEnvelope>>;

    /// Start consuming messages addressed to this cell
    async fn start_consumers(&self) -> Result<()>;
}

/// Receiving side of the transport: how a cell answers a message
#[async_trait]
pub trait CellHandler: Send + Sync {
    async fn handle(&self, origin: &CellPath, message: CellMessage) -> anyhow::Result<Value>;
}
