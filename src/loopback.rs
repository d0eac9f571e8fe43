//! In-process transport driver
//!
//! Every attached cell gets a mailbox (an unbounded channel). Deliveries queue
//! in the mailbox until the cell calls [`Transport::start_consumers`], which
//! spawns a consumer that runs each delivery on its own task. Calls carry a
//! oneshot channel for the reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::address::CellPath;
use crate::envelope::{RemoteFailure, ResultEnvelope};
use crate::error::{CellError, Result};
use crate::message::{CellMessage, Direction};
use crate::topology::CellTree;
use crate::transport::{CellHandler, Transport};

type Reply = oneshot::Sender<std::result::Result<Value, RemoteFailure>>;

/// One message waiting in a mailbox
struct Delivery {
    origin: CellPath,
    message: CellMessage,
    reply: Option<Reply>,
}

/// Receiving end of a cell
struct Mailbox {
    tx: mpsc::UnboundedSender<Delivery>,
    /// Taken by the consumer when it starts
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    handler: Arc<dyn CellHandler>,
}

/// Shared fabric connecting every cell of one tree
pub struct LoopbackNetwork {
    tree: Arc<RwLock<CellTree>>,
    mailboxes: RwLock<HashMap<CellPath, Arc<Mailbox>>>,
}

impl LoopbackNetwork {
    pub fn new(tree: Arc<RwLock<CellTree>>) -> Arc<Self> {
        Arc::new(Self {
            tree,
            mailboxes: RwLock::new(HashMap::new()),
        })
    }

    /// Give `cell` a mailbox served by `handler` and return its driver
    pub fn attach(self: &Arc<Self>, cell: CellPath, handler: Arc<dyn CellHandler>) -> Result<LoopbackDriver> {
        if !self.tree.read().contains(&cell) {
            return Err(CellError::CellNotFound(cell));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = Arc::new(Mailbox {
            tx,
            rx: Mutex::new(Some(rx)),
            handler,
        });
        if self.mailboxes.write().insert(cell.clone(), mailbox).is_some() {
            warn!(cell = %cell, "Replaced existing mailbox");
        }
        info!(cell = %cell, "Attached cell to loopback network");
        Ok(LoopbackDriver {
            network: Arc::clone(self),
            me: cell,
        })
    }

    /// Take a cell off the network. New deliveries to it fail. Messages already
    /// queued are still handled if its consumer is running; calls that can no
    /// longer be answered resolve as disconnected.
    pub fn detach(&self, cell: &CellPath) -> bool {
        self.mailboxes.write().remove(cell).is_some()
    }

    fn mailbox(&self, cell: &CellPath) -> Result<Arc<Mailbox>> {
        if let Some(mailbox) = self.mailboxes.read().get(cell) {
            return Ok(Arc::clone(mailbox));
        }
        if self.tree.read().contains(cell) {
            Err(CellError::Transport(format!("cell {cell} is not reachable")))
        } else {
            Err(CellError::CellNotFound(cell.clone()))
        }
    }
}

/// One cell's handle on a [`LoopbackNetwork`]
#[derive(Clone)]
pub struct LoopbackDriver {
    network: Arc<LoopbackNetwork>,
    me: CellPath,
}

impl LoopbackDriver {
    pub fn cell(&self) -> &CellPath {
        &self.me
    }

    fn resolve(&self, cell: &CellPath) -> CellPath {
        if cell.is_local() {
            self.me.clone()
        } else {
            cell.clone()
        }
    }

    fn deliver(
        &self,
        to: &CellPath,
        message: CellMessage,
        call: bool,
    ) -> Result<Option<oneshot::Receiver<std::result::Result<Value, RemoteFailure>>>> {
        let mailbox = self.network.mailbox(to)?;
        let (reply, rx) = if call {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        debug!(from = %self.me, to = %to, method = message.method(), call, "Delivering message");
        mailbox
            .tx
            .send(Delivery {
                origin: self.me.clone(),
                message,
                reply,
            })
            .map_err(|_| CellError::Transport(format!("mailbox for {to} is closed")))?;
        Ok(rx)
    }

    fn broadcast_targets(&self, root: Option<&CellPath>, direction: Direction) -> Vec<CellPath> {
        let tree = self.network.tree.read();
        match direction {
            Direction::Down => {
                let root = root.map(|r| self.resolve(r)).unwrap_or_else(|| self.me.clone());
                tree.subtree(&root)
            }
            Direction::Up => tree.ancestors(&self.me),
        }
    }
}

async fn await_reply(
    cell: CellPath,
    rx: oneshot::Receiver<std::result::Result<Value, RemoteFailure>>,
) -> ResultEnvelope {
    match rx.await {
        Ok(outcome) => ResultEnvelope { cell_name: cell, outcome },
        Err(_) => ResultEnvelope::failed(
            cell,
            RemoteFailure::new("Disconnected", "cell dropped the request without replying"),
        ),
    }
}

/// Like [`await_reply`], but a cell silent past `timeout` gets a timed-out envelope
async fn await_reply_within(
    cell: CellPath,
    rx: oneshot::Receiver<std::result::Result<Value, RemoteFailure>>,
    timeout: Option<Duration>,
) -> ResultEnvelope {
    let Some(after) = timeout else {
        return await_reply(cell, rx).await;
    };
    match tokio::time::timeout(after, await_reply(cell.clone(), rx)).await {
        Ok(envelope) => envelope,
        Err(_) => {
            warn!(cell = %cell, after_ms = after.as_millis() as u64, "Cell did not reply in time");
            ResultEnvelope::failed(cell, RemoteFailure::timed_out(after))
        }
    }
}

#[async_trait]
impl Transport for LoopbackDriver {
    async fn send_targeted(
        &self,
        cell: &CellPath,
        message: CellMessage,
        call: bool,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope> {
        let target = self.resolve(cell);
        let Some(rx) = self.deliver(&target, message, call)? else {
            return Ok(ResultEnvelope::ok(target, Value::Null));
        };

        match timeout {
            Some(after) => tokio::time::timeout(after, await_reply(target.clone(), rx))
                .await
                .map_err(|_| CellError::Timeout { cell: target, after }),
            None => Ok(await_reply(target, rx).await),
        }
    }

    async fn send_broadcast(
        &self,
        root: Option<&CellPath>,
        direction: Direction,
        message: CellMessage,
        call: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<ResultEnvelope>> {
        let targets = self.broadcast_targets(root, direction);
        let mut pending = FuturesUnordered::new();
        let mut unreachable = Vec::new();

        for target in targets {
            match self.deliver(&target, message.clone(), call) {
                Ok(Some(rx)) => pending.push(await_reply_within(target, rx, timeout)),
                Ok(None) => {}
                Err(e) => {
                    warn!(cell = %target, error = %e, method = message.method(), "Broadcast delivery failed");
                    if call {
                        unreachable.push(ResultEnvelope::failed(
                            target,
                            RemoteFailure::new("Unreachable", e.to_string()),
                        ));
                    }
                }
            }
        }

        let mut envelopes = unreachable;
        while let Some(envelope) = pending.next().await {
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    async fn start_consumers(&self) -> Result<()> {
        let mailbox = self.network.mailbox(&self.me)?;
        let Some(mut rx) = mailbox.rx.lock().take() else {
            debug!(cell = %self.me, "Consumers already running");
            return Ok(());
        };
        let handler = Arc::clone(&mailbox.handler);
        let cell = self.me.clone();
        drop(mailbox);

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let handler = Arc::clone(&handler);
                let cell = cell.clone();
                tokio::spawn(async move {
                    let method = delivery.message.method();
                    let outcome = handler
                        .handle(&delivery.origin, delivery.message)
                        .await
                        .map_err(|e| RemoteFailure::from_error(&e));
                    match delivery.reply {
                        Some(reply) => {
                            let _ = reply.send(outcome);
                        }
                        None => {
                            if let Err(failure) = outcome {
                                warn!(cell = %cell, method, error = %failure, "Cast handler failed");
                            }
                        }
                    }
                });
            }
            debug!(cell = %cell, "Mailbox closed, consumer stopped");
        });

        info!(cell = %self.me, "Started consumers");
        Ok(())
    }
}
