//! Capability and capacity propagation between neighbor cells

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::address::CellPath;
use crate::message::CellMessage;
use crate::router::Router;
use crate::topology::TopologyStore;

/// Pushes this cell's metrics to its parents and pulls its children's
pub struct PropagationLoop {
    topology: Arc<dyn TopologyStore>,
    router: Router,
    initial_pull_done: AtomicBool,
}

impl PropagationLoop {
    pub fn new(topology: Arc<dyn TopologyStore>, router: Router) -> Self {
        Self {
            topology,
            router,
            initial_pull_done: AtomicBool::new(false),
        }
    }

    /// Whether [`PropagationLoop::on_start`] has run
    pub fn initial_pull_done(&self) -> bool {
        self.initial_pull_done.load(Ordering::Acquire)
    }

    /// Ask children for fresh metrics, or, at a leaf, push ours up right away
    #[instrument(skip(self))]
    pub async fn on_start(&self) {
        let children = self.topology.child_cells();
        if children.is_empty() {
            debug!("No child cells, updating parents immediately");
            self.update_parents().await;
        } else {
            for child in &children {
                self.cast(child, CellMessage::RequestCapabilities).await;
                self.cast(child, CellMessage::RequestCapacities).await;
            }
            info!(children = children.len(), "Asked child cells for capabilities and capacities");
        }
        self.initial_pull_done.store(true, Ordering::Release);
    }

    /// Push our capabilities and capacities to every parent
    pub async fn update_parents(&self) {
        let parents = self.topology.parent_cells();
        if parents.is_empty() {
            return;
        }
        let capabilities = self.topology.our_capabilities();
        let capacities = self.topology.our_capacities();
        for parent in &parents {
            self.cast(
                parent,
                CellMessage::AnnounceCapabilities {
                    capabilities: capabilities.clone(),
                },
            )
            .await;
            self.cast(
                parent,
                CellMessage::AnnounceCapacities {
                    capacities: capacities.clone(),
                },
            )
            .await;
        }
        debug!(parents = parents.len(), "Told parents our capabilities and capacities");
    }

    /// Act on a propagation message from a neighbor: record a child's
    /// announcement, or answer a parent's request by pushing ours up.
    ///
    /// Returns false for messages that are not about propagation.
    pub async fn receive(&self, origin: &CellPath, message: &CellMessage) -> bool {
        match message {
            CellMessage::RequestCapabilities | CellMessage::RequestCapacities => {
                debug!(origin = %origin, method = message.method(), "Parent asked for an update");
                self.update_parents().await;
                true
            }
            _ => apply_announcement(self.topology.as_ref(), origin, message),
        }
    }

    async fn cast(&self, cell: &CellPath, message: CellMessage) {
        let method = message.method();
        if let Err(e) = self.router.cast(cell, message).await {
            warn!(cell = %cell, method, error = %e, "Propagation message not delivered");
        }
    }

    /// Push to parents every `period` until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // startup already pushed or pulled, skip the immediate tick
        interval.tick().await;
        info!(period_secs = period.as_secs(), "Starting parent update loop");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.update_parents().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Parent update loop stopped");
    }
}

/// Store a child's announced capabilities or capacities in `topology`.
///
/// Announcements from cells that are not children of this one are ignored.
/// Returns false when `message` is not an announcement.
pub fn apply_announcement(topology: &dyn TopologyStore, origin: &CellPath, message: &CellMessage) -> bool {
    let is_child = || topology.child_cells().contains(origin);
    match message {
        CellMessage::AnnounceCapabilities { capabilities } => {
            if is_child() {
                topology.update_cell_capabilities(origin, capabilities.clone());
            } else {
                warn!(origin = %origin, "Ignoring capabilities from a cell that is not a child");
            }
            true
        }
        CellMessage::AnnounceCapacities { capacities } => {
            if is_child() {
                topology.update_cell_capacities(origin, capacities.clone());
            } else {
                warn!(origin = %origin, "Ignoring capacities from a cell that is not a child");
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ResultEnvelope;
    use crate::error::Result;
    use crate::message::Direction;
    use crate::topology::{CellTree, TreeTopology};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use parking_lot::{Mutex, RwLock};
    use serde_json::json;

    fn path(text: &str) -> CellPath {
        CellPath::parse(text).unwrap()
    }

    #[derive(Default)]
    struct RecordingTransport {
        targeted: Mutex<Vec<(CellPath, CellMessage)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_targeted(
            &self,
            cell: &CellPath,
            message: CellMessage,
            _call: bool,
            _timeout: Option<Duration>,
        ) -> Result<ResultEnvelope> {
            self.targeted.lock().push((cell.clone(), message));
            Ok(ResultEnvelope::ok(cell.clone(), json!(null)))
        }

        async fn send_broadcast(
            &self,
            _root: Option<&CellPath>,
            _direction: Direction,
            _message: CellMessage,
            _call: bool,
            _timeout: Option<Duration>,
        ) -> Result<Vec<ResultEnvelope>> {
            Ok(vec![])
        }

        async fn start_consumers(&self) -> Result<()> {
            Ok(())
        }
    }

    fn propagation(me: &str) -> (PropagationLoop, Arc<RecordingTransport>, Arc<TreeTopology>) {
        let mut tree = CellTree::new();
        for p in ["api", "api.east", "api.east.rack1"] {
            tree.add_cell(path(p)).unwrap();
        }
        let topology = Arc::new(TreeTopology::new(Arc::new(RwLock::new(tree)), path(me)).unwrap());
        let transport = Arc::new(RecordingTransport::default());
        let lp = PropagationLoop::new(topology.clone(), Router::new(transport.clone(), None));
        (lp, transport, topology)
    }

    #[tokio::test]
    async fn test_start_with_children_pulls() {
        let (lp, transport, _) = propagation("api.east");
        assert!(!lp.initial_pull_done());

        lp.on_start().await;

        let sent = transport.targeted.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(cell, _)| *cell == path("api.east.rack1")));
        assert!(matches!(sent[0].1, CellMessage::RequestCapabilities));
        assert!(matches!(sent[1].1, CellMessage::RequestCapacities));
        drop(sent);
        assert!(lp.initial_pull_done());
    }

    #[tokio::test]
    async fn test_start_at_leaf_pushes() {
        let (lp, transport, topology) = propagation("api.east.rack1");
        topology.set_capacities(json!({"ram_free": 512}));

        lp.on_start().await;

        let sent = transport.targeted.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, path("api.east"));
        assert!(matches!(sent[0].1, CellMessage::AnnounceCapabilities { .. }));
        match &sent[1].1 {
            CellMessage::AnnounceCapacities { capacities } => {
                assert_eq!(capacities, &json!({"ram_free": 512}));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_top_cell_has_no_one_to_tell() {
        let (lp, transport, _) = propagation("api");
        lp.update_parents().await;
        assert!(transport.targeted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_pushes_periodically() {
        let (lp, transport, _) = propagation("api.east");
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::new(lp).run(Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let sent = transport.targeted.lock();
        assert!(sent.len() >= 2);
        assert!(sent.iter().all(|(cell, _)| *cell == path("api")));
    }

    #[tokio::test]
    async fn test_receive_records_child_announcements() {
        let (lp, _, topology) = propagation("api.east");
        topology.set_capacities(json!({"ram_free": 10}));

        let rack = path("api.east.rack1");
        assert!(lp.receive(&rack, &CellMessage::AnnounceCapacities { capacities: json!({"ram_free": 5}) }).await);
        assert!(lp.receive(&rack, &CellMessage::AnnounceCapabilities { capabilities: json!({"gpu": [true]}) }).await);

        assert_eq!(topology.our_capacities(), json!({"ram_free": 15}));
        assert_eq!(topology.our_capabilities(), json!({"gpu": [true]}));
    }

    #[tokio::test]
    async fn test_receive_ignores_announcements_from_strangers() {
        let (lp, _, topology) = propagation("api.east");
        let handled = lp
            .receive(&path("api"), &CellMessage::AnnounceCapacities { capacities: json!({"ram_free": 5}) })
            .await;
        assert!(handled);
        assert_eq!(topology.our_capacities(), json!({}));
    }

    #[tokio::test]
    async fn test_receive_request_pushes_to_parents() {
        let (lp, transport, _) = propagation("api.east");
        assert!(lp.receive(&path("api"), &CellMessage::RequestCapacities).await);
        assert_eq!(transport.targeted.lock().len(), 2);

        assert!(!lp.receive(&path("api"), &CellMessage::ComputeNodeStats).await);
    }
}
