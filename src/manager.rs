//! Coordination manager - the operations the local cell exposes
//!
//! Every operation is one of three shapes: a targeted call or cast to one
//! cell, a broadcast whose replies are concatenated, or a broadcast whose
//! replies are summed. Remote failures of a call surface to the caller
//! attributed to the cell that raised them; casts only log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::address::{CellPath, TargetAddress};
use crate::aggregate::{concatenate_lists, single, sum_numeric_maps};
use crate::config::CellsConfig;
use crate::envelope::ResultEnvelope;
use crate::error::{CellError, Result};
use crate::message::{CellMessage, Direction};
use crate::models::{BandwidthUsage, CellScoped, ComputeNode, DeleteType, InstanceFault, Service, TaskLog};
use crate::propagation::PropagationLoop;
use crate::reconcile::{ReconciliationEngine, TickReport};
use crate::records::{RecordStore, ResourceRecord};
use crate::router::Router;
use crate::topology::TopologyStore;
use crate::transport::Transport;

/// Joins a topic name to the host it is addressed to
const TOPIC_SEPARATOR: char = '.';

/// The cells manager
///
/// Routes requests from the local cell to other cells and runs the periodic
/// reconciliation and propagation work.
pub struct CellsManager {
    /// Service configuration
    config: CellsConfig,
    /// Where this cell sits in the tree
    topology: Arc<dyn TopologyStore>,
    /// Message routing over the configured driver
    router: Router,
    /// Reconciliation engine, shared with the periodic loop
    healer: Arc<Mutex<ReconciliationEngine>>,
    /// Capability/capacity propagation
    propagation: Arc<PropagationLoop>,
}

impl CellsManager {
    /// Create a manager for the local cell
    pub fn new(
        config: CellsConfig,
        topology: Arc<dyn TopologyStore>,
        records: Arc<dyn RecordStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let router = Router::new(transport, config.call_timeout());
        let healer = ReconciliationEngine::new(
            records,
            Arc::clone(&topology),
            router.clone(),
            config.updated_at_threshold(),
            config.instance_update_num_instances,
        );
        let propagation = PropagationLoop::new(Arc::clone(&topology), router.clone());

        info!(
            cell = %topology.my_cell_path(),
            driver = ?config.driver,
            "Created cells manager"
        );

        Ok(Self {
            config,
            topology,
            router,
            healer: Arc::new(Mutex::new(healer)),
            propagation: Arc::new(propagation),
        })
    }

    pub fn config(&self) -> &CellsConfig {
        &self.config
    }

    pub fn cell_path(&self) -> CellPath {
        self.topology.my_cell_path()
    }

    /// Start the driver's consumers, then get fresh metrics moving: ask
    /// children for theirs, or at a leaf push ours to the parents.
    #[instrument(skip(self), fields(cell = %self.topology.my_cell_path()))]
    pub async fn post_start_hook(&self) -> Result<()> {
        self.router.transport().start_consumers().await?;
        self.propagation.on_start().await;
        info!("Cells manager started");
        Ok(())
    }

    /// Spawn the reconciliation and parent-update loops
    pub fn spawn_periodic_tasks(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let heal = tokio::spawn(ReconciliationEngine::run(
            Arc::clone(&self.healer),
            self.config.heal_interval(),
            shutdown.clone(),
        ));
        let update = tokio::spawn(
            Arc::clone(&self.propagation).run(self.config.update_parents_interval(), shutdown),
        );
        vec![heal, update]
    }

    /// Run one reconciliation tick now
    pub async fn heal_instances(&self) -> TickReport {
        self.healer.lock().await.tick().await
    }

    /// Push our capabilities and capacities to the parents now
    pub async fn update_our_parents(&self) {
        self.propagation.update_parents().await;
    }

    /// Hand a neighbor's propagation message (announcement or request) to the
    /// propagation loop. Returns false for any other message.
    pub async fn receive_propagation(&self, origin: &CellPath, message: &CellMessage) -> bool {
        self.propagation.receive(origin, message).await
    }

    // === Targeted ===

    /// Hand a build request to the scheduler, starting with this cell
    pub async fn schedule_run_instance(&self, host_sched_kwargs: Value) -> Result<()> {
        self.router
            .cast(&CellPath::local(), CellMessage::ScheduleRunInstance { host_sched_kwargs })
            .await
    }

    /// Snapshot of this cell for its neighbors
    pub fn get_cell_info_for_neighbors(&self) -> Value {
        self.topology.cell_info_for_neighbors()
    }

    /// Run a compute API method in a specific cell. Only calls return a value.
    pub async fn run_compute_api_method(
        &self,
        cell_name: &str,
        method_info: Value,
        call: bool,
    ) -> Result<Option<Value>> {
        let cell = self.parse_cell(cell_name)?;
        let message = CellMessage::RunComputeApiMethod { method_info };
        if !call {
            self.router.cast(&cell, message).await?;
            return Ok(None);
        }
        let envelope = self.router.call(&cell, message, None).await?;
        single(vec![envelope]).map(Some)
    }

    /// Service entry for a compute host, addressed as `cell!host`
    pub async fn service_get_by_compute_host(&self, host_name: &str) -> Result<Service> {
        let addr = self.parse_address(host_name)?;
        let envelope = self
            .router
            .call(
                &addr.cell_path,
                CellMessage::ServiceGetByComputeHost {
                    host: addr.destination_host().to_string(),
                },
                None,
            )
            .await?;
        self.qualified_single(envelope)
    }

    /// Compute node by id, addressed as `cell!id`
    pub async fn compute_node_get(&self, compute_id: &str) -> Result<ComputeNode> {
        let addr = self.parse_address(compute_id)?;
        let envelope = self
            .router
            .call(
                &addr.cell_path,
                CellMessage::ComputeNodeGet {
                    compute_id: addr.item.clone(),
                },
                None,
            )
            .await?;
        self.qualified_single(envelope)
    }

    /// Forward a management RPC verbatim to a host in some cell.
    ///
    /// `topic` is `<compute_topic>.<cell>!<host>`; the cell part is stripped
    /// and the host receives the message on `<compute_topic>.<host>`. Casts
    /// return `Value::Null`.
    #[instrument(skip(self, rpc_message))]
    pub async fn proxy_rpc_to_manager(
        &self,
        topic: &str,
        rpc_message: Value,
        call: bool,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let compute_topic = &self.config.compute_topic;
        let cell_and_host = topic
            .strip_prefix(compute_topic.as_str())
            .and_then(|rest| rest.strip_prefix(TOPIC_SEPARATOR))
            .ok_or_else(|| {
                CellError::malformed(topic, format!("topic does not start with '{compute_topic}{TOPIC_SEPARATOR}'"))
            })?;
        let addr = self.parse_address(cell_and_host)?;
        let host = addr.destination_host().to_string();
        let message = CellMessage::ProxyRpcToManager {
            topic: format!("{compute_topic}{TOPIC_SEPARATOR}{host}"),
            host,
            message: rpc_message,
            call,
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };

        debug!(cell = %addr.cell_path, call, "Proxying RPC to manager");
        if !call {
            self.router.cast(&addr.cell_path, message).await?;
            return Ok(Value::Null);
        }
        let envelope = self.router.call(&addr.cell_path, message, timeout).await?;
        single(vec![envelope])
    }

    // === Upward and downward casts ===

    /// Update an instance at the top level cell
    pub async fn instance_update_at_top(&self, instance: ResourceRecord) {
        self.router
            .cast_broadcast(None, Direction::Up, CellMessage::InstanceUpdateAtTop { instance })
            .await;
    }

    /// Destroy an instance at the top level cell
    pub async fn instance_destroy_at_top(&self, instance: ResourceRecord) {
        self.router
            .cast_broadcast(None, Direction::Up, CellMessage::InstanceDestroyAtTop { instance })
            .await;
    }

    /// Delete an instance in whichever cell has it
    pub async fn instance_delete_everywhere(&self, instance: ResourceRecord, delete_type: DeleteType) {
        self.router
            .cast_broadcast(
                None,
                Direction::Down,
                CellMessage::InstanceDeleteEverywhere { instance, delete_type },
            )
            .await;
    }

    /// Record an instance fault at the top level cell
    pub async fn instance_fault_create_at_top(&self, fault: InstanceFault) {
        self.router
            .cast_broadcast(None, Direction::Up, CellMessage::InstanceFaultCreateAtTop { fault })
            .await;
    }

    /// Update bandwidth usage at the top level cell
    pub async fn bw_usage_update_at_top(&self, usage: BandwidthUsage) {
        self.router
            .cast_broadcast(None, Direction::Up, CellMessage::BwUsageUpdateAtTop { usage })
            .await;
    }

    /// Ask every cell below to re-publish its instances, optionally only one
    /// project's and only those changed since a point in time
    pub async fn sync_instances(
        &self,
        project_id: Option<String>,
        updated_since: Option<DateTime<Utc>>,
        deleted: bool,
    ) {
        self.router
            .cast_broadcast(
                None,
                Direction::Down,
                CellMessage::SyncInstances {
                    project_id,
                    updated_since,
                    deleted,
                },
            )
            .await;
    }

    // === Broadcast queries ===

    /// Services in this cell and every cell below it
    pub async fn service_get_all(&self, filters: BTreeMap<String, Value>) -> Result<Vec<Service>> {
        let envelopes = self
            .router
            .call_broadcast(None, Direction::Down, CellMessage::ServiceGetAll { filters }, None)
            .await?;
        self.qualified_list(envelopes)
    }

    /// Task logs from every cell, or from the cell (and host) named by `host`
    /// written as `cell!host`
    pub async fn task_log_get_all(
        &self,
        task_name: &str,
        period_beginning: DateTime<Utc>,
        period_ending: DateTime<Utc>,
        host: Option<&str>,
        state: Option<String>,
    ) -> Result<Vec<TaskLog>> {
        let target = host.map(|h| self.parse_address(h)).transpose()?;
        let message = CellMessage::TaskLogGetAll {
            task_name: task_name.to_string(),
            period_beginning,
            period_ending,
            host: target.as_ref().map(|t| t.destination_host().to_string()),
            state,
        };
        let envelopes = match &target {
            Some(addr) => vec![self.router.call(&addr.cell_path, message, None).await?],
            None => self.router.call_broadcast(None, Direction::Down, message, None).await?,
        };
        self.qualified_list(envelopes)
    }

    /// Compute nodes in every cell, optionally matching a hypervisor hostname
    pub async fn compute_node_get_all(&self, hypervisor_match: Option<String>) -> Result<Vec<ComputeNode>> {
        let envelopes = self
            .router
            .call_broadcast(None, Direction::Down, CellMessage::ComputeNodeGetAll { hypervisor_match }, None)
            .await?;
        self.qualified_list(envelopes)
    }

    /// Compute node statistics summed over every cell
    pub async fn compute_node_stats(&self) -> Result<BTreeMap<String, Number>> {
        let envelopes = self
            .router
            .call_broadcast(None, Direction::Down, CellMessage::ComputeNodeStats, None)
            .await?;
        sum_numeric_maps(envelopes)
    }

    // === Helpers ===

    fn parse_cell(&self, text: &str) -> Result<CellPath> {
        CellPath::parse_with(text, self.config.path_separator)
    }

    fn parse_address(&self, text: &str) -> Result<TargetAddress> {
        TargetAddress::parse_with(text, self.config.path_separator)
    }

    fn qualified_single<T>(&self, envelope: ResultEnvelope) -> Result<T>
    where
        T: DeserializeOwned + CellScoped,
    {
        let cell = envelope.cell_name.clone();
        let value = single(vec![envelope])?;
        let record: T = serde_json::from_value(value)?;
        Ok(record.qualify(&cell, self.config.path_separator))
    }

    fn qualified_list<T>(&self, envelopes: Vec<ResultEnvelope>) -> Result<Vec<T>>
    where
        T: DeserializeOwned + CellScoped,
    {
        concatenate_lists(envelopes)?
            .into_iter()
            .map(|tagged| {
                let record: T = serde_json::from_value(tagged.item)?;
                Ok(record.qualify(&tagged.cell_name, self.config.path_separator))
            })
            .collect()
    }
}
