//! End-to-end flows over the loopback driver with three cells

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use honeycomb::propagation::apply_announcement;
use honeycomb::{
    BandwidthUsage, CellError, CellHandler, CellMessage, CellPath, CellTree, CellsConfig, CellsManager,
    InMemoryRecordStore, InstanceFault, LoopbackNetwork, ResourceId, ResourceRecord, TopologyStore, TreeTopology,
};

fn path(text: &str) -> CellPath {
    CellPath::parse(text).unwrap()
}

/// A cell with one compute host, answering from canned data
struct FleetCell {
    name: CellPath,
    host: String,
    topology: Arc<TreeTopology>,
    received: Mutex<Vec<CellMessage>>,
}

impl FleetCell {
    fn new(tree: &Arc<RwLock<CellTree>>, name: &str, host: &str) -> Arc<Self> {
        Arc::new(Self {
            name: path(name),
            host: host.to_string(),
            topology: Arc::new(TreeTopology::new(Arc::clone(tree), path(name)).unwrap()),
            received: Mutex::new(Vec::new()),
        })
    }

    fn service(&self) -> Value {
        json!({"id": "1", "host": self.host, "binary": "compute", "topic": "compute"})
    }

    fn count(&self, method: &str) -> usize {
        self.received.lock().iter().filter(|m| m.method() == method).count()
    }
}

#[async_trait]
impl CellHandler for FleetCell {
    async fn handle(&self, origin: &CellPath, message: CellMessage) -> anyhow::Result<Value> {
        if apply_announcement(self.topology.as_ref(), origin, &message) {
            self.received.lock().push(message);
            return Ok(Value::Null);
        }
        self.received.lock().push(message.clone());
        match message {
            CellMessage::ServiceGetAll { filters } if filters.contains_key("stall") && self.host == "east-1" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            CellMessage::ServiceGetAll { .. } => Ok(json!([self.service()])),
            CellMessage::ServiceGetByComputeHost { host } if host == self.host => Ok(self.service()),
            CellMessage::ServiceGetByComputeHost { host } => bail!("no service on host {host}"),
            CellMessage::ComputeNodeGet { compute_id } if compute_id == "7" => Ok(json!({
                "id": "7",
                "hypervisor_hostname": self.host,
                "vcpus": 16,
            })),
            CellMessage::ComputeNodeGet { compute_id } => bail!("compute node {compute_id} not found"),
            CellMessage::ComputeNodeStats => Ok(json!({"count": 1, "vcpus": 16, "memory_mb": 4096})),
            CellMessage::TaskLogGetAll { task_name, host, .. } => {
                if host.as_deref().is_some_and(|h| h != self.host) {
                    return Ok(json!([]));
                }
                let now = Utc::now();
                Ok(json!([{
                    "id": "3",
                    "task_name": task_name,
                    "host": self.host,
                    "state": "DONE",
                    "period_beginning": now,
                    "period_ending": now,
                }]))
            }
            CellMessage::ProxyRpcToManager { host, .. } if host == "slow" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }
            CellMessage::ProxyRpcToManager { host, topic, message, .. } => Ok(json!({
                "cell": self.name,
                "host": host,
                "topic": topic,
                "echo": message,
            })),
            _ => Ok(Value::Null),
        }
    }
}

struct Fleet {
    top: CellsManager,
    east: CellsManager,
    top_cell: Arc<FleetCell>,
    east_cell: Arc<FleetCell>,
    west_cell: Arc<FleetCell>,
    east_records: Arc<InMemoryRecordStore>,
}

async fn fleet() -> Fleet {
    fleet_with(CellsConfig::default()).await
}

async fn fleet_with(config: CellsConfig) -> Fleet {
    let mut tree = CellTree::new();
    for p in ["api", "api.east", "api.west"] {
        tree.add_cell(path(p)).unwrap();
    }
    let tree = Arc::new(RwLock::new(tree));
    let network = LoopbackNetwork::new(Arc::clone(&tree));

    let top_cell = FleetCell::new(&tree, "api", "top-1");
    let east_cell = FleetCell::new(&tree, "api.east", "east-1");
    let west_cell = FleetCell::new(&tree, "api.west", "west-1");
    east_cell.topology.set_capacities(json!({"ram_free": 100}));
    west_cell.topology.set_capacities(json!({"ram_free": 40}));
    let east_records = Arc::new(InMemoryRecordStore::new());

    let mut managers = Vec::new();
    for (name, handler, records) in [
        ("api", Arc::clone(&top_cell), Arc::new(InMemoryRecordStore::new())),
        ("api.east", Arc::clone(&east_cell), Arc::clone(&east_records)),
        ("api.west", Arc::clone(&west_cell), Arc::new(InMemoryRecordStore::new())),
    ] {
        let topology = Arc::clone(&handler.topology);
        let driver = network.attach(path(name), handler).unwrap();
        let manager = CellsManager::new(config.clone(), topology, records, Arc::new(driver)).unwrap();
        manager.post_start_hook().await.unwrap();
        managers.push(manager);
    }

    let _west = managers.pop().unwrap();
    let east = managers.pop().unwrap();
    let top = managers.pop().unwrap();
    Fleet {
        top,
        east,
        top_cell,
        east_cell,
        west_cell,
        east_records,
    }
}

async fn wait_for(cell: &FleetCell, method: &str, count: usize) {
    for _ in 0..200 {
        if cell.count(method) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never received {count} {method}", cell.name);
}

// === Startup ===

#[tokio::test]
async fn test_startup_pulls_from_children_and_leaves_push() {
    let fleet = fleet().await;

    wait_for(&fleet.east_cell, "request_capabilities", 1).await;
    wait_for(&fleet.west_cell, "request_capacities", 1).await;
    // both leaves announce to the top cell
    wait_for(&fleet.top_cell, "announce_capabilities", 2).await;
    wait_for(&fleet.top_cell, "announce_capacities", 2).await;

    // announcements are applied before they are recorded
    let totals = fleet.top_cell.topology.our_capacities();
    assert_eq!(totals["ram_free"].as_i64(), Some(140));
}

// === Broadcast Queries ===

#[tokio::test]
async fn test_service_get_all_spans_the_tree() {
    let fleet = fleet().await;

    let mut services = fleet.top.service_get_all(BTreeMap::new()).await.unwrap();
    services.sort_by(|a, b| a.id.cmp(&b.id));

    let ids: Vec<&str> = services.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["api!1", "api.east!1", "api.west!1"]);
    let hosts: Vec<&str> = services.iter().map(|s| s.host.as_str()).collect();
    assert_eq!(hosts, vec!["api!top-1", "api.east!east-1", "api.west!west-1"]);
}

#[tokio::test]
async fn test_broadcast_from_a_child_covers_its_subtree_only() {
    let fleet = fleet().await;

    let services = fleet.east.service_get_all(BTreeMap::new()).await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, "api.east!1");
}

#[tokio::test]
async fn test_broadcast_query_times_out_on_a_silent_cell() {
    let fleet = fleet_with(CellsConfig {
        call_timeout_secs: Some(1),
        ..Default::default()
    })
    .await;
    let filters: BTreeMap<String, Value> = [("stall".to_string(), json!(true))].into_iter().collect();

    let result = tokio::time::timeout(Duration::from_secs(4), fleet.top.service_get_all(filters))
        .await
        .expect("service_get_all should give up after the configured call timeout");
    match result.unwrap_err() {
        CellError::Timeout { cell, after } => {
            assert_eq!(cell, path("api.east"));
            assert_eq!(after, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_compute_node_stats_sum_over_cells() {
    let fleet = fleet().await;

    let stats = fleet.top.compute_node_stats().await.unwrap();
    assert_eq!(stats["count"].as_i64(), Some(3));
    assert_eq!(stats["vcpus"].as_i64(), Some(48));
    assert_eq!(stats["memory_mb"].as_i64(), Some(12288));
}

#[tokio::test]
async fn test_task_logs_broadcast_and_targeted() {
    let fleet = fleet().await;
    let now = Utc::now();

    let all = fleet.top.task_log_get_all("audit", now, now, None, None).await.unwrap();
    assert_eq!(all.len(), 3);

    let one = fleet
        .top
        .task_log_get_all("audit", now, now, Some("api.west!west-1"), None)
        .await
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].id, "api.west!3");
    assert_eq!(one[0].host, "api.west!west-1");
    assert_eq!(fleet.east_cell.count("task_log_get_all"), 1);
}

// === Targeted Queries ===

#[tokio::test]
async fn test_targeted_lookups_are_qualified() {
    let fleet = fleet().await;

    let node = fleet.top.compute_node_get("api.east!7").await.unwrap();
    assert_eq!(node.id, "api.east!7");
    assert_eq!(node.vcpus, 16);

    let svc = fleet.top.service_get_by_compute_host("api.west!west-1").await.unwrap();
    assert_eq!(svc.host, "api.west!west-1");
    assert_eq!(svc.cell_name, Some(path("api.west")));
}

#[tokio::test]
async fn test_remote_failure_names_the_cell() {
    let fleet = fleet().await;

    let err = fleet.top.compute_node_get("api.west!99").await.unwrap_err();
    match err {
        CellError::Remote { cell, failure } => {
            assert_eq!(cell, path("api.west"));
            assert!(failure.message.contains("99"));
        }
        other => panic!("expected remote failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_cell_is_not_found() {
    let fleet = fleet().await;

    let err = fleet.top.compute_node_get("api.south!7").await.unwrap_err();
    assert!(matches!(err, CellError::CellNotFound(p) if p == path("api.south")));
}

// === Proxy ===

#[tokio::test]
async fn test_proxy_reaches_the_host_in_its_cell() {
    let fleet = fleet().await;

    let reply = fleet
        .top
        .proxy_rpc_to_manager("compute.api.east!east-1", json!({"method": "ping"}), true, None)
        .await
        .unwrap();
    assert_eq!(reply["cell"], json!("api.east"));
    assert_eq!(reply["host"], json!("east-1"));
    assert_eq!(reply["topic"], json!("compute.east-1"));
    assert_eq!(reply["echo"], json!({"method": "ping"}));
}

#[tokio::test]
async fn test_proxy_call_times_out() {
    let fleet = fleet().await;

    let err = fleet
        .top
        .proxy_rpc_to_manager("compute.api.west!slow", json!({}), true, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    match err {
        CellError::Timeout { cell, after } => {
            assert_eq!(cell, path("api.west"));
            assert_eq!(after, Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

// === Upward Reports ===

#[tokio::test]
async fn test_faults_and_bandwidth_reach_the_top() {
    let fleet = fleet().await;
    let instance_id = ResourceId::new();
    let now = Utc::now();

    fleet
        .east
        .instance_fault_create_at_top(InstanceFault {
            instance_id,
            code: 500,
            message: "boom".into(),
            details: String::new(),
            created_at: now,
        })
        .await;
    fleet
        .east
        .bw_usage_update_at_top(BandwidthUsage {
            instance_id,
            mac: "fa:16:3e:00:00:01".into(),
            start_period: now,
            bw_in: 10,
            bw_out: 20,
            last_ctr_in: 10,
            last_ctr_out: 20,
            last_refreshed: None,
        })
        .await;

    wait_for(&fleet.top_cell, "instance_fault_create_at_top", 1).await;
    wait_for(&fleet.top_cell, "bw_usage_update_at_top", 1).await;
}

#[tokio::test]
async fn test_cell_info_names_neighbors() {
    let fleet = fleet().await;
    let info = fleet.east.get_cell_info_for_neighbors();
    assert_eq!(info["name"], json!("api.east"));
    assert_eq!(info["parents"], json!(["api"]));
}

// === Reconciliation ===

#[tokio::test]
async fn test_heal_publishes_to_the_top() {
    let fleet = fleet().await;
    fleet
        .east_records
        .upsert(ResourceRecord::new(ResourceId::new(), Utc::now()).with_project("p1"));

    let report = fleet.east.heal_instances().await;
    assert_eq!(report.updated, 1);
    assert_eq!(report.failed_sends, 0);

    wait_for(&fleet.top_cell, "instance_update_at_top", 1).await;
    assert_eq!(fleet.west_cell.count("instance_update_at_top"), 0);
}

#[tokio::test]
async fn test_deleted_record_heals_as_destroy() {
    let fleet = fleet().await;
    fleet
        .east_records
        .upsert(ResourceRecord::new(ResourceId::new(), Utc::now()).with_deleted(true));

    let report = fleet.east.heal_instances().await;
    assert_eq!(report.destroyed, 1);
    wait_for(&fleet.top_cell, "instance_destroy_at_top", 1).await;
}

#[tokio::test]
async fn test_top_cell_does_not_heal() {
    let fleet = fleet().await;
    assert!(fleet.top.heal_instances().await.skipped);
}
