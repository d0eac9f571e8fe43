//! Messages exchanged between cells

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{BandwidthUsage, DeleteType, InstanceFault};
use crate::records::ResourceRecord;

/// Which way a broadcast travels through the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Toward the top cell
    Up,
    /// Toward the leaves
    Down,
}

/// Every request one cell can make of another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum CellMessage {
    ScheduleRunInstance {
        host_sched_kwargs: Value,
    },
    RunComputeApiMethod {
        method_info: Value,
    },
    InstanceUpdateAtTop {
        instance: ResourceRecord,
    },
    InstanceDestroyAtTop {
        instance: ResourceRecord,
    },
    InstanceDeleteEverywhere {
        instance: ResourceRecord,
        delete_type: DeleteType,
    },
    InstanceFaultCreateAtTop {
        fault: InstanceFault,
    },
    BwUsageUpdateAtTop {
        usage: BandwidthUsage,
    },
    SyncInstances {
        project_id: Option<String>,
        updated_since: Option<DateTime<Utc>>,
        deleted: bool,
    },
    ServiceGetAll {
        filters: BTreeMap<String, Value>,
    },
    ServiceGetByComputeHost {
        host: String,
    },
    /// Forwarded as-is to a host's management endpoint inside the target cell
    ProxyRpcToManager {
        host: String,
        topic: String,
        message: Value,
        call: bool,
        /// Caller's deadline, in milliseconds
        timeout_ms: Option<u64>,
    },
    TaskLogGetAll {
        task_name: String,
        period_beginning: DateTime<Utc>,
        period_ending: DateTime<Utc>,
        host: Option<String>,
        state: Option<String>,
    },
    ComputeNodeGet {
        compute_id: String,
    },
    ComputeNodeGetAll {
        hypervisor_match: Option<String>,
    },
    ComputeNodeStats,
    AnnounceCapabilities {
        capabilities: Value,
    },
    AnnounceCapacities {
        capacities: Value,
    },
    RequestCapabilities,
    RequestCapacities,
}

impl CellMessage {
    /// Method name used in logs
    pub fn method(&self) -> &'static str {
        match self {
            Self::ScheduleRunInstance { .. } => "schedule_run_instance",
            Self::RunComputeApiMethod { .. } => "run_compute_api_method",
            Self::InstanceUpdateAtTop { .. } => "instance_update_at_top",
            Self::InstanceDestroyAtTop { .. } => "instance_destroy_at_top",
            Self::InstanceDeleteEverywhere { .. } => "instance_delete_everywhere",
            Self::InstanceFaultCreateAtTop { .. } => "instance_fault_create_at_top",
            Self::BwUsageUpdateAtTop { .. } => "bw_usage_update_at_top",
            Self::SyncInstances { .. } => "sync_instances",
            Self::ServiceGetAll { .. } => "service_get_all",
            Self::ServiceGetByComputeHost { .. } => "service_get_by_compute_host",
            Self::ProxyRpcToManager { .. } => "proxy_rpc_to_manager",
            Self::TaskLogGetAll { .. } => "task_log_get_all",
            Self::ComputeNodeGet { .. } => "compute_node_get",
            Self::ComputeNodeGetAll { .. } => "compute_node_get_all",
            Self::ComputeNodeStats => "compute_node_stats",
            Self::AnnounceCapabilities { .. } => "announce_capabilities",
            Self::AnnounceCapacities { .. } => "announce_capacities",
            Self::RequestCapabilities => "request_capabilities",
            Self::RequestCapacities => "request_capacities",
        }
    }
}
