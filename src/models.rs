//! Records returned by fleet-wide queries
//!
//! Each cell answers with its own local ids. Before a record leaves the
//! manager it is qualified with the cell that returned it, so the id and host
//! can be fed straight back into a targeted call (`api.east!12`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{cell_with_item, CellPath};
use crate::records::ResourceId;

/// Rewrites local identifiers into cell-qualified ones
pub trait CellScoped {
    fn qualify(self, cell: &CellPath, separator: char) -> Self;
}

/// A service running somewhere in a cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub host: String,
    pub binary: String,
    pub topic: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_name: Option<CellPath>,
}

impl CellScoped for Service {
    fn qualify(mut self, cell: &CellPath, separator: char) -> Self {
        self.id = cell_with_item(cell, &self.id, separator);
        self.host = cell_with_item(cell, &self.host, separator);
        self.cell_name = Some(cell.clone());
        self
    }
}

/// A hypervisor node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub id: String,
    pub hypervisor_hostname: String,
    #[serde(default)]
    pub hypervisor_type: String,
    #[serde(default)]
    pub vcpus: i64,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub local_gb: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_name: Option<CellPath>,
}

impl CellScoped for ComputeNode {
    fn qualify(mut self, cell: &CellPath, separator: char) -> Self {
        self.id = cell_with_item(cell, &self.id, separator);
        self.service = self.service.map(|s| s.qualify(cell, separator));
        self.cell_name = Some(cell.clone());
        self
    }
}

/// Audit entry for a periodic task run on a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: String,
    pub task_name: String,
    pub host: String,
    pub state: String,
    pub period_beginning: DateTime<Utc>,
    pub period_ending: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_name: Option<CellPath>,
}

impl CellScoped for TaskLog {
    fn qualify(mut self, cell: &CellPath, separator: char) -> Self {
        self.id = cell_with_item(cell, &self.id, separator);
        self.host = cell_with_item(cell, &self.host, separator);
        self.cell_name = Some(cell.clone());
        self
    }
}

/// A fault recorded against an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceFault {
    pub instance_id: ResourceId,
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub details: String,
    pub created_at: DateTime<Utc>,
}

/// Bandwidth counters for one interface of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthUsage {
    pub instance_id: ResourceId,
    pub mac: String,
    pub start_period: DateTime<Utc>,
    pub bw_in: u64,
    pub bw_out: u64,
    pub last_ctr_in: u64,
    pub last_ctr_out: u64,
    pub last_refreshed: Option<DateTime<Utc>>,
}

/// How an instance should be removed everywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteType {
    Delete,
    SoftDelete,
}
