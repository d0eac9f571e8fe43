//! Locally-owned resource records and the store that holds them

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CellError, Result};

/// Identifier of a locally-owned resource (an instance UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A locally-owned resource as published upward
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    /// Soft-deleted records are published as destroys
    pub deleted: bool,
    /// Last time anything about the record changed
    pub updated_at: DateTime<Utc>,
    /// Owning project, used to scope forced syncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Everything else the parent needs to mirror the record
    #[serde(default)]
    pub payload: Value,
}

impl ResourceRecord {
    pub fn new(id: ResourceId, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            deleted: false,
            updated_at,
            project_id: None,
            payload: Value::Null,
        }
    }

    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

/// Filter for [`RecordStore::list_resources_needing_sync`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncQuery {
    /// Only records changed strictly after this instant
    pub updated_since: Option<DateTime<Utc>>,
    /// Only records owned by this project
    pub project_id: Option<String>,
    /// Include soft-deleted records
    pub include_deleted: bool,
    /// Return ids in random order
    pub shuffle: bool,
}

impl SyncQuery {
    /// The query the reconciliation cursor issues on refill
    pub fn reconciliation(updated_since: Option<DateTime<Utc>>) -> Self {
        Self {
            updated_since,
            project_id: None,
            include_deleted: true,
            shuffle: true,
        }
    }

    fn matches(&self, record: &ResourceRecord) -> bool {
        if let Some(since) = self.updated_since {
            if record.updated_at <= since {
                return false;
            }
        }
        if let Some(project) = &self.project_id {
            if record.project_id.as_ref() != Some(project) {
                return false;
            }
        }
        self.include_deleted || !record.deleted
    }
}

/// Database of locally-owned resources
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Identifiers of resources that should be re-published upward
    async fn list_resources_needing_sync(&self, query: &SyncQuery) -> Result<Vec<ResourceId>>;

    /// Fetch one record, deleted ones included; `ResourceNotFound` if absent
    async fn get_resource(&self, id: &ResourceId) -> Result<ResourceRecord>;
}

/// Record store kept in process memory
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<ResourceId, ResourceRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub fn upsert(&self, record: ResourceRecord) {
        self.records.write().insert(record.id, record);
    }

    /// Hard-delete a record
    pub fn remove(&self, id: &ResourceId) -> Option<ResourceRecord> {
        self.records.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list_resources_needing_sync(&self, query: &SyncQuery) -> Result<Vec<ResourceId>> {
        let mut ids: Vec<ResourceId> = {
            let records = self.records.read();
            let mut matching: Vec<&ResourceRecord> =
                records.values().filter(|r| query.matches(r)).collect();
            matching.sort_by_key(|r| (r.updated_at, r.id));
            matching.into_iter().map(|r| r.id).collect()
        };
        if query.shuffle {
            ids.shuffle(&mut rand::thread_rng());
        }
        Ok(ids)
    }

    async fn get_resource(&self, id: &ResourceId) -> Result<ResourceRecord> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or(CellError::ResourceNotFound(*id))
    }
}
