//! Restartable work queue of resources waiting to be re-published upward

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::records::{RecordStore, ResourceId, SyncQuery};

/// Shuffled backlog of resource ids, refilled lazily from the record store.
///
/// At most one store scan happens per tick: once a refill has been tried in
/// the current tick, an empty queue stays empty until [`begin_tick`] is
/// called again.
///
/// [`begin_tick`]: ReconciliationCursor::begin_tick
#[derive(Debug)]
pub struct ReconciliationCursor {
    pending: VecDeque<ResourceId>,
    refilled_this_tick: bool,
    exhausted: bool,
    scans: u64,
}

impl ReconciliationCursor {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            refilled_this_tick: false,
            exhausted: true,
            scans: 0,
        }
    }

    /// Allow one more refill
    pub fn begin_tick(&mut self) {
        self.refilled_this_tick = false;
    }

    /// Next id to reconcile, or `None` when the backlog is drained for this tick
    pub async fn next(
        &mut self,
        store: &dyn RecordStore,
        updated_since: Option<DateTime<Utc>>,
    ) -> Result<Option<ResourceId>> {
        if let Some(id) = self.pending.pop_front() {
            return Ok(Some(id));
        }
        if self.refilled_this_tick {
            self.exhausted = true;
            return Ok(None);
        }

        self.refilled_this_tick = true;
        self.scans += 1;
        let ids = store
            .list_resources_needing_sync(&SyncQuery::reconciliation(updated_since))
            .await?;
        debug!(count = ids.len(), since = ?updated_since, "Refilled reconciliation backlog");
        self.pending.extend(ids);

        match self.pending.pop_front() {
            Some(id) => {
                self.exhausted = false;
                Ok(Some(id))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Ids still queued
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// True once a refill came back empty, until the next refill finds work
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Record store scans performed so far
    pub fn scans(&self) -> u64 {
        self.scans
    }
}

impl Default for ReconciliationCursor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CellError;
    use crate::records::ResourceRecord;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Store that always lists the same ids and counts scans
    struct FixedStore {
        ids: Vec<ResourceId>,
        queries: Mutex<Vec<SyncQuery>>,
    }

    impl FixedStore {
        fn new(ids: Vec<ResourceId>) -> Self {
            Self {
                ids,
                queries: Mutex::new(Vec::new()),
            }
        }

        fn scans(&self) -> usize {
            self.queries.lock().len()
        }
    }

    #[async_trait]
    impl RecordStore for FixedStore {
        async fn list_resources_needing_sync(&self, query: &SyncQuery) -> Result<Vec<ResourceId>> {
            self.queries.lock().push(query.clone());
            Ok(self.ids.clone())
        }

        async fn get_resource(&self, id: &ResourceId) -> Result<ResourceRecord> {
            Err(CellError::ResourceNotFound(*id))
        }
    }

    #[tokio::test]
    async fn test_starts_exhausted() {
        let cursor = ReconciliationCursor::new();
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.pending(), 0);
    }

    #[tokio::test]
    async fn test_drains_each_id_once() {
        let ids = vec![ResourceId::new(), ResourceId::new(), ResourceId::new()];
        let store = FixedStore::new(ids.clone());
        let mut cursor = ReconciliationCursor::new();

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let id = cursor.next(&store, None).await.unwrap().unwrap();
            assert!(seen.insert(id));
        }
        assert_eq!(seen, ids.into_iter().collect());

        assert!(cursor.next(&store, None).await.unwrap().is_none());
        assert!(store.scans() <= 2);
        assert!(cursor.is_exhausted());
    }

    #[tokio::test]
    async fn test_one_scan_per_tick_when_empty() {
        let store = FixedStore::new(vec![]);
        let mut cursor = ReconciliationCursor::new();

        for _ in 0..5 {
            assert!(cursor.next(&store, None).await.unwrap().is_none());
        }
        assert_eq!(store.scans(), 1);

        cursor.begin_tick();
        assert!(cursor.next(&store, None).await.unwrap().is_none());
        assert_eq!(store.scans(), 2);
        assert_eq!(cursor.scans(), 2);
    }

    #[tokio::test]
    async fn test_pending_survives_tick_boundary() {
        let ids = vec![ResourceId::new(), ResourceId::new()];
        let store = FixedStore::new(ids);
        let mut cursor = ReconciliationCursor::new();

        cursor.next(&store, None).await.unwrap();
        cursor.begin_tick();
        assert!(cursor.next(&store, None).await.unwrap().is_some());
        assert_eq!(store.scans(), 1);
        assert_eq!(cursor.pending(), 0);
    }

    #[tokio::test]
    async fn test_refill_query_is_shuffled_with_threshold() {
        let store = FixedStore::new(vec![]);
        let mut cursor = ReconciliationCursor::new();
        let since = Utc::now();

        cursor.next(&store, Some(since)).await.unwrap();

        let query = store.queries.lock()[0].clone();
        assert!(query.shuffle);
        assert!(query.include_deleted);
        assert_eq!(query.updated_since, Some(since));
    }
}
