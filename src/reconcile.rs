//! Periodic re-publication of locally-owned resources to parent cells
//!
//! Each tick pulls up to `instance_update_num_instances` ids from the
//! [`ReconciliationCursor`], loads each record and broadcasts either an
//! update-at-top or a destroy-at-top upward. Re-publishing is idempotent, so
//! replicas running the same engine against one record store may overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::cursor::ReconciliationCursor;
use crate::message::{CellMessage, Direction};
use crate::records::{RecordStore, ResourceRecord};
use crate::router::Router;
use crate::topology::TopologyStore;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// No parent cells, nothing was attempted
    pub skipped: bool,
    /// Records published as updates
    pub updated: usize,
    /// Records published as destroys
    pub destroyed: usize,
    /// Ids that vanished between listing and lookup
    pub vanished: usize,
    /// Publishes whose send failed
    pub failed_sends: usize,
}

impl TickReport {
    /// Records published, successfully or not
    pub fn processed(&self) -> usize {
        self.updated + self.destroyed
    }
}

/// Publish one record upward as an update or a destroy
pub async fn sync_resource(router: &Router, record: ResourceRecord) -> bool {
    let message = if record.deleted {
        CellMessage::InstanceDestroyAtTop { instance: record }
    } else {
        CellMessage::InstanceUpdateAtTop { instance: record }
    };
    router.cast_broadcast(None, Direction::Up, message).await
}

/// Owns the cursor and drives reconciliation ticks
pub struct ReconciliationEngine {
    cursor: ReconciliationCursor,
    records: Arc<dyn RecordStore>,
    topology: Arc<dyn TopologyStore>,
    router: Router,
    /// Staleness window; `None` re-publishes everything
    threshold: Option<Duration>,
    /// Max records per tick
    batch: usize,
}

impl ReconciliationEngine {
    pub fn new(
        records: Arc<dyn RecordStore>,
        topology: Arc<dyn TopologyStore>,
        router: Router,
        threshold: Option<Duration>,
        batch: usize,
    ) -> Self {
        Self {
            cursor: ReconciliationCursor::new(),
            records,
            topology,
            router,
            threshold,
            batch,
        }
    }

    pub fn cursor(&self) -> &ReconciliationCursor {
        &self.cursor
    }

    fn updated_since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let threshold = chrono::Duration::from_std(self.threshold?).ok()?;
        now.checked_sub_signed(threshold)
    }

    /// Run one reconciliation tick
    #[instrument(skip(self), fields(cell = %self.topology.my_cell_path()))]
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if self.topology.parent_cells().is_empty() {
            debug!("No parent cells, skipping reconciliation");
            report.skipped = true;
            return report;
        }

        self.cursor.begin_tick();
        let updated_since = self.updated_since(Utc::now());

        'slots: for _ in 0..self.batch {
            loop {
                tokio::task::yield_now().await;

                let id = match self.cursor.next(self.records.as_ref(), updated_since).await {
                    Ok(Some(id)) => id,
                    Ok(None) => break 'slots,
                    Err(e) => {
                        warn!(error = %e, "Listing resources to reconcile failed");
                        break 'slots;
                    }
                };

                let record = match self.records.get_resource(&id).await {
                    Ok(record) => record,
                    Err(e) if e.is_not_found() => {
                        debug!(resource = %id, "Resource vanished before reconciliation");
                        report.vanished += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(resource = %id, error = %e, "Loading resource failed");
                        break 'slots;
                    }
                };

                let deleted = record.deleted;
                if !sync_resource(&self.router, record).await {
                    report.failed_sends += 1;
                }
                if deleted {
                    report.destroyed += 1;
                } else {
                    report.updated += 1;
                }
                break;
            }
        }

        debug!(
            updated = report.updated,
            destroyed = report.destroyed,
            vanished = report.vanished,
            "Reconciliation tick finished"
        );
        report
    }

    /// Tick every `period` until `shutdown` flips to true.
    ///
    /// The engine is shared so on-demand ticks can run between periodic ones;
    /// the lock keeps them from interleaving on the cursor.
    pub async fn run(engine: Arc<Mutex<Self>>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_secs = period.as_secs(), "Starting reconciliation loop");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    engine.lock().await.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation loop stopped");
    }
}
