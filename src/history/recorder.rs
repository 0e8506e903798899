//! Writes run history and mirrors it to telemetry.
//!
//! Every write lands in the store first and is awaited, so callers can read
//! their own writes immediately. Only then is the equivalent payload handed
//! to the exporter, which never blocks and never fails the write.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::store::HistoryStore;
use crate::config::HistoryConfig;
use crate::domain::{RunPatch, RunRecord, RunUpdate, Step, TimelineEvent};
use crate::error::HistoryError;
use crate::export::{EventExport, RunExport, RunPatchExport, TelemetryExporter};

#[derive(Debug)]
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
    exporter: Option<TelemetryExporter>,
    config: HistoryConfig,
    // Serializes read-modify-write cycles on records.
    write_lock: Mutex<()>,
}

impl HistoryRecorder {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        exporter: Option<TelemetryExporter>,
        config: HistoryConfig,
    ) -> Self {
        Self {
            store,
            exporter,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn exporter(&self) -> Option<&TelemetryExporter> {
        self.exporter.as_ref()
    }

    /// Create the record for a new run.
    #[instrument(skip_all, fields(run_id = %id, agent_id = %agent_id))]
    pub async fn create_entry(
        &self,
        id: &str,
        agent_id: &str,
        input: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<RunRecord, HistoryError> {
        let record = RunRecord::new(id, agent_id, input, metadata);
        self.store.create_run(&record).await?;
        debug!("Run record created");

        if let Some(exporter) = &self.exporter {
            exporter.export_run(RunExport {
                agent_id: agent_id.to_string(),
                record: record.clone(),
            });
        }

        self.enforce_retention(id).await;
        Ok(record)
    }

    /// Apply `update` and export only the fields that changed.
    pub async fn update_entry(
        &self,
        id: &str,
        update: RunUpdate,
    ) -> Result<RunRecord, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let before = self
            .store
            .get_run(id)
            .await?
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;

        let mut after = before.clone();
        after.apply(update);
        self.store.update_run(&after).await?;

        let patch = RunPatch::diff(&before, &after);
        if patch.is_empty() {
            debug!(run_id = %id, "Run update changed nothing exportable");
        } else if let Some(exporter) = &self.exporter {
            exporter.export_run_patch(RunPatchExport {
                agent_id: after.agent_id.clone(),
                run_id: id.to_string(),
                patch,
            });
        }
        Ok(after)
    }

    /// Append steps to a record. Steps are kept locally and not exported.
    pub async fn add_steps(&self, id: &str, steps: Vec<Step>) -> Result<RunRecord, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .store
            .get_run(id)
            .await?
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;
        record.steps.extend(steps);
        self.store.update_run(&record).await?;
        Ok(record)
    }

    /// Append a timeline event to a run's history.
    pub async fn add_event(
        &self,
        run_id: &str,
        agent_id: &str,
        event: &TimelineEvent,
    ) -> Result<(), HistoryError> {
        self.store.append_event(run_id, event).await?;

        if let Some(exporter) = &self.exporter {
            exporter.export_event(EventExport {
                agent_id: agent_id.to_string(),
                run_id: run_id.to_string(),
                event: event.clone(),
            });
        }
        Ok(())
    }

    pub async fn get_entry(&self, id: &str) -> Result<Option<RunRecord>, HistoryError> {
        Ok(self.store.get_run(id).await?)
    }

    pub async fn list_entries(&self, agent_id: Option<&str>) -> Result<Vec<RunRecord>, HistoryError> {
        Ok(self.store.list_runs(agent_id).await?)
    }

    pub async fn events(&self, run_id: &str) -> Result<Vec<TimelineEvent>, HistoryError> {
        Ok(self.store.list_events(run_id).await?)
    }

    /// Evict the oldest finished records once `max_entries` is exceeded.
    /// Records of runs still in flight are never evicted, so the bound may
    /// be exceeded until they finish.
    async fn enforce_retention(&self, keep_id: &str) {
        let max = self.config.max_entries;
        if max == 0 {
            return;
        }

        let _guard = self.write_lock.lock().await;
        let count = match self.store.count_runs().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Could not count run records for retention");
                return;
            }
        };
        if count <= max {
            return;
        }

        let runs = match self.store.list_runs(None).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "Could not list run records for retention");
                return;
            }
        };

        let excess = count - max;
        let mut evicted = 0;
        for record in runs
            .iter()
            .filter(|r| r.id != keep_id && r.status.is_terminal())
            .take(excess)
        {
            match self.store.delete_run(&record.id).await {
                Ok(()) => {
                    evicted += 1;
                    debug!(run_id = %record.id, "Evicted run record");
                }
                Err(e) => warn!(run_id = %record.id, error = %e, "Failed to evict run record"),
            }
        }
        if evicted < excess {
            debug!(
                count = count - evicted,
                max_entries = max,
                "Retention bound exceeded by runs still in flight"
            );
        }
    }
}
