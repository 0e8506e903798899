//! In-process history store.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::HistoryStore;
use crate::domain::{RunRecord, TimelineEvent};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<String, RunRecord>,
    events: HashMap<String, Vec<TimelineEvent>>,
}

/// Keeps every record in memory. Used by default and in tests.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_run(&self, record: &RunRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&record.id) {
            return Err(anyhow!("run record already exists: {}", record.id));
        }
        inner.runs.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        Ok(self.inner.read().await.runs.get(id).cloned())
    }

    async fn update_run(&self, record: &RunRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let slot = inner
            .runs
            .get_mut(&record.id)
            .ok_or_else(|| anyhow!("unknown run record: {}", record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn list_runs(&self, agent_id: Option<&str>) -> Result<Vec<RunRecord>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<RunRecord> = inner
            .runs
            .values()
            .filter(|r| agent_id.is_none_or(|id| r.agent_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn delete_run(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.runs.remove(id);
        inner.events.remove(id);
        Ok(())
    }

    async fn count_runs(&self) -> Result<usize> {
        Ok(self.inner.read().await.runs.len())
    }

    async fn append_event(&self, run_id: &str, event: &TimelineEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.runs.contains_key(run_id) {
            return Err(anyhow!("unknown run record: {run_id}"));
        }
        inner
            .events
            .entry(run_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_events(&self, run_id: &str) -> Result<Vec<TimelineEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
