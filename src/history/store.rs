use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{RunRecord, TimelineEvent};

/// Durable storage for run records and their timeline events.
///
/// A read issued after a write has returned must observe that write.
#[async_trait]
pub trait HistoryStore: Send + Sync + std::fmt::Debug {
    // =========================================================================
    // Run Records
    // =========================================================================

    async fn create_run(&self, record: &RunRecord) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>>;

    /// Replace a stored record with `record` (matched by id).
    async fn update_run(&self, record: &RunRecord) -> Result<()>;

    /// Records for one agent, or all records, ordered by start time.
    async fn list_runs(&self, agent_id: Option<&str>) -> Result<Vec<RunRecord>>;

    /// Delete a record and its events.
    async fn delete_run(&self, id: &str) -> Result<()>;

    async fn count_runs(&self) -> Result<usize>;

    // =========================================================================
    // Timeline Events
    // =========================================================================

    async fn append_event(&self, run_id: &str, event: &TimelineEvent) -> Result<()>;

    /// Events of one run in append order.
    async fn list_events(&self, run_id: &str) -> Result<Vec<TimelineEvent>>;
}
