//! Telemetry backend contract and export payloads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{RunPatch, RunRecord, TimelineEvent};
use crate::error::ExportError;

/// A newly created run record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunExport {
    pub agent_id: String,
    pub record: RunRecord,
}

/// A timeline event appended to a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventExport {
    pub agent_id: String,
    pub run_id: String,
    pub event: TimelineEvent,
}

/// The changed fields of a run record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunPatchExport {
    pub agent_id: String,
    pub run_id: String,
    pub patch: RunPatch,
}

/// Remote telemetry destination.
///
/// Calls may be retried by the export queue, so implementations should be
/// safe to invoke more than once with the same payload.
#[async_trait]
pub trait TelemetryBackend: Send + Sync + std::fmt::Debug {
    async fn export_run(&self, payload: &RunExport) -> Result<(), ExportError>;

    async fn export_event(&self, payload: &EventExport) -> Result<(), ExportError>;

    async fn export_run_patch(&self, payload: &RunPatchExport) -> Result<(), ExportError>;
}
