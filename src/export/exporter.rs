//! Fire-and-forget export of history writes.

use std::sync::Arc;

use tracing::warn;

use super::backend::{EventExport, RunExport, RunPatchExport, TelemetryBackend};
use super::queue::{ExportQueue, QueueTask};
use crate::error::QueueError;

/// Turns history writes into retrying queue tasks against a backend.
///
/// None of the `export_*` methods wait for the backend; failures end up in
/// the queue's logs and counters.
#[derive(Clone, Debug)]
pub struct TelemetryExporter {
    backend: Arc<dyn TelemetryBackend>,
    queue: ExportQueue,
}

impl TelemetryExporter {
    pub fn new(backend: Arc<dyn TelemetryBackend>, queue: ExportQueue) -> Self {
        Self { backend, queue }
    }

    pub fn queue(&self) -> &ExportQueue {
        &self.queue
    }

    pub fn export_run(&self, payload: RunExport) {
        let backend = Arc::clone(&self.backend);
        let payload = Arc::new(payload);
        let task_id = format!("run:{}", payload.record.id);
        self.submit(
            QueueTask::new(move || {
                let backend = Arc::clone(&backend);
                let payload = Arc::clone(&payload);
                async move { backend.export_run(&payload).await.map_err(QueueError::from) }
            })
            .with_id(task_id),
        );
    }

    pub fn export_event(&self, payload: EventExport) {
        let backend = Arc::clone(&self.backend);
        let payload = Arc::new(payload);
        let task_id = format!("event:{}", payload.event.id);
        self.submit(
            QueueTask::new(move || {
                let backend = Arc::clone(&backend);
                let payload = Arc::clone(&payload);
                async move { backend.export_event(&payload).await.map_err(QueueError::from) }
            })
            .with_id(task_id),
        );
    }

    pub fn export_run_patch(&self, payload: RunPatchExport) {
        let backend = Arc::clone(&self.backend);
        let payload = Arc::new(payload);
        let task_id = format!("patch:{}", payload.run_id);
        self.submit(
            QueueTask::new(move || {
                let backend = Arc::clone(&backend);
                let payload = Arc::clone(&payload);
                async move {
                    backend
                        .export_run_patch(&payload)
                        .await
                        .map_err(QueueError::from)
                }
            })
            .with_id(task_id),
        );
    }

    fn submit(&self, task: QueueTask) {
        let task_id = task.id.clone();
        if let Err(e) = self.queue.enqueue(task) {
            warn!(task_id = %task_id, error = %e, "Dropping telemetry export");
        }
    }

    /// Wait for every admitted export to finish.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }
}
