//! Agent runtime: operation contexts, the event bus, stream merging,
//! delegation and the agent driver.
//!
//! A [`Runtime`] holds the shared services every run writes through. Agents
//! are built against it and keep cheap handles to those services.

pub mod agent;
pub mod context;
pub mod delegation;
pub mod emitter;
pub mod hooks;
pub mod merge;
pub mod model;
pub mod stream;
pub mod tools;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

pub use agent::{Agent, AgentBuilder, AgentStream, GenerateResult, RunOptions};
pub use context::{OperationContext, RunOutcome, UserContext};
pub use delegation::{DELEGATE_TOOL_NAME, DelegationResult, DelegationStatus, SubAgentManager};
pub use emitter::{EventBus, ParentLink, PublishedEvent};
pub use hooks::{AgentHooks, StepSummary};
pub use merge::{EventForwarder, MergedStream, StreamMergeEngine};
pub use model::{ModelChunk, ModelMessage, ModelProvider, ModelRequest, ModelStream, ScriptedModel, ScriptedTurn};
pub use stream::{EventSource, FinishReason, MergedEvent, StreamPart, SubAgentEvent, SubAgentState};
pub use tools::{FunctionTool, Tool, ToolContext, ToolRegistry, ToolSpec};

use crate::config::RuntimeConfig;
use crate::error::ExportError;
use crate::export::{ExportQueue, HttpTelemetryBackend, TelemetryBackend, TelemetryExporter};
use crate::history::{HistoryRecorder, HistoryStore, InMemoryHistoryStore};

/// Shared services for every run.
#[derive(Debug, Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    history: Arc<HistoryRecorder>,
    events: Arc<EventBus>,
    exporter: Option<TelemetryExporter>,
}

impl Runtime {
    /// In-memory history, plus HTTP export when `exporter.base_url` is set.
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter base URL is invalid.
    pub fn new(config: RuntimeConfig) -> Result<Self, ExportError> {
        let backend: Option<Arc<dyn TelemetryBackend>> = match &config.exporter.base_url {
            Some(base_url) => Some(Arc::new(HttpTelemetryBackend::new(
                base_url,
                &config.exporter,
            )?)),
            None => None,
        };
        Ok(Self::with_store(
            config,
            Arc::new(InMemoryHistoryStore::new()),
            backend,
        ))
    }

    /// Assemble a runtime over an explicit store and optional backend.
    pub fn with_store(
        config: RuntimeConfig,
        store: Arc<dyn HistoryStore>,
        backend: Option<Arc<dyn TelemetryBackend>>,
    ) -> Self {
        let exporter = backend.map(|backend| {
            TelemetryExporter::new(backend, ExportQueue::new("telemetry", config.queue.clone()))
        });
        let history = Arc::new(HistoryRecorder::new(
            store,
            exporter.clone(),
            config.history.clone(),
        ));
        let events = Arc::new(EventBus::new(Arc::clone(&history)));

        info!(
            export_enabled = exporter.is_some(),
            max_concurrency = config.queue.max_concurrency,
            "Runtime initialized"
        );
        Self {
            config,
            history,
            events,
            exporter,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        &self.history
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn exporter(&self) -> Option<&TelemetryExporter> {
        self.exporter.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.events.subscribe()
    }

    /// Wait until every admitted export task has finished.
    pub async fn flush(&self) {
        if let Some(exporter) = &self.exporter {
            exporter.flush().await;
        }
    }
}
