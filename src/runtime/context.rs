//! Per-run operation context.
//!
//! One context exists per top-level or delegated run. It owns the run's
//! lifecycle flag, publishes the run's timeline events and keeps the tool
//! spans opened during the run.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::emitter::{EventBus, ParentLink, Publisher};
use super::merge::EventForwarder;
use crate::domain::{
    EntityKind, EventLevel, RunStatus, RunUpdate, Step, StepLog, TimelineEvent, Usage,
};
use crate::error::{HistoryError, ModelError};
use crate::history::HistoryRecorder;

/// Key/value state scoped to a run and shared with its delegates.
///
/// Clones share the same map. Callers outside the run get a snapshot.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl UserContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: HashMap<String, Value>) -> Self {
        Self {
            values: Arc::new(Mutex::new(values)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed { output: String },
    Failed { error: ModelError },
    Aborted { reason: String },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed { .. } => RunStatus::Completed,
            Self::Failed { .. } => RunStatus::Error,
            Self::Aborted { .. } => RunStatus::Aborted,
        }
    }
}

#[derive(Debug)]
struct ToolSpan {
    span: tracing::Span,
    tool_name: String,
    start_event_id: String,
}

/// Everything needed to create a context.
#[derive(Debug, Clone)]
pub struct ContextInit {
    pub agent_id: String,
    pub agent_name: String,
    pub input: Value,
    pub user_context: UserContext,
    pub parent: Option<Arc<ParentLink>>,
    pub step_log: StepLog,
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub struct OperationContext {
    id: String,
    agent_id: String,
    agent_name: String,
    user_context: UserContext,
    parent: Option<Arc<ParentLink>>,
    is_active: AtomicBool,
    start_event_id: Mutex<Option<String>>,
    tool_spans: Mutex<HashMap<String, ToolSpan>>,
    open_retrievers: Mutex<HashSet<String>>,
    step_log: StepLog,
    cancel: CancellationToken,
    forwarder: Mutex<Option<EventForwarder>>,
    outcome: Mutex<Option<RunOutcome>>,
    events: Arc<EventBus>,
}

impl OperationContext {
    /// Create the context and its run record together.
    pub async fn create(events: Arc<EventBus>, init: ContextInit) -> Result<Arc<Self>, HistoryError> {
        let id = Uuid::new_v4().to_string();
        let metadata = json!({
            "agent_name": init.agent_name,
            "user_context": init.user_context.snapshot(),
            "parent_agent_id": init.parent.as_ref().map(|p| p.parent_agent_id.clone()),
            "parent_run_id": init.parent.as_ref().map(|p| p.parent_run_id.clone()),
        });
        events
            .history()
            .create_entry(&id, &init.agent_id, init.input, metadata)
            .await?;

        Ok(Arc::new(Self {
            id,
            agent_id: init.agent_id,
            agent_name: init.agent_name,
            user_context: init.user_context,
            parent: init.parent,
            is_active: AtomicBool::new(true),
            start_event_id: Mutex::new(None),
            tool_spans: Mutex::new(HashMap::new()),
            open_retrievers: Mutex::new(HashSet::new()),
            step_log: init.step_log,
            cancel: init.cancel,
            forwarder: Mutex::new(None),
            outcome: Mutex::new(None),
            events,
        }))
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn parent(&self) -> Option<&Arc<ParentLink>> {
        self.parent.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn history(&self) -> &Arc<HistoryRecorder> {
        self.events.history()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Link a delegated run would use to point back at this one.
    pub fn link_for_child(&self) -> ParentLink {
        ParentLink::new(
            &self.agent_id,
            &self.agent_name,
            &self.id,
            self.parent.clone(),
        )
    }

    // ========================================================================
    // Agent lifecycle
    // ========================================================================

    /// Publish `agent:start`. Returns its event id.
    pub async fn start(&self, input: Value) -> Option<String> {
        let event = TimelineEvent::start(EntityKind::Agent, &self.id, &self.agent_name, Some(input))
            .with_metadata_entry("agent_id", json!(self.agent_id));
        let event_id = event.id.clone();
        *self
            .start_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(event_id.clone());

        info!(run_id = %self.id, agent = %self.agent_name, "Run started");
        self.publish(event).await.then_some(event_id)
    }

    /// Finish successfully. Returns `false` if the run had already ended.
    pub async fn complete(&self, output: &str, usage: Option<Usage>) -> bool {
        if !self.deactivate() {
            return false;
        }
        info!(run_id = %self.id, agent = %self.agent_name, "Run completed");
        self.close_leftover_spans().await;

        if let Some(start_id) = self.start_id() {
            let event = TimelineEvent::success(
                EntityKind::Agent,
                &self.id,
                start_id,
                Some(json!({ "text": output })),
            );
            self.publish(event).await;
        }

        let mut update = RunUpdate::finished(RunStatus::Completed).with_output(output);
        if let Some(usage) = usage {
            update = update.with_usage(usage);
        }
        self.finish(
            RunOutcome::Completed {
                output: output.to_string(),
            },
            update,
        )
        .await;
        true
    }

    /// Finish with a model failure. Returns `false` if the run had already
    /// ended.
    pub async fn fail(&self, error: &ModelError) -> bool {
        if !self.deactivate() {
            return false;
        }
        warn!(run_id = %self.id, agent = %self.agent_name, error = %error, "Run failed");
        self.close_leftover_spans().await;

        if let Some(start_id) = self.start_id() {
            let event =
                TimelineEvent::error(EntityKind::Agent, &self.id, start_id, error.to_string());
            self.publish(event).await;
        }

        self.finish(
            RunOutcome::Failed {
                error: error.clone(),
            },
            RunUpdate::finished(RunStatus::Error),
        )
        .await;
        true
    }

    /// Finish because of cancellation. Cancels delegates as well.
    pub async fn abort(&self, reason: &str) -> bool {
        if !self.deactivate() {
            return false;
        }
        self.cancel.cancel();
        info!(run_id = %self.id, agent = %self.agent_name, reason, "Run aborted");
        self.close_leftover_spans().await;

        if let Some(start_id) = self.start_id() {
            let event = TimelineEvent::error(EntityKind::Agent, &self.id, start_id, reason)
                .with_level(EventLevel::Warning)
                .with_metadata_entry("aborted", json!(true));
            self.publish(event).await;
        }

        self.finish(
            RunOutcome::Aborted {
                reason: reason.to_string(),
            },
            RunUpdate::finished(RunStatus::Aborted),
        )
        .await;
        true
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ========================================================================
    // Tools
    // ========================================================================

    /// Open a span for a tool call and publish `tool:start`.
    ///
    /// A second start for an open call id is ignored with a warning.
    pub async fn tool_start(&self, tool_call_id: &str, tool_name: &str, args: &Value) -> Option<String> {
        let mut event =
            TimelineEvent::start(EntityKind::Tool, &self.id, tool_name, Some(args.clone()))
                .with_metadata_entry("tool_call_id", json!(tool_call_id));
        event.parent_event_id = self.start_id();
        let event_id = event.id.clone();

        {
            let mut spans = self.tool_spans.lock().unwrap_or_else(PoisonError::into_inner);
            if spans.contains_key(tool_call_id) {
                warn!(run_id = %self.id, tool_call_id, tool_name, "Tool span already open");
                return None;
            }
            let span = tracing::info_span!(
                "tool",
                run_id = %self.id,
                tool_call_id = %tool_call_id,
                tool_name = %tool_name,
                status = tracing::field::Empty,
            );
            spans.insert(
                tool_call_id.to_string(),
                ToolSpan {
                    span,
                    tool_name: tool_name.to_string(),
                    start_event_id: event_id.clone(),
                },
            );
        }

        debug!(run_id = %self.id, tool_call_id, tool_name, "Tool started");
        if self.publish(event).await {
            return Some(event_id);
        }
        // The start never reached history, so there is nothing to close.
        self.tool_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tool_call_id);
        None
    }

    /// The span opened for `tool_call_id`, for instrumenting its execution.
    pub fn tool_span(&self, tool_call_id: &str) -> Option<tracing::Span> {
        self.tool_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tool_call_id)
            .map(|open| open.span.clone())
    }

    pub async fn tool_success(&self, tool_call_id: &str, output: Value) -> Option<String> {
        let open = self.close_tool_span(tool_call_id, "success")?;
        let event = TimelineEvent::success(
            EntityKind::Tool,
            &self.id,
            open.start_event_id,
            Some(output),
        )
        .with_metadata_entry("tool_call_id", json!(tool_call_id))
        .with_metadata_entry("display_name", json!(open.tool_name));
        let event_id = event.id.clone();
        self.publish(event).await.then_some(event_id)
    }

    pub async fn tool_error(&self, tool_call_id: &str, error: &str) -> Option<String> {
        let open = self.close_tool_span(tool_call_id, "error")?;
        let event = TimelineEvent::error(EntityKind::Tool, &self.id, open.start_event_id, error)
            .with_metadata_entry("tool_call_id", json!(tool_call_id))
            .with_metadata_entry("display_name", json!(open.tool_name));
        let event_id = event.id.clone();
        self.publish(event).await.then_some(event_id)
    }

    pub fn open_tool_spans(&self) -> usize {
        self.tool_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn close_tool_span(&self, tool_call_id: &str, status: &str) -> Option<ToolSpan> {
        let open = self
            .tool_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(tool_call_id);
        match open {
            Some(open) => {
                open.span.record("status", status);
                Some(open)
            }
            None => {
                warn!(run_id = %self.id, tool_call_id, "Closing a tool span that is not open");
                None
            }
        }
    }

    // ========================================================================
    // Retrievers
    // ========================================================================

    pub async fn retriever_start(&self, name: &str, query: &Value) -> Option<String> {
        let mut event = TimelineEvent::start(EntityKind::Retriever, &self.id, name, Some(query.clone()));
        event.parent_event_id = self.start_id();
        let event_id = event.id.clone();
        self.open_retrievers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_id.clone());
        if self.publish(event).await {
            return Some(event_id);
        }
        self.open_retrievers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event_id);
        None
    }

    pub async fn retriever_success(&self, start_id: &str, output: Value) -> Option<String> {
        if !self.close_retriever(start_id) {
            return None;
        }
        let event = TimelineEvent::success(EntityKind::Retriever, &self.id, start_id, Some(output));
        let event_id = event.id.clone();
        self.publish(event).await.then_some(event_id)
    }

    pub async fn retriever_error(&self, start_id: &str, error: &str) -> Option<String> {
        if !self.close_retriever(start_id) {
            return None;
        }
        let event = TimelineEvent::error(EntityKind::Retriever, &self.id, start_id, error);
        let event_id = event.id.clone();
        self.publish(event).await.then_some(event_id)
    }

    fn close_retriever(&self, start_id: &str) -> bool {
        let removed = self
            .open_retrievers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(start_id);
        if !removed {
            warn!(run_id = %self.id, start_id, "Closing a retriever call that is not open");
        }
        removed
    }

    // ========================================================================
    // Steps and user context
    // ========================================================================

    /// Append a step to the shared log, tagged with this agent when the run
    /// is delegated.
    pub fn record_step(&self, step: Step) {
        let step = if self.parent.is_some() {
            step.from_sub_agent(&self.agent_id, &self.agent_name)
        } else {
            step
        };
        self.step_log.append(step);
    }

    /// Steps attributed to this run.
    pub fn steps(&self) -> Vec<Step> {
        self.step_log.steps_for(&self.id)
    }

    /// The shared log handle.
    pub fn step_log(&self) -> &StepLog {
        &self.step_log
    }

    /// Snapshot of the user context.
    pub fn user_context(&self) -> HashMap<String, Value> {
        self.user_context.snapshot()
    }

    /// The live user context handle, for pass-through to delegates.
    pub fn shared_user_context(&self) -> UserContext {
        self.user_context.clone()
    }

    pub fn set_context_value(&self, key: impl Into<String>, value: Value) {
        self.user_context.set(key, value);
    }

    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.user_context.get(key)
    }

    // ========================================================================
    // Cancellation and streaming
    // ========================================================================

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn install_forwarder(&self, forwarder: EventForwarder) {
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(forwarder);
    }

    pub fn forwarder(&self) -> Option<EventForwarder> {
        self.forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn deactivate(&self) -> bool {
        let flipped = self
            .is_active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !flipped {
            warn!(run_id = %self.id, "Run already finished, ignoring terminal transition");
        }
        flipped
    }

    fn start_id(&self) -> Option<String> {
        self.start_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publisher(&self) -> Publisher<'_> {
        Publisher {
            agent_id: &self.agent_id,
            agent_name: &self.agent_name,
            parent: self.parent.as_deref(),
        }
    }

    async fn publish(&self, event: TimelineEvent) -> bool {
        let name = event.name.clone();
        match self.events.publish(self.publisher(), event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %self.id, event = %name, error = %e, "Failed to publish event");
                false
            }
        }
    }

    async fn close_leftover_spans(&self) {
        let leftover: Vec<String> = self
            .tool_spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for tool_call_id in leftover {
            warn!(run_id = %self.id, %tool_call_id, "Tool span still open at run end");
            self.tool_error(&tool_call_id, "run ended before the tool finished")
                .await;
        }
    }

    async fn finish(&self, outcome: RunOutcome, update: RunUpdate) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.events.end_trace(&self.id);

        // The top-level run owns the whole log; delegates keep their own slice.
        let steps = if self.parent.is_some() {
            self.steps()
        } else {
            self.step_log.snapshot()
        };
        let history = self.events.history();
        if let Err(e) = history.add_steps(&self.id, steps).await {
            warn!(run_id = %self.id, error = %e, "Failed to store run steps");
        }
        if let Err(e) = history.update_entry(&self.id, update).await {
            warn!(run_id = %self.id, error = %e, "Failed to finalize run record");
        }
    }
}
