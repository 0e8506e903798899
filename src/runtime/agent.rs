//! Agent driver.
//!
//! An [`Agent`] runs a bounded tool loop against its model provider. Each
//! run gets its own [`OperationContext`]; streaming runs go through a
//! [`StreamMergeEngine`] so delegated sub-agents can surface their tool
//! activity on the caller's stream.
//!
//! Loop per step:
//! 1. Send the conversation and tool specs to the model.
//! 2. Stream text deltas and tool calls out as they arrive.
//! 3. If the turn asked for tools, execute them in order, emit results and
//!    feed them back; otherwise the run is done.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, instrument, warn};
use uuid::Uuid;

use super::Runtime;
use super::context::{ContextInit, OperationContext, RunOutcome, UserContext};
use super::delegation::SubAgentManager;
use super::emitter::{EventBus, ParentLink};
use super::hooks::{AgentHooks, StepSummary};
use super::merge::{MergedStream, StreamMergeEngine};
use super::model::{ModelChunk, ModelMessage, ModelProvider, ModelRequest, ToolCallRequest};
use super::stream::{FinishReason, MergedEvent, StreamPart};
use super::tools::{Tool, ToolContext, ToolRegistry, ToolSpec};
use crate::config::StreamConfig;
use crate::domain::{Step, StepLog, Usage};
use crate::error::{AgentError, ModelError, ToolError};

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Seed values for the run's user context.
    pub user_context: HashMap<String, Value>,
    /// Cancels the run when triggered.
    pub cancel: Option<CancellationToken>,
    /// Overrides the agent's step budget.
    pub max_steps: Option<usize>,
    delegation: Option<Delegation>,
}

#[derive(Debug, Clone)]
struct Delegation {
    link: Arc<ParentLink>,
    step_log: StepLog,
    user_context: UserContext,
    cancel: CancellationToken,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.user_context.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Options for a run delegated from `parent`: it shares the parent's step
    /// log and user context and is cancelled with the parent.
    pub fn delegated_from(parent: &OperationContext) -> Self {
        Self {
            delegation: Some(Delegation {
                link: Arc::new(parent.link_for_child()),
                step_log: parent.step_log().clone(),
                user_context: parent.shared_user_context(),
                cancel: parent.cancellation_token().child_token(),
            }),
            ..Self::default()
        }
    }
}

/// Result of [`Agent::generate_text`].
#[derive(Debug, Clone, Serialize)]
pub struct GenerateResult {
    pub run_id: String,
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    /// Steps attributed to this run.
    pub steps: Vec<Step>,
}

/// A streaming run. Dropping it before the end aborts the run.
#[derive(Debug)]
pub struct AgentStream {
    context: Arc<OperationContext>,
    inner: MergedStream,
}

impl AgentStream {
    pub fn run_id(&self) -> &str {
        self.context.id()
    }

    pub fn context(&self) -> &Arc<OperationContext> {
        &self.context
    }

    /// Cancel the run. Delegated runs are cancelled with it.
    pub fn cancel(&self) {
        self.context.cancel();
    }
}

impl Stream for AgentStream {
    type Item = MergedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Aborts the run if the primary stream is dropped before a terminal
/// transition.
struct RunGuard {
    ctx: Arc<OperationContext>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.ctx.is_active() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ctx = Arc::clone(&self.ctx);
                handle.spawn(async move {
                    ctx.abort("stream dropped before completion").await;
                });
            }
            Err(_) => {
                warn!(run_id = %self.ctx.id(), "Run abandoned outside a runtime, cannot finalize");
            }
        }
    }
}

enum Turn {
    Chunk(Option<Result<ModelChunk, ModelError>>),
    Cancelled,
}

#[derive(Debug)]
pub struct Agent {
    id: String,
    name: String,
    description: String,
    instructions: String,
    model: Arc<dyn ModelProvider>,
    tools: ToolRegistry,
    hooks: AgentHooks,
    sub_agents: SubAgentManager,
    max_steps: usize,
    stream_config: StreamConfig,
    events: Arc<EventBus>,
}

impl Agent {
    pub fn builder(name: impl Into<String>, model: Arc<dyn ModelProvider>) -> AgentBuilder {
        AgentBuilder::new(name, model)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools.specs()
    }

    pub fn sub_agents(&self) -> &SubAgentManager {
        &self.sub_agents
    }

    /// Start a streaming run.
    ///
    /// # Errors
    ///
    /// Returns an error if the run record cannot be created.
    #[instrument(skip_all, fields(agent = %self.name))]
    pub async fn stream_text(
        self: &Arc<Self>,
        input: impl Into<String>,
        options: RunOptions,
    ) -> Result<AgentStream, AgentError> {
        let input = input.into();
        let max_steps = options.max_steps.unwrap_or(self.max_steps);
        let ctx = self.begin(&input, options).await?;

        let engine = StreamMergeEngine::new(self.stream_config.clone());
        ctx.install_forwarder(engine.forwarder());
        let primary = Arc::clone(self).drive(Arc::clone(&ctx), input, max_steps);

        Ok(AgentStream {
            context: ctx,
            inner: engine.merge(primary),
        })
    }

    /// Run to completion and collect the result.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Model`] when the model fails and
    /// [`AgentError::Aborted`] when the run is cancelled.
    #[instrument(skip_all, fields(agent = %self.name))]
    pub async fn generate_text(
        self: &Arc<Self>,
        input: impl Into<String>,
        options: RunOptions,
    ) -> Result<GenerateResult, AgentError> {
        let input = input.into();
        let max_steps = options.max_steps.unwrap_or(self.max_steps);
        let ctx = self.begin(&input, options).await?;

        let stream = Arc::clone(self).drive(Arc::clone(&ctx), input, max_steps);
        futures::pin_mut!(stream);

        let mut result = GenerateResult {
            run_id: ctx.id().to_string(),
            text: String::new(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            steps: Vec::new(),
        };
        while let Some(part) = stream.next().await {
            if let StreamPart::Finish {
                reason,
                text,
                usage,
            } = part
            {
                result.text = text;
                result.usage = usage;
                result.finish_reason = reason;
            }
        }

        match ctx.outcome() {
            Some(RunOutcome::Completed { .. }) => {
                result.steps = ctx.steps();
                Ok(result)
            }
            Some(RunOutcome::Failed { error }) => Err(AgentError::Model(error)),
            Some(RunOutcome::Aborted { reason }) => Err(AgentError::Aborted(reason)),
            None => Err(AgentError::Aborted("run ended without a terminal state".into())),
        }
    }

    async fn begin(&self, input: &str, options: RunOptions) -> Result<Arc<OperationContext>, AgentError> {
        let init = match options.delegation {
            Some(delegation) => {
                for (key, value) in options.user_context {
                    delegation.user_context.set(key, value);
                }
                ContextInit {
                    agent_id: self.id.clone(),
                    agent_name: self.name.clone(),
                    input: json!(input),
                    user_context: delegation.user_context,
                    parent: Some(delegation.link),
                    step_log: delegation.step_log,
                    cancel: delegation.cancel,
                }
            }
            None => ContextInit {
                agent_id: self.id.clone(),
                agent_name: self.name.clone(),
                input: json!(input),
                user_context: UserContext::from_map(options.user_context),
                parent: None,
                step_log: StepLog::new(),
                cancel: options.cancel.unwrap_or_default(),
            },
        };

        let ctx = OperationContext::create(Arc::clone(&self.events), init).await?;
        ctx.start(json!({ "input": input })).await;

        if let Some(parent) = ctx.parent() {
            self.hooks.handoff(&ctx, &parent.parent_agent_name);
        }
        self.hooks.start(&ctx);
        Ok(ctx)
    }

    fn drive(
        self: Arc<Self>,
        ctx: Arc<OperationContext>,
        input: String,
        max_steps: usize,
    ) -> impl Stream<Item = StreamPart> + Send + 'static {
        async_stream::stream! {
            let _guard = RunGuard { ctx: Arc::clone(&ctx) };
            let cancel = ctx.cancellation_token();
            let specs = self.tools.specs();

            let mut messages = Vec::new();
            if !self.instructions.is_empty() {
                messages.push(ModelMessage::system(self.instructions.clone()));
            }
            messages.push(ModelMessage::user(input));

            let mut usage = Usage::default();
            let mut text = String::new();
            let mut reason = FinishReason::MaxSteps;

            'steps: for index in 0..max_steps {
                text.clear();
                let request = ModelRequest {
                    messages: messages.clone(),
                    tools: specs.clone(),
                };
                debug!(run_id = %ctx.id(), step = index, "Requesting model turn");

                let opened = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    result = self.model.stream(request, cancel.clone()) => Some(result),
                };
                let mut chunks = match opened {
                    None => {
                        reason = FinishReason::Aborted;
                        break 'steps;
                    }
                    Some(Err(error)) => {
                        self.fail(&ctx, &error).await;
                        yield StreamPart::Error { message: error.to_string(), code: Some("model_error".into()) };
                        return;
                    }
                    Some(Ok(chunks)) => chunks,
                };

                let mut calls: Vec<ToolCallRequest> = Vec::new();
                let mut step_usage = None;
                loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => Turn::Cancelled,
                        chunk = chunks.next() => Turn::Chunk(chunk),
                    };
                    match next {
                        Turn::Cancelled => {
                            reason = FinishReason::Aborted;
                            break 'steps;
                        }
                        Turn::Chunk(None) => break,
                        Turn::Chunk(Some(Err(error))) => {
                            self.fail(&ctx, &error).await;
                            yield StreamPart::Error { message: error.to_string(), code: Some("model_error".into()) };
                            return;
                        }
                        Turn::Chunk(Some(Ok(ModelChunk::TextDelta(delta)))) => {
                            text.push_str(&delta);
                            yield StreamPart::TextDelta { text: delta };
                        }
                        Turn::Chunk(Some(Ok(ModelChunk::ToolCall(call)))) => {
                            ctx.record_step(Step::tool_call(ctx.id(), &call.id, &call.name, call.arguments.clone()));
                            yield StreamPart::ToolCall {
                                tool_call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                args: call.arguments.clone(),
                            };
                            calls.push(call);
                        }
                        Turn::Chunk(Some(Ok(ModelChunk::Finish { usage: turn_usage }))) => {
                            if let Some(turn_usage) = turn_usage {
                                usage += turn_usage;
                                step_usage = Some(turn_usage);
                            }
                        }
                    }
                }

                if !text.is_empty() {
                    ctx.record_step(Step::text(ctx.id(), text.clone()));
                }
                self.hooks.step(&ctx, &StepSummary {
                    index,
                    text: text.clone(),
                    tool_calls: calls.len(),
                    usage: step_usage,
                });

                if calls.is_empty() {
                    reason = FinishReason::Stop;
                    break;
                }

                messages.push(ModelMessage::assistant(text.clone(), calls.clone()));
                for call in calls {
                    let result = self.execute_tool(&ctx, &call).await;
                    let is_error = result.is_err();
                    let value = result.unwrap_or_else(|e| json!({ "error": e.to_string() }));

                    ctx.record_step(Step::tool_result(ctx.id(), &call.id, &call.name, value.clone()));
                    messages.push(ModelMessage::tool(call.id.clone(), value.to_string()));
                    yield StreamPart::ToolResult {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        result: value,
                        is_error,
                    };
                }

                if cancel.is_cancelled() {
                    reason = FinishReason::Aborted;
                    break;
                }
            }

            if reason == FinishReason::Aborted || cancel.is_cancelled() {
                if ctx.abort("cancelled").await {
                    self.notify_end(&ctx);
                }
                yield StreamPart::Finish { reason: FinishReason::Aborted, text, usage };
                return;
            }

            if reason == FinishReason::MaxSteps {
                warn!(run_id = %ctx.id(), max_steps, "Step budget exhausted");
            }
            if ctx.complete(&text, Some(usage)).await {
                self.notify_end(&ctx);
            }
            yield StreamPart::Finish { reason, text, usage };
        }
    }

    async fn execute_tool(
        &self,
        ctx: &Arc<OperationContext>,
        call: &ToolCallRequest,
    ) -> Result<Value, ToolError> {
        ctx.tool_start(&call.id, &call.name, &call.arguments).await;
        self.hooks.tool_start(ctx, &call.name, &call.arguments);

        let result = match self.tools.get(&call.name) {
            None => Err(ToolError::NotFound(call.name.clone())),
            Some(tool) => {
                let tool_ctx = ToolContext {
                    operation: Arc::clone(ctx),
                    tool_call_id: call.id.clone(),
                };
                let span = ctx.tool_span(&call.id).unwrap_or_else(tracing::Span::none);
                let cancel = ctx.cancellation_token();
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ToolError::Cancelled),
                    result = tool.execute(call.arguments.clone(), &tool_ctx).instrument(span) => result,
                }
            }
        };

        match &result {
            Ok(output) => {
                ctx.tool_success(&call.id, output.clone()).await;
            }
            Err(e) => {
                warn!(run_id = %ctx.id(), tool = %call.name, error = %e, "Tool call failed");
                ctx.tool_error(&call.id, &e.to_string()).await;
            }
        }
        self.hooks.tool_end(ctx, &call.name, &result);
        result
    }

    async fn fail(&self, ctx: &OperationContext, error: &ModelError) {
        if ctx.fail(error).await {
            self.notify_end(ctx);
        }
    }

    fn notify_end(&self, ctx: &OperationContext) {
        if let Some(outcome) = ctx.outcome() {
            self.hooks.end(ctx, &outcome);
        }
    }
}

/// Builds an [`Agent`] bound to a [`Runtime`].
#[derive(Debug)]
pub struct AgentBuilder {
    id: Option<String>,
    name: String,
    description: String,
    instructions: String,
    model: Arc<dyn ModelProvider>,
    tools: Vec<Arc<dyn Tool>>,
    sub_agents: Vec<Arc<Agent>>,
    hooks: AgentHooks,
    max_steps: Option<usize>,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>, model: Arc<dyn ModelProvider>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            model,
            tools: Vec::new(),
            sub_agents: Vec::new(),
            hooks: AgentHooks::default(),
            max_steps: None,
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn sub_agent(mut self, agent: Arc<Agent>) -> Self {
        self.sub_agents.push(agent);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: AgentHooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn build(self, runtime: &Runtime) -> Arc<Agent> {
        let mut tools = ToolRegistry::new();
        for tool in self.tools {
            tools.register(tool);
        }

        let sub_agents = SubAgentManager::new(self.sub_agents);
        if !sub_agents.is_empty() {
            tools.register(Arc::new(sub_agents.delegate_tool()));
        }

        Arc::new(Agent {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            description: self.description,
            instructions: self.instructions,
            model: self.model,
            tools,
            hooks: self.hooks,
            sub_agents,
            max_steps: self
                .max_steps
                .unwrap_or(runtime.config().agent.max_steps)
                .max(1),
            stream_config: runtime.config().stream.clone(),
            events: Arc::clone(runtime.events()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::domain::{EntityKind, RunStatus};
    use crate::runtime::model::{ScriptedModel, ScriptedTurn};
    use crate::runtime::tools::FunctionTool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runtime() -> Runtime {
        let mut config = RuntimeConfig::default();
        config.stream.grace_window_ms = 0;
        Runtime::new(config).unwrap()
    }

    fn add_tool() -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            "add",
            "Add two numbers",
            json!({"type": "object"}),
            |args, _ctx| async move {
                let a = args["a"].as_i64().unwrap_or_default();
                let b = args["b"].as_i64().unwrap_or_default();
                Ok(json!(a + b))
            },
        ))
    }

    #[tokio::test]
    async fn test_generate_runs_tool_loop() {
        let runtime = runtime();
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool_call("call-1", "add", json!({"a": 2, "b": 3})),
            ScriptedTurn::text("The answer is 5"),
        ]));
        let agent = Agent::builder("math", model.clone())
            .instructions("Be precise")
            .tool(add_tool())
            .build(&runtime);

        let result = agent.generate_text("2 + 3?", RunOptions::new()).await.unwrap();
        assert_eq!(result.text, "The answer is 5");
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.steps.len(), 3);

        // The tool result went back to the model.
        let second = &model.requests()[1];
        let tool_message = second.messages.last().unwrap();
        assert_eq!(tool_message.content, "5");

        let record = runtime.history().get_entry(&result.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_model_error_fails_run() {
        let runtime = runtime();
        let model = Arc::new(ScriptedModel::new([ScriptedTurn::Reject(ModelError::Provider(
            "rate limited".into(),
        ))]));
        let agent = Agent::builder("flaky", model).build(&runtime);

        let err = agent.generate_text("hi", RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Model(ModelError::Provider(_))));

        let records = runtime.history().list_entries(None).await.unwrap();
        assert_eq!(records[0].status, RunStatus::Error);
        let events = runtime.history().events(&records[0].id).await.unwrap();
        assert_eq!(events.last().unwrap().name, "agent:error");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_and_loop_continues() {
        let runtime = runtime();
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool_call("call-1", "missing", json!({})),
            ScriptedTurn::text("recovered"),
        ]));
        let agent = Agent::builder("careful", model).build(&runtime);

        let result = agent.generate_text("go", RunOptions::new()).await.unwrap();
        assert_eq!(result.text, "recovered");

        let events = runtime.history().events(&result.run_id).await.unwrap();
        let tool_error = events.iter().find(|e| e.name == "tool:error").unwrap();
        let tool_start = events.iter().find(|e| e.name == "tool:start").unwrap();
        assert_eq!(tool_error.parent_event_id.as_deref(), Some(tool_start.id.as_str()));
    }

    #[tokio::test]
    async fn test_step_budget_is_enforced() {
        let runtime = runtime();
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool_call("call-1", "add", json!({"a": 1, "b": 1})),
            ScriptedTurn::tool_call("call-2", "add", json!({"a": 1, "b": 1})),
            ScriptedTurn::text("never reached"),
        ]));
        let agent = Agent::builder("looper", model)
            .tool(add_tool())
            .max_steps(2)
            .build(&runtime);

        let result = agent.generate_text("loop", RunOptions::new()).await.unwrap();
        assert_eq!(result.finish_reason, FinishReason::MaxSteps);
    }

    #[tokio::test]
    async fn test_hooks_fire() {
        let runtime = runtime();
        let starts = Arc::new(AtomicUsize::new(0));
        let ends = Arc::new(AtomicUsize::new(0));
        let tools = Arc::new(AtomicUsize::new(0));
        let tool_starts = Arc::new(AtomicUsize::new(0));
        let steps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let hooks = AgentHooks::new()
            .on_start({
                let starts = Arc::clone(&starts);
                move |_| {
                    starts.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_end({
                let ends = Arc::clone(&ends);
                move |_, outcome| {
                    assert!(matches!(outcome, RunOutcome::Completed { .. }));
                    ends.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_tool_end({
                let tools = Arc::clone(&tools);
                move |_, name, result| {
                    assert_eq!(name, "add");
                    assert!(result.is_ok());
                    tools.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_tool_start({
                let tool_starts = Arc::clone(&tool_starts);
                move |_, name, args| {
                    assert_eq!(name, "add");
                    assert_eq!(args["b"], 2);
                    tool_starts.fetch_add(1, Ordering::SeqCst);
                }
            })
            .on_step({
                let steps = Arc::clone(&steps);
                move |_, summary| {
                    steps
                        .lock()
                        .unwrap()
                        .push((summary.index, summary.tool_calls, summary.text.clone()));
                }
            });
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool_call("call-1", "add", json!({"a": 1, "b": 2})),
            ScriptedTurn::text("3"),
        ]));
        let agent = Agent::builder("hooked", model)
            .tool(add_tool())
            .hooks(hooks)
            .build(&runtime);

        agent.generate_text("1 + 2", RunOptions::new()).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(tools.load(Ordering::SeqCst), 1);
        assert_eq!(tool_starts.load(Ordering::SeqCst), 1);
        let steps = steps.lock().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!((steps[0].0, steps[0].1), (0, 1));
        assert_eq!(steps[1], (1, 0, "3".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_aborts_generate() {
        let runtime = runtime();
        let model = Arc::new(
            ScriptedModel::new([ScriptedTurn::text("slow answer")])
                .with_chunk_delay(Duration::from_secs(60)),
        );
        let agent = Agent::builder("slow", model).build(&runtime);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = agent
            .generate_text("wait", RunOptions::new().with_cancel(cancel))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Aborted(_)));

        let records = runtime.history().list_entries(None).await.unwrap();
        assert_eq!(records[0].status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_stream_text_emits_parts_in_order() {
        let runtime = runtime();
        let model = Arc::new(ScriptedModel::new([
            ScriptedTurn::tool_call("call-1", "add", json!({"a": 4, "b": 4})),
            ScriptedTurn::text("8"),
        ]));
        let agent = Agent::builder("streamer", model)
            .tool(add_tool())
            .build(&runtime);

        let stream = agent.stream_text("4 + 4", RunOptions::new()).await.unwrap();
        let run_id = stream.run_id().to_string();
        let parts: Vec<StreamPart> = stream.map(|e| e.part).collect().await;

        assert!(matches!(parts[0], StreamPart::ToolCall { .. }));
        assert!(matches!(parts[1], StreamPart::ToolResult { is_error: false, .. }));
        assert_eq!(parts[2], StreamPart::TextDelta { text: "8".into() });
        assert!(matches!(parts[3], StreamPart::Finish { reason: FinishReason::Stop, .. }));

        let events = runtime.history().events(&run_id).await.unwrap();
        let agent_events = events.iter().filter(|e| e.entity == EntityKind::Agent).count();
        assert_eq!(agent_events, 2);
    }
}
