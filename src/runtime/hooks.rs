//! Optional lifecycle callbacks for an agent.
//!
//! Every callback is synchronous and invoked only when set. Hooks observe;
//! they cannot change what the run does.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::context::{OperationContext, RunOutcome};
use crate::domain::Usage;
use crate::error::ToolError;

/// Summary of one finished model turn.
#[derive(Debug, Clone)]
pub struct StepSummary {
    pub index: usize,
    pub text: String,
    pub tool_calls: usize,
    pub usage: Option<Usage>,
}

type StartHook = Arc<dyn Fn(&OperationContext) + Send + Sync>;
type EndHook = Arc<dyn Fn(&OperationContext, &RunOutcome) + Send + Sync>;
type ToolStartHook = Arc<dyn Fn(&OperationContext, &str, &Value) + Send + Sync>;
type ToolEndHook = Arc<dyn Fn(&OperationContext, &str, &Result<Value, ToolError>) + Send + Sync>;
type StepHook = Arc<dyn Fn(&OperationContext, &StepSummary) + Send + Sync>;
type HandoffHook = Arc<dyn Fn(&OperationContext, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct AgentHooks {
    on_start: Option<StartHook>,
    on_end: Option<EndHook>,
    on_tool_start: Option<ToolStartHook>,
    on_tool_end: Option<ToolEndHook>,
    on_step: Option<StepHook>,
    on_handoff: Option<HandoffHook>,
}

impl AgentHooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_start(mut self, f: impl Fn(&OperationContext) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_end(
        mut self,
        f: impl Fn(&OperationContext, &RunOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }

    /// Called with the tool name and its arguments.
    #[must_use]
    pub fn on_tool_start(
        mut self,
        f: impl Fn(&OperationContext, &str, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_start = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_tool_end(
        mut self,
        f: impl Fn(&OperationContext, &str, &Result<Value, ToolError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_end = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_step(
        mut self,
        f: impl Fn(&OperationContext, &StepSummary) + Send + Sync + 'static,
    ) -> Self {
        self.on_step = Some(Arc::new(f));
        self
    }

    /// Called on the delegated run's context with the delegating agent's
    /// name.
    #[must_use]
    pub fn on_handoff(mut self, f: impl Fn(&OperationContext, &str) + Send + Sync + 'static) -> Self {
        self.on_handoff = Some(Arc::new(f));
        self
    }

    pub(crate) fn start(&self, ctx: &OperationContext) {
        if let Some(f) = &self.on_start {
            f(ctx);
        }
    }

    pub(crate) fn end(&self, ctx: &OperationContext, outcome: &RunOutcome) {
        if let Some(f) = &self.on_end {
            f(ctx, outcome);
        }
    }

    pub(crate) fn tool_start(&self, ctx: &OperationContext, tool_name: &str, args: &Value) {
        if let Some(f) = &self.on_tool_start {
            f(ctx, tool_name, args);
        }
    }

    pub(crate) fn tool_end(
        &self,
        ctx: &OperationContext,
        tool_name: &str,
        result: &Result<Value, ToolError>,
    ) {
        if let Some(f) = &self.on_tool_end {
            f(ctx, tool_name, result);
        }
    }

    pub(crate) fn step(&self, ctx: &OperationContext, summary: &StepSummary) {
        if let Some(f) = &self.on_step {
            f(ctx, summary);
        }
    }

    pub(crate) fn handoff(&self, ctx: &OperationContext, source_agent: &str) {
        if let Some(f) = &self.on_handoff {
            f(ctx, source_agent);
        }
    }
}

impl fmt::Debug for AgentHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("on_tool_start", &self.on_tool_start.is_some())
            .field("on_tool_end", &self.on_tool_end.is_some())
            .field("on_step", &self.on_step.is_some())
            .field("on_handoff", &self.on_handoff.is_some())
            .finish()
    }
}
