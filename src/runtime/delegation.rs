//! Sub-agent delegation.
//!
//! An agent with sub-agents gets a built-in `delegate_task` tool. Calling it
//! starts one delegated run per target, all concurrently. Each delegated run
//! shares the parent's step log and user context, is cancelled with the
//! parent, and surfaces its tool calls and tool results on the parent's
//! merged stream tagged with its own id and name.

use std::sync::Arc;

use futures::StreamExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::agent::{Agent, RunOptions};
use super::context::OperationContext;
use super::merge::EventForwarder;
use super::stream::{EventSource, FinishReason, MergedEvent, StreamPart, SubAgentEvent};
use super::tools::{Tool, ToolContext};
use crate::error::ToolError;

pub const DELEGATE_TOOL_NAME: &str = "delegate_task";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Completed,
    Error,
}

/// Outcome of one delegated run, as reported back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationResult {
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub response: String,
    pub status: DelegationStatus,
}

impl DelegationResult {
    fn failed(agent_name: &str, agent_id: Option<&str>, run_id: Option<String>, message: String) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            agent_id: agent_id.map(str::to_string),
            run_id,
            response: message,
            status: DelegationStatus::Error,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DelegateArgs {
    task: String,
    target_agents: Vec<String>,
    #[serde(default)]
    context: Option<Value>,
}

/// The sub-agents an agent can delegate to.
#[derive(Debug, Clone, Default)]
pub struct SubAgentManager {
    agents: Vec<Arc<Agent>>,
}

impl SubAgentManager {
    pub fn new(agents: Vec<Arc<Agent>>) -> Self {
        Self { agents }
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.iter().find(|a| a.name() == name)
    }

    /// The `delegate_task` tool over these sub-agents.
    pub fn delegate_tool(&self) -> DelegateTool {
        DelegateTool::new(self.clone())
    }

    /// Run `task` on every target concurrently and collect one result per
    /// target, in target order.
    pub async fn handoff_task(
        &self,
        parent: &Arc<OperationContext>,
        target_agents: &[String],
        task: &str,
        context: Option<&Value>,
    ) -> Vec<DelegationResult> {
        info!(
            run_id = %parent.id(),
            targets = ?target_agents,
            "Delegating task to sub-agents"
        );
        let forwarder = parent.forwarder();
        let runs = target_agents.iter().map(|name| {
            let forwarder = forwarder.clone();
            async move {
                match self.find(name) {
                    Some(agent) => handoff(agent, parent, forwarder, task, context).await,
                    None => {
                        warn!(run_id = %parent.id(), target = %name, "Unknown sub-agent");
                        DelegationResult::failed(
                            name,
                            None,
                            None,
                            format!("Unknown sub-agent: {name}"),
                        )
                    }
                }
            }
        });
        join_all(runs).await
    }
}

async fn handoff(
    agent: &Arc<Agent>,
    parent: &Arc<OperationContext>,
    forwarder: Option<EventForwarder>,
    task: &str,
    context: Option<&Value>,
) -> DelegationResult {
    let prompt = match context {
        Some(context) => format!("{task}\n\nContext: {context}"),
        None => task.to_string(),
    };

    let mut stream = match agent
        .stream_text(prompt, RunOptions::delegated_from(parent))
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(agent = %agent.name(), error = %e, "Could not start delegated run");
            return DelegationResult::failed(agent.name(), Some(agent.id()), None, e.to_string());
        }
    };
    let run_id = stream.run_id().to_string();
    debug!(parent_run_id = %parent.id(), %run_id, agent = %agent.name(), "Delegated run started");

    let mut response = String::new();
    let mut error = None;
    while let Some(MergedEvent { source, part }) = stream.next().await {
        if part.is_forwardable() {
            if let Some(forwarder) = &forwarder {
                let (sub_agent_id, sub_agent_name) = match source {
                    EventSource::Primary => (agent.id().to_string(), agent.name().to_string()),
                    // Deeper delegates keep their own tag.
                    EventSource::SubAgent {
                        sub_agent_id,
                        sub_agent_name,
                    } => (sub_agent_id, sub_agent_name),
                };
                forwarder
                    .forward(SubAgentEvent {
                        run_id: run_id.clone(),
                        sub_agent_id,
                        sub_agent_name,
                        part,
                    })
                    .await;
            }
            continue;
        }

        if !matches!(source, EventSource::Primary) {
            continue;
        }
        match part {
            StreamPart::Finish { reason, text, .. } => {
                if reason == FinishReason::Aborted {
                    error = Some("delegated run was aborted".to_string());
                }
                response = text;
            }
            StreamPart::Error { message, .. } => error = Some(message),
            _ => {}
        }
    }

    if let Some(forwarder) = &forwarder {
        forwarder.mark_completed(&run_id);
    }

    match error {
        None => DelegationResult {
            agent_name: agent.name().to_string(),
            agent_id: Some(agent.id().to_string()),
            run_id: Some(run_id),
            response,
            status: DelegationStatus::Completed,
        },
        Some(message) => DelegationResult::failed(agent.name(), Some(agent.id()), Some(run_id), message),
    }
}

/// Built-in tool that hands a task to one or more sub-agents.
#[derive(Debug, Clone)]
pub struct DelegateTool {
    manager: SubAgentManager,
    description: String,
}

impl DelegateTool {
    fn new(manager: SubAgentManager) -> Self {
        let description = format!(
            "Delegate a task to one or more specialized agents. Available agents: {}",
            manager.names().join(", ")
        );
        Self {
            manager,
            description,
        }
    }
}

#[async_trait::async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task to delegate"
                },
                "target_agents": {
                    "type": "array",
                    "items": { "type": "string", "enum": self.manager.names() },
                    "description": "Names of the agents that should handle the task"
                },
                "context": {
                    "type": "object",
                    "description": "Additional context for the task"
                }
            },
            "required": ["task", "target_agents"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: DelegateArgs =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
                tool: DELEGATE_TOOL_NAME.to_string(),
                message: e.to_string(),
            })?;
        if args.target_agents.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: DELEGATE_TOOL_NAME.to_string(),
                message: "target_agents must not be empty".to_string(),
            });
        }

        let results = self
            .manager
            .handoff_task(
                &ctx.operation,
                &args.target_agents,
                &args.task,
                args.context.as_ref(),
            )
            .await;
        serde_json::to_value(results).map_err(|e| ToolError::Execution(e.to_string()))
    }
}
