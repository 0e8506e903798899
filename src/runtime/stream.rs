//! Items carried on an agent's output stream.

use serde::{Deserialize, Serialize};

use crate::domain::Usage;

/// Why a run's stream ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model answered without asking for more tools.
    Stop,
    /// The step budget ran out.
    MaxSteps,
    /// The run was cancelled; text streamed so far is still valid.
    Aborted,
}

/// Lifecycle state of a delegated sub-agent as seen by the parent stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentState {
    Running,
    Completed,
}

/// One item produced by a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum StreamPart {
    #[serde(rename = "text.delta")]
    TextDelta { text: String },

    #[serde(rename = "tool_call")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        is_error: bool,
    },

    #[serde(rename = "sub_agent.status")]
    SubAgentStatus { status: SubAgentState },

    #[serde(rename = "finish")]
    Finish {
        reason: FinishReason,
        text: String,
        usage: Usage,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl StreamPart {
    /// Tool calls and tool results are the only parts a parent sees from its
    /// sub-agents.
    pub fn is_forwardable(&self) -> bool {
        matches!(self, Self::ToolCall { .. } | Self::ToolResult { .. })
    }
}

/// Where a merged item came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSource {
    Primary,
    SubAgent {
        sub_agent_id: String,
        sub_agent_name: String,
    },
}

/// An item on the merged output stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergedEvent {
    pub source: EventSource,
    pub part: StreamPart,
}

impl MergedEvent {
    pub fn primary(part: StreamPart) -> Self {
        Self {
            source: EventSource::Primary,
            part,
        }
    }

    pub fn from_sub_agent(event: SubAgentEvent) -> Self {
        Self {
            source: EventSource::SubAgent {
                sub_agent_id: event.sub_agent_id,
                sub_agent_name: event.sub_agent_name,
            },
            part: event.part,
        }
    }

    /// Status item for a sub-agent, emitted by the merge engine itself.
    pub fn sub_agent_status(
        sub_agent_id: impl Into<String>,
        sub_agent_name: impl Into<String>,
        status: SubAgentState,
    ) -> Self {
        Self {
            source: EventSource::SubAgent {
                sub_agent_id: sub_agent_id.into(),
                sub_agent_name: sub_agent_name.into(),
            },
            part: StreamPart::SubAgentStatus { status },
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.source, EventSource::Primary)
    }

    pub fn sub_agent_name(&self) -> Option<&str> {
        match &self.source {
            EventSource::Primary => None,
            EventSource::SubAgent { sub_agent_name, .. } => Some(sub_agent_name),
        }
    }
}

/// A stream part produced by a sub-agent, tagged with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAgentEvent {
    /// Delegated run that surfaced the event.
    pub run_id: String,
    pub sub_agent_id: String,
    pub sub_agent_name: String,
    pub part: StreamPart,
}
