use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Text,
    ToolCall,
    ToolResult,
}

/// One execution step attributed to a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub run_id: String,
    pub kind: StepKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_agent_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    fn new(run_id: &str, kind: StepKind, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            kind,
            content,
            tool_call_id: None,
            tool_name: None,
            arguments: None,
            result: None,
            sub_agent_id: None,
            sub_agent_name: None,
            timestamp: Utc::now(),
        }
    }

    pub fn text(run_id: &str, text: impl Into<String>) -> Self {
        Self::new(run_id, StepKind::Text, text.into())
    }

    pub fn tool_call(
        run_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Self {
        let mut step = Self::new(run_id, StepKind::ToolCall, arguments.to_string());
        step.tool_call_id = Some(tool_call_id.to_string());
        step.tool_name = Some(tool_name.to_string());
        step.arguments = Some(arguments);
        step
    }

    pub fn tool_result(
        run_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        result: serde_json::Value,
    ) -> Self {
        let mut step = Self::new(run_id, StepKind::ToolResult, result.to_string());
        step.tool_call_id = Some(tool_call_id.to_string());
        step.tool_name = Some(tool_name.to_string());
        step.result = Some(result);
        step
    }

    /// Tag the step with the sub-agent that produced it.
    #[must_use]
    pub fn from_sub_agent(mut self, agent_id: &str, agent_name: &str) -> Self {
        self.sub_agent_id = Some(agent_id.to_string());
        self.sub_agent_name = Some(agent_name.to_string());
        self
    }
}

/// Append-only step accumulator for one logical run.
///
/// Cloning the log clones the handle, not the steps: the top-level run owns
/// it and delegated runs append through the same handle.
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    steps: Arc<Mutex<Vec<Step>>>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, step: Step) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step);
    }

    /// Snapshot of every step in append order.
    pub fn snapshot(&self) -> Vec<Step> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Steps produced by one run, in append order.
    pub fn steps_for(&self, run_id: &str) -> Vec<Step> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when both handles point at the same accumulator.
    pub fn shares_with(&self, other: &StepLog) -> bool {
        Arc::ptr_eq(&self.steps, &other.steps)
    }
}
