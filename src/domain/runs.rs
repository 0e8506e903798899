use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::steps::Step;

/// Durable record of one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// Same id as the run's operation context.
    pub id: String,
    pub agent_id: String,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub usage: Option<Usage>,
    pub steps: Vec<Step>,
    pub metadata: serde_json::Value,
}

impl RunRecord {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        input: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            input,
            output: None,
            status: RunStatus::Working,
            start_time: Utc::now(),
            end_time: None,
            usage: None,
            steps: Vec::new(),
            metadata,
        }
    }

    /// Apply an update in place. `None` fields are left untouched.
    pub fn apply(&mut self, update: RunUpdate) {
        if let Some(output) = update.output {
            self.output = Some(output);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(usage) = update.usage {
            self.usage = Some(usage);
        }
        if let Some(metadata) = update.metadata {
            self.metadata = metadata;
        }
        if let Some(end_time) = update.end_time {
            self.end_time = Some(end_time);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Working,
    Completed,
    Error,
    /// Cancelled by the caller; not an error.
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Working)
    }
}

/// Token accounting reported by the model provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// Requested changes to a run record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub output: Option<String>,
    pub status: Option<RunStatus>,
    pub usage: Option<Usage>,
    pub metadata: Option<serde_json::Value>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RunUpdate {
    /// Terminal update stamped with the current time.
    pub fn finished(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            end_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Exportable fields that actually changed between two versions of a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl RunPatch {
    pub fn diff(before: &RunRecord, after: &RunRecord) -> Self {
        fn changed<T: PartialEq + Clone>(old: &T, new: &T) -> Option<T> {
            (old != new).then(|| new.clone())
        }

        Self {
            output: changed(&before.output, &after.output).flatten(),
            status: changed(&before.status, &after.status),
            usage: changed(&before.usage, &after.usage).flatten(),
            metadata: changed(&before.metadata, &after.metadata),
            end_time: changed(&before.end_time, &after.end_time).flatten(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_none()
            && self.status.is_none()
            && self.usage.is_none()
            && self.metadata.is_none()
            && self.end_time.is_none()
    }
}
