//! Timeline event taxonomy.
//!
//! Every entity inside a run (the agent itself, each tool call, each
//! retriever call) moves through the same three phases: `start`, then
//! exactly one of `success` or `error`. Terminal events point back at the
//! start that opened them through `parent_event_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload schema version stamped on every event.
pub const EVENT_SCHEMA_VERSION: &str = "2.0.0";

/// Kind of entity an event describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Agent,
    Tool,
    Retriever,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Retriever => "retriever",
        }
    }
}

/// Lifecycle phase of an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Start,
    Success,
    Error,
}

impl EventPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    /// `success` and `error` close an entity.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Start)
    }
}

/// Status carried in the exported payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Running,
    Completed,
    Error,
}

/// Severity carried in the exported payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

/// An immutable lifecycle event inside a run's trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEvent {
    pub id: String,
    /// `"<entity>:<phase>"`, e.g. `tool:start`.
    pub name: String,
    #[serde(rename = "type")]
    pub entity: EntityKind,
    pub phase: EventPhase,
    /// Id of the run that owns this event.
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Free-form metadata; always a JSON object.
    pub metadata: serde_json::Value,
    pub version: String,
}

impl TimelineEvent {
    /// A `start` event for `entity` in `trace_id`.
    pub fn start(
        entity: EntityKind,
        trace_id: impl Into<String>,
        display_name: &str,
        input: Option<serde_json::Value>,
    ) -> Self {
        Self::new(entity, EventPhase::Start, trace_id.into(), None)
            .with_input(input)
            .with_metadata_entry("display_name", serde_json::json!(display_name))
    }

    /// A `success` event closing `parent_event_id`.
    pub fn success(
        entity: EntityKind,
        trace_id: impl Into<String>,
        parent_event_id: impl Into<String>,
        output: Option<serde_json::Value>,
    ) -> Self {
        let mut event = Self::new(
            entity,
            EventPhase::Success,
            trace_id.into(),
            Some(parent_event_id.into()),
        );
        event.output = output;
        event
    }

    /// An `error` event closing `parent_event_id`.
    pub fn error(
        entity: EntityKind,
        trace_id: impl Into<String>,
        parent_event_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(
            entity,
            EventPhase::Error,
            trace_id.into(),
            Some(parent_event_id.into()),
        );
        let message = message.into();
        event.level = EventLevel::Error;
        event.output = Some(serde_json::json!({ "error": { "message": message } }));
        event.status_message = Some(message);
        event
    }

    fn new(
        entity: EntityKind,
        phase: EventPhase,
        trace_id: String,
        parent_event_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let status = match phase {
            EventPhase::Start => EventStatus::Running,
            EventPhase::Success => EventStatus::Completed,
            EventPhase::Error => EventStatus::Error,
        };
        Self {
            id: Uuid::new_v4().to_string(),
            name: format!("{}:{}", entity.as_str(), phase.as_str()),
            entity,
            phase,
            trace_id,
            parent_event_id,
            start_time: now,
            end_time: phase.is_terminal().then_some(now),
            status,
            status_message: None,
            level: EventLevel::Info,
            input: None,
            output: None,
            metadata: serde_json::json!({}),
            version: EVENT_SCHEMA_VERSION.to_string(),
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: Option<serde_json::Value>) -> Self {
        self.input = input;
        self
    }

    #[must_use]
    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    /// Insert one metadata key. Non-object metadata is replaced by an object.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: &str, value: serde_json::Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}
