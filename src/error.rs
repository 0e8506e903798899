//! Error types for the run core.
//!
//! Only [`AgentError`] crosses a run boundary. Tool, history, event and
//! export errors are absorbed where they happen and surface as timeline
//! events or log lines.

use thiserror::Error;

/// Errors returned to the caller of a run.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The model provider failed while generating.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// The run was cancelled before it finished.
    #[error("Run aborted: {0}")]
    Aborted(String),

    /// The history entry for the run could not be created.
    #[error("History error: {0}")]
    History(#[from] HistoryError),
}

/// Errors raised by a model provider.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    /// The provider rejected or failed the request.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The provider stream ended with an error chunk.
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Errors raised while executing a tool.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    /// No tool with this name is registered on the agent.
    #[error("Unknown tool: {0}")]
    NotFound(String),

    /// Arguments did not match what the tool expects.
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments {
        /// Tool name.
        tool: String,
        /// What was wrong.
        message: String,
    },

    /// The tool ran and failed.
    #[error("Tool execution failed: {0}")]
    Execution(String),

    /// The run was cancelled while the tool was in flight.
    #[error("Tool cancelled")]
    Cancelled,
}

/// Errors raised by the history recorder.
#[derive(Error, Debug)]
pub enum HistoryError {
    /// The backing store failed.
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    /// No run record exists with this id.
    #[error("Run record not found: {0}")]
    NotFound(String),
}

/// Errors raised when publishing timeline events.
#[derive(Error, Debug)]
pub enum EventError {
    /// `parent_event_id` does not point at a start already published in the trace.
    #[error("Event {event_id} references unknown parent {parent_event_id} in trace {trace_id}")]
    UnknownParent {
        /// Event being published.
        event_id: String,
        /// Dangling parent reference.
        parent_event_id: String,
        /// Trace the event belongs to.
        trace_id: String,
    },

    /// The event could not be written to history.
    #[error("History error: {0}")]
    History(#[from] HistoryError),
}

/// Errors raised by a telemetry backend.
#[derive(Error, Debug)]
pub enum ExportError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid backend URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Backend answered with a non-success status.
    #[error("Backend error ({status}): {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Backend-specific failure.
    #[error("Export failed: {0}")]
    Backend(String),
}

/// Errors raised by a single queue task attempt.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The attempt exceeded its timeout.
    #[error("Task timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation itself failed.
    #[error("Task failed: {0}")]
    Failed(String),

    /// The queue no longer accepts work.
    #[error("Queue is shut down")]
    Closed,
}

impl From<ExportError> for QueueError {
    fn from(err: ExportError) -> Self {
        Self::Failed(err.to_string())
    }
}
