//! Model provider abstraction.
//!
//! A provider turns a [`ModelRequest`] into a stream of [`ModelChunk`]s.
//! The agent loop owns tool execution; providers only report tool calls.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::tools::ToolSpec;
use crate::domain::Usage;
use crate::error::ModelError;

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelMessage {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut message = Self::new(MessageRole::Assistant, content);
        message.tool_calls = tool_calls;
        message
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(MessageRole::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }
}

/// One model turn's input.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSpec>,
}

/// One chunk of a model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    Finish { usage: Option<Usage> },
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ModelError>> + Send>>;

#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync + Debug {
    /// Start one model turn.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the request.
    async fn stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError>;
}

/// One canned turn for [`ScriptedModel`].
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    Chunks(Vec<Result<ModelChunk, ModelError>>),
    /// The request itself is rejected.
    Reject(ModelError),
}

impl ScriptedTurn {
    /// A turn that streams `text` in one delta and finishes.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Chunks(vec![
            Ok(ModelChunk::TextDelta(text.into())),
            Ok(ModelChunk::Finish { usage: None }),
        ])
    }

    /// A turn that asks for a single tool call.
    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self::Chunks(vec![
            Ok(ModelChunk::ToolCall(ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })),
            Ok(ModelChunk::Finish { usage: None }),
        ])
    }
}

/// Provider that replays canned turns in order. Once the script runs out it
/// answers with an empty text turn.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<ModelRequest>>,
    chunk_delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            chunk_delay: None,
        }
    }

    /// Sleep before every chunk.
    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedModel {
    async fn stream(
        &self,
        request: ModelRequest,
        _cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let turn = self
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::text(""));

        let chunks = match turn {
            ScriptedTurn::Reject(error) => return Err(error),
            ScriptedTurn::Chunks(chunks) => chunks,
        };

        match self.chunk_delay {
            None => Ok(futures::stream::iter(chunks).boxed()),
            Some(delay) => Ok(futures::stream::iter(chunks)
                .then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                })
                .boxed()),
        }
    }
}
