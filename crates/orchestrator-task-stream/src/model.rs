use std::fmt;

use chrono::{DateTime, Utc};

/// Identifier of the task whose conversation is being streamed.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Creates a task id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the task id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Server-assigned, stable message identifier.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Who produced a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Agent,
    System,
}

/// Streaming lifecycle of a message in the read model.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamingStatus {
    /// Message came from history and was never streamed locally.
    #[default]
    None,
    /// Placeholder reflecting partial content of an open stream index.
    InProgress,
    /// Stream index finalized (or locally synthesized and complete).
    Done,
}

/// Kind discriminator shared by message content and stream fragments.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ContentKind {
    Text,
    Data,
    Reasoning,
    ToolRequest,
    ToolResponse,
}

/// Message payload.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text.
    Text { text: String },
    /// Structured JSON payload.
    Data { data: serde_json::Value },
    /// Model reasoning trace.
    Reasoning { text: String },
    /// Tool invocation requested by the agent. `arguments` holds the raw JSON
    /// argument text, which may still be incomplete while streaming.
    ToolRequest {
        tool_call_id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: String,
    },
    /// Result of a tool invocation.
    ToolResponse {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl MessageContent {
    /// Creates text content.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Returns the content kind.
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Text { .. } => ContentKind::Text,
            Self::Data { .. } => ContentKind::Data,
            Self::Reasoning { .. } => ContentKind::Reasoning,
            Self::ToolRequest { .. } => ContentKind::ToolRequest,
            Self::ToolResponse { .. } => ContentKind::ToolResponse,
        }
    }

    /// Returns the text for text and reasoning content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Reasoning { text } => Some(text),
            _ => None,
        }
    }

    /// Returns the tool call id for tool request/response content.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolRequest { tool_call_id, .. } | Self::ToolResponse { tool_call_id, .. } => {
                Some(tool_call_id)
            }
            _ => None,
        }
    }
}

/// Local delivery state of a message.
///
/// Everything received from upstream is `Confirmed`; only optimistic entries
/// move through `Pending` and possibly `Failed`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Delivery {
    #[default]
    Confirmed,
    Pending,
    Failed { reason: String },
}

/// Binds a read-model entry to the stream index that produced it.
///
/// `scope` names the delivery channel (the task feed or one per-call stream),
/// `generation` counts connections on that channel. Index values are only
/// meaningful within one `(scope, generation)` pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct StreamKey {
    pub scope: uuid::Uuid,
    pub generation: u32,
    pub index: u32,
}

/// A single entry of the canonical message list.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Server id; absent until the message is server-confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub task_id: TaskId,
    pub content: MessageContent,
    pub author: Author,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub streaming_status: StreamingStatus,
    /// Client-generated id of an optimistic entry.
    #[serde(skip)]
    pub local_id: Option<uuid::Uuid>,
    #[serde(skip)]
    pub delivery: Delivery,
    #[serde(skip)]
    pub stream_key: Option<StreamKey>,
}

impl Message {
    /// Creates a server-confirmed message as returned by history fetches.
    pub fn confirmed(
        id: impl Into<MessageId>,
        task_id: TaskId,
        author: Author,
        content: MessageContent,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            task_id,
            content,
            author,
            created_at: at,
            updated_at: at,
            streaming_status: StreamingStatus::None,
            local_id: None,
            delivery: Delivery::Confirmed,
            stream_key: None,
        }
    }

    /// Creates a locally synthesized user message awaiting confirmation.
    pub fn optimistic(task_id: TaskId, content: MessageContent, at: DateTime<Utc>) -> Self {
        Self::optimistic_with_local_id(task_id, content, at, uuid::Uuid::new_v4())
    }

    pub(crate) fn optimistic_with_local_id(
        task_id: TaskId,
        content: MessageContent,
        at: DateTime<Utc>,
        local_id: uuid::Uuid,
    ) -> Self {
        Self {
            id: None,
            task_id,
            content,
            author: Author::User,
            created_at: at,
            updated_at: at,
            streaming_status: StreamingStatus::Done,
            local_id: Some(local_id),
            delivery: Delivery::Pending,
            stream_key: None,
        }
    }

    pub(crate) fn streamed(
        task_id: TaskId,
        key: StreamKey,
        content: MessageContent,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            task_id,
            content,
            author: Author::Agent,
            created_at: at,
            updated_at: at,
            streaming_status: StreamingStatus::InProgress,
            local_id: None,
            delivery: Delivery::Confirmed,
            stream_key: Some(key),
        }
    }

    /// True for locally synthesized entries that never got a server copy.
    pub fn is_optimistic(&self) -> bool {
        self.local_id.is_some()
    }

    /// True while an optimistic entry waits for confirmation.
    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, Delivery::Failed { .. })
    }
}
