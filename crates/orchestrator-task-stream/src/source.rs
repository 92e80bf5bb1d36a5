use std::pin::Pin;

use crate::errors::SourceError;
use crate::model::{Message, MessageContent, TaskId};
use crate::wire::WireEvent;

/// Boxed stream of wire events produced by a `MessageSource`.
///
/// `Err(SourceError::Malformed)` items are skippable; any other error ends
/// the stream from the consumer's point of view.
pub type WireStream =
    Pin<Box<dyn futures::Stream<Item = Result<WireEvent, SourceError>> + Send + 'static>>;

/// Upstream operations a task session consumes.
///
/// Implementations translate their transport into the common wire-event
/// contract and never touch local state.
#[async_trait::async_trait]
pub trait MessageSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// One-shot authoritative history, newest first.
    async fn fetch_history(&self, task_id: &TaskId) -> Result<Vec<Message>, SourceError>;

    /// Sends user content and streams the reply. The stream ends when the
    /// call completes.
    async fn send_and_stream(
        &self,
        task_id: &TaskId,
        content: &MessageContent,
    ) -> Result<WireStream, SourceError>;

    /// Opens the task-wide feed. The stream ends only when the transport
    /// closes; callers reconnect.
    async fn subscribe(&self, task_id: &TaskId) -> Result<WireStream, SourceError>;
}
