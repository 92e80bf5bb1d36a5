//! Pure folding of wire event batches into the message list.
//!
//! `reduce` is deterministic for a given context, and splitting a batch across
//! calls yields the same messages and accumulator as one call with the
//! concatenated batch. Stores rely on this to replay buffered events.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::accumulator::{Accumulated, DeltaAccumulator};
use crate::model::{Author, Message, MessageId, StreamKey, StreamingStatus, TaskId};
use crate::wire::WireEvent;

/// Inputs that are constant for one reduction call.
#[derive(Clone, Debug)]
pub struct ReduceContext {
    pub task_id: TaskId,
    /// Delivery channel the batch came from.
    pub scope: uuid::Uuid,
    /// Timestamp used for every message created or updated by the call.
    pub now: DateTime<Utc>,
}

impl ReduceContext {
    pub fn new(task_id: TaskId, scope: uuid::Uuid, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            scope,
            now,
        }
    }
}

/// Connection-level signal passed through to the caller instead of the list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Connected,
    Error { message: String },
}

/// Result of one reduction call.
#[derive(Clone, Debug, PartialEq)]
pub struct Reduction {
    pub messages: Vec<Message>,
    pub accumulator: DeltaAccumulator,
    /// Connected/Error signals in arrival order.
    pub signals: Vec<Signal>,
    /// Keys whose index finalized during this call, in finalization order.
    pub finalized: Vec<StreamKey>,
}

/// Pending write for one stream key, flushed once per batch.
struct Touched {
    key: StreamKey,
    id: Option<MessageId>,
    author: Option<Author>,
}

/// Folds `events` in arrival order into `messages`.
///
/// Open indexes are visible as `InProgress` placeholders; the first
/// finalization of an index turns its placeholder into a `Done` message in
/// place. Connection signals never enter the list.
pub fn reduce(
    mut messages: Vec<Message>,
    mut accumulator: DeltaAccumulator,
    events: &[WireEvent],
    ctx: &ReduceContext,
) -> Reduction {
    let mut signals = Vec::new();
    let mut finalized = Vec::new();
    let mut touched: Vec<Touched> = Vec::new();

    for event in events {
        let index = match event {
            WireEvent::Connected => {
                flush(&mut messages, &accumulator, &mut touched, ctx);
                accumulator.begin_generation();
                signals.push(Signal::Connected);
                continue;
            }
            WireEvent::Error { message } => {
                signals.push(Signal::Error {
                    message: message.clone(),
                });
                continue;
            }
            WireEvent::Delta { index, .. }
            | WireEvent::Full { index, .. }
            | WireEvent::Done { index } => *index,
        };

        let outcome = accumulator.apply(event);
        if let Accumulated::Ignored(reason) = outcome {
            debug!(task_id = %ctx.task_id, scope = %ctx.scope, index, ?reason, "stream event ignored");
            continue;
        }

        let key = StreamKey {
            scope: ctx.scope,
            generation: accumulator.generation(),
            index,
        };
        let slot = match touched.iter().position(|t| t.key == key) {
            Some(pos) => pos,
            None => {
                touched.push(Touched {
                    key,
                    id: None,
                    author: None,
                });
                touched.len() - 1
            }
        };
        if let WireEvent::Full { id, author, .. } = event {
            touched[slot].id = id.clone();
            touched[slot].author = *author;
        }
        if outcome == Accumulated::Finalized {
            finalized.push(key);
        }
    }
    flush(&mut messages, &accumulator, &mut touched, ctx);

    Reduction {
        messages,
        accumulator,
        signals,
        finalized,
    }
}

fn flush(
    messages: &mut Vec<Message>,
    accumulator: &DeltaAccumulator,
    touched: &mut Vec<Touched>,
    ctx: &ReduceContext,
) {
    for write in touched.drain(..) {
        let Some(entry) = accumulator.entry(write.key.index) else {
            continue;
        };
        let status = if entry.finalized {
            StreamingStatus::Done
        } else {
            StreamingStatus::InProgress
        };

        let by_key = messages
            .iter()
            .position(|m| m.stream_key == Some(write.key));
        let by_id = write
            .id
            .as_ref()
            .and_then(|id| messages.iter().position(|m| m.id.as_ref() == Some(id)));
        // A placeholder from an earlier batch folds into the message that
        // already carries the id, which keeps its slot.
        let position = match (by_key, by_id) {
            (Some(key_pos), Some(id_pos)) if key_pos != id_pos => {
                messages.remove(key_pos);
                Some(if key_pos < id_pos { id_pos - 1 } else { id_pos })
            }
            (Some(pos), _) | (None, Some(pos)) => Some(pos),
            (None, None) => None,
        };
        let message = match position {
            Some(pos) => &mut messages[pos],
            None => {
                messages.push(Message::streamed(
                    ctx.task_id.clone(),
                    write.key,
                    entry.content.clone(),
                    ctx.now,
                ));
                let last = messages.len() - 1;
                &mut messages[last]
            }
        };
        message.content = entry.content.clone();
        message.streaming_status = status;
        message.stream_key = Some(write.key);
        message.updated_at = ctx.now;
        if let Some(id) = write.id {
            message.id = Some(id);
        }
        if let Some(author) = write.author {
            message.author = author;
        }
    }
}
