//! Streaming message aggregation for task conversations.
//!
//! A task conversation reaches the client over two independently timed
//! channels: the reply stream of each send, and a task-wide feed. Both
//! deliver complete messages and indexed delta fragments. This crate reduces
//! them, together with history snapshots and optimistic user input, into
//! one ordered read model per task.
//!
//! Transports are plugged in through `MessageSource`; an HTTP + SSE adapter
//! lives under `vendors::http`.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use orchestrator_task_stream::prelude::*;
//! use orchestrator_task_stream::vendors::http::HttpMessageSource;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! orchestrator_task_stream::observability::init_observability();
//! let source = Arc::new(HttpMessageSource::from_env()?);
//! let mut session = TaskSession::open(source, "task-42", StreamConfig::from_env()?)?;
//!
//! let local_id = session.send_text("Summarize the open issues").await?;
//! let mut messages = session.messages();
//! while messages.changed().await.is_ok() {
//!     for item in view_items(&messages.borrow()) {
//!         println!("{item:?}");
//!     }
//!     if let Ok(Some(notice)) = tokio::time::timeout(
//!         std::time::Duration::from_millis(10),
//!         session.next_notice(),
//!     )
//!     .await
//!     {
//!         println!("{notice:?} (sent {local_id})");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Per-index delta accumulation.
pub mod accumulator;
/// Holding area for feed events that arrive before the baseline.
pub mod buffer;
/// Session and reconnect configuration.
pub mod config;
/// Public error types.
pub mod errors;
/// Messages, content and identifiers.
pub mod model;
/// Tracing subscriber setup.
pub mod observability;
/// Tool request/response joins for rendering.
pub mod pairing;
/// Common imports for typical usage.
pub mod prelude;
/// Pure reduction of wire events into the message list.
pub mod reducer;
/// Cancellation scopes.
pub mod scope;
/// Task session actor and task switching.
pub mod session;
/// Upstream operation contract.
pub mod source;
/// Canonical per-task message store.
pub mod store;
/// Reconnecting task feed.
pub mod subscription;
/// Transport implementations of `MessageSource`.
pub mod vendors;
/// Wire event contract.
pub mod wire;

pub use accumulator::{Accumulated, AccumulatorEntry, DeltaAccumulator, IgnoreReason, accumulate};
pub use buffer::EventBuffer;
pub use config::{ReconnectPolicy, StreamConfig};
pub use errors::{SourceError, StreamError};
pub use model::{
    Author, ContentKind, Delivery, Message, MessageContent, MessageId, StreamKey, StreamingStatus,
    TaskId,
};
pub use pairing::{ToolPair, ViewItem, pair_tool_calls, view_items};
pub use reducer::{ReduceContext, Reduction, Signal, reduce};
pub use scope::{AbortHandle, ScopeToken, scope};
pub use session::{TaskNotice, TaskSession, TaskSessions};
pub use source::{MessageSource, WireStream};
pub use store::{Applied, MessageStore};
pub use subscription::{ConnectionInput, ConnectionState, FeedEvent, SubscriptionManager};
pub use wire::{DeltaFragment, WireEvent};
