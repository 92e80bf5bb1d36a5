//! Common imports for typical task stream usage.
pub use crate::{
    Author, ConnectionState, Message, MessageContent, MessageSource, StreamConfig, StreamError,
    StreamingStatus, TaskId, TaskNotice, TaskSession, TaskSessions, ToolPair, ViewItem,
    pair_tool_calls, view_items,
};
