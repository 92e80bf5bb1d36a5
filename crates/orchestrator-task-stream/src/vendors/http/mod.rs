//! HTTP + server-sent events adapter.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET  tasks/{task_id}/messages`: history, newest first.
//! - `POST tasks/{task_id}/messages`: send; the reply is an SSE body.
//! - `GET  tasks/{task_id}/events`: task feed as an SSE body.
//!
//! Every SSE frame's `data` holds one JSON wire event.
mod adapter;
mod config;
pub(crate) mod transport;

pub use adapter::HttpMessageSource;
pub use config::HttpSourceConfig;
