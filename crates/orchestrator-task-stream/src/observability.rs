//! Logging setup and the spans that tie log lines to a task.
//!
//! Every session actor runs inside a `task_session` span carrying the task id,
//! so JSONL output groups feed, call and refetch events per task.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::model::TaskId;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_JSON_LOG_FILE: &str = "task-stream.logs.jsonl";

/// Span wrapping one task session actor and the feed it owns.
pub fn task_span(task_id: &TaskId) -> tracing::Span {
    tracing::info_span!("task_session", task_id = %task_id)
}

/// Span wrapping one send-and-stream call of a session.
pub fn call_span(task_id: &TaskId, call_id: uuid::Uuid) -> tracing::Span {
    tracing::debug_span!("task_call", task_id = %task_id, %call_id)
}

/// Splits a JSONL log path into the directory and file name the appender
/// writes to. An empty directory means the working directory.
fn json_log_target(raw: &str) -> Option<(PathBuf, String)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let path = Path::new(raw);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_JSON_LOG_FILE)
        .to_owned();
    Some((dir, file))
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn observability_enabled() -> bool {
    std::env::var("TASK_STREAM_OBSERVABILITY")
        .ok()
        .map(|value| parse_bool_env(&value).unwrap_or(true))
        .unwrap_or(true)
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("TASK_STREAM_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Installs the process-wide tracing subscriber. Later calls are no-ops.
///
/// Environment variables:
/// - `TASK_STREAM_OBSERVABILITY`: enable/disable flag (default enabled).
/// - `TASK_STREAM_LOG_LEVEL`: level or filter directive; falls back to `RUST_LOG`, then `info`.
/// - `TASK_STREAM_JSON_LOG_PATH`: write JSONL to this file instead of compact stdout output.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !observability_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        let target = std::env::var("TASK_STREAM_JSON_LOG_PATH")
            .ok()
            .and_then(|raw| json_log_target(&raw));
        match target {
            Some((dir, file_name)) => {
                let _ = std::fs::create_dir_all(&dir);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            None => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stdout);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
