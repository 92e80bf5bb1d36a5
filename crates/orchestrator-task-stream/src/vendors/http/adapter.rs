use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::{SourceError, StreamError};
use crate::model::{Message, MessageContent, TaskId};
use crate::source::{MessageSource, WireStream};
use crate::wire::WireEvent;

use super::config::HttpSourceConfig;
use super::transport::{SseDecoder, decode_frame};

const HTTP_SOURCE: &str = "http";

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// `MessageSource` backed by a REST + SSE task API.
pub struct HttpMessageSource {
    client: reqwest::Client,
    base_url: reqwest::Url,
    config: HttpSourceConfig,
}

impl HttpMessageSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, StreamError> {
        let base_url = config.parsed_base_url()?;
        // Streams run indefinitely, so only the connect phase gets a
        // client-wide timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Creates a source from `TASK_STREAM_BASE_URL` / `TASK_STREAM_AUTH_TOKEN`.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::new(HttpSourceConfig::from_env()?)
    }

    fn task_url(&self, task_id: &TaskId, leaf: &str) -> Result<reqwest::Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::transport("base url cannot carry path segments"))?
            .pop_if_empty()
            .extend(["tasks", task_id.as_str(), leaf]);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn open_event_stream(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<WireStream, SourceError> {
        let response = self
            .authorized(request)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| SourceError::transport(format!("event stream request failed: {e}")))?;
        let response = ensure_success(response).await?;
        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        Ok(Box::pin(wire_event_stream(bytes_stream)))
    }
}

#[async_trait::async_trait]
impl MessageSource for HttpMessageSource {
    fn name(&self) -> &str {
        HTTP_SOURCE
    }

    async fn fetch_history(&self, task_id: &TaskId) -> Result<Vec<Message>, SourceError> {
        let url = self.task_url(task_id, "messages")?;
        debug!(task_id = %task_id, %url, "fetching task history");
        let response = self
            .authorized(self.client.get(url))
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| SourceError::transport(format!("history request failed: {e}")))?;
        let response = ensure_success(response).await?;
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceError::malformed(format!("history body is not JSON: {e}")))?;
        parse_history(value)
    }

    async fn send_and_stream(
        &self,
        task_id: &TaskId,
        content: &MessageContent,
    ) -> Result<WireStream, SourceError> {
        let url = self.task_url(task_id, "messages")?;
        debug!(task_id = %task_id, kind = ?content.kind(), "sending task message");
        let body = serde_json::json!({ "content": content });
        self.open_event_stream(self.client.post(url).json(&body)).await
    }

    async fn subscribe(&self, task_id: &TaskId) -> Result<WireStream, SourceError> {
        let url = self.task_url(task_id, "events")?;
        debug!(task_id = %task_id, "subscribing to task feed");
        self.open_event_stream(self.client.get(url)).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(SourceError::upstream(
        format!("request failed with status {status}: {body}"),
        Some(status.as_u16()),
    ))
}

/// Accepts either a bare array or `{"messages": [...]}`, newest first.
fn parse_history(value: serde_json::Value) -> Result<Vec<Message>, SourceError> {
    let list = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut object) => object
            .remove("messages")
            .ok_or_else(|| SourceError::malformed("history object has no `messages` field"))?,
        other => {
            return Err(SourceError::malformed(format!(
                "unexpected history payload: {other}"
            )));
        }
    };
    serde_json::from_value(list)
        .map_err(|e| SourceError::malformed(format!("invalid history message: {e}")))
}

/// Turns an SSE byte stream into wire events.
///
/// Malformed frames are yielded as `SourceError::Malformed` and decoding
/// continues; a read failure is yielded once and ends the stream.
fn wire_event_stream(
    bytes_stream: ByteStream,
) -> impl futures::Stream<Item = Result<WireEvent, SourceError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<Result<WireEvent, SourceError>>,
        done: bool,
    }

    stream::unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(item) = state.pending.pop_front() {
                    return Some((item, state));
                }
                if state.done {
                    return None;
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push_chunk(&chunk) {
                            if let Some(item) = decode_frame(&frame) {
                                state.pending.push_back(item);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        state.pending.push_back(Err(SourceError::transport(format!(
                            "event stream read failed: {e}"
                        ))));
                    }
                    None => {
                        state.done = true;
                        if let Some(item) = state.decoder.finish().as_ref().and_then(decode_frame) {
                            state.pending.push_back(item);
                        }
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Author;

    fn byte_stream(chunks: &[&'static str]) -> ByteStream {
        let items: Vec<Result<bytes::Bytes, reqwest::Error>> = chunks
            .iter()
            .map(|chunk| Ok(bytes::Bytes::from_static(chunk.as_bytes())))
            .collect();
        Box::pin(stream::iter(items))
    }

    #[test]
    fn task_urls_escape_the_task_id() {
        let source =
            HttpMessageSource::new(HttpSourceConfig::new("http://localhost:8080/api/")).expect("source");
        let url = source
            .task_url(&TaskId::new("task 1/x"), "events")
            .expect("url");
        assert_eq!(url.as_str(), "http://localhost:8080/api/tasks/task%201%2Fx/events");
    }

    #[test]
    fn history_accepts_array_or_wrapped_object() {
        let message = serde_json::json!({
            "id": "m-1",
            "task_id": "t",
            "content": {"kind": "text", "text": "hi"},
            "author": "agent",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        });
        let bare = parse_history(serde_json::json!([message.clone()])).expect("array");
        let wrapped = parse_history(serde_json::json!({"messages": [message]})).expect("object");
        assert_eq!(bare, wrapped);
        assert_eq!(bare[0].author, Author::Agent);

        let err = parse_history(serde_json::json!("nope")).expect_err("string");
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn event_stream_skips_malformed_frames_and_continues() {
        let stream = wire_event_stream(byte_stream(&[
            "data: {\"type\":\"connected\"}\n\ndata: {broken\n\n",
            "data: {\"type\":\"delta\",\"index\":0,\"delta\":{\"text_delta\":\"hi\"}}\n\n",
            "data: {\"type\":\"done\",\"index\":0}",
        ]));
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], Ok(WireEvent::Connected));
        assert!(items[1].as_ref().is_err_and(SourceError::is_malformed));
        assert_eq!(items[2], Ok(WireEvent::text_delta(0, "hi")));
        assert_eq!(items[3], Ok(WireEvent::Done { index: 0 }));
    }

    #[tokio::test]
    async fn env_gated_smoke_fetch_history_if_configured() {
        let task_id = std::env::var("TASK_STREAM_SMOKE_TASK_ID").unwrap_or_default();
        if task_id.trim().is_empty() || std::env::var("TASK_STREAM_BASE_URL").is_err() {
            eprintln!("skipping HTTP source smoke test (TASK_STREAM_BASE_URL / TASK_STREAM_SMOKE_TASK_ID missing)");
            return;
        }

        let source = HttpMessageSource::from_env().expect("source");
        let result = source.fetch_history(&TaskId::new(task_id.trim())).await;
        assert!(result.is_ok(), "history smoke failed: {result:?}");
    }
}
