use crate::errors::SourceError;
use crate::wire::WireEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder; frames may be split across chunks arbitrarily.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf) {
            if let Some(frame) = parse_sse_frame(&self.buf[..idx]) {
                frames.push(frame);
            }
            self.buf.drain(..idx + delim_len);
        }
        frames
    }

    /// Flushes a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buf);
        parse_sse_frame(&rest)
    }
}

fn find_frame_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim_start().to_owned());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Maps one SSE frame to a wire event.
///
/// Keep-alive frames and `[DONE]` markers yield `None`. When the payload has
/// no `type` field the SSE event name is used instead.
pub(crate) fn decode_frame(frame: &SseFrame) -> Option<Result<WireEvent, SourceError>> {
    let data = frame.data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let mut value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => return Some(Err(SourceError::malformed(format!("invalid SSE JSON frame: {e}")))),
    };
    if let (Some(object), Some(name)) = (value.as_object_mut(), frame.event.as_deref())
        && !object.contains_key("type")
        && name != "message"
    {
        object.insert("type".into(), serde_json::Value::String(name.to_owned()));
    }
    Some(
        serde_json::from_value(value)
            .map_err(|e| SourceError::malformed(format!("unrecognized wire event: {e}"))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageContent;

    #[test]
    fn decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push_chunk(b"data: {\"type\":\"delta\",\"index\":0,\"delta\":{\"text_del");
        assert!(frames.is_empty());
        let frames = decoder.push_chunk(b"ta\":\"Hel\"}}\n\n: keep-alive\n\ndata: {\"type\":\"done\",");
        assert_eq!(frames.len(), 1);
        assert_eq!(
            decode_frame(&frames[0]).expect("event").expect("valid"),
            WireEvent::text_delta(0, "Hel")
        );
        let frames = decoder.push_chunk(b"\"index\":0}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(
            decode_frame(&frames[0]).expect("event").expect("valid"),
            WireEvent::Done { index: 0 }
        );
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push_chunk(b"data: {\"type\":\"connected\"}").is_empty());
        let frame = decoder.finish().expect("trailing frame");
        assert_eq!(
            decode_frame(&frame).expect("event").expect("valid"),
            WireEvent::Connected
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn event_name_supplies_missing_type() {
        let frame = SseFrame {
            event: Some("full".into()),
            data: r#"{"index":2,"content":{"kind":"text","text":"done"}}"#.into(),
        };
        assert_eq!(
            decode_frame(&frame).expect("event").expect("valid"),
            WireEvent::full(2, MessageContent::text("done"))
        );
    }

    #[test]
    fn done_marker_and_garbage() {
        let done = SseFrame {
            event: None,
            data: "[DONE]".into(),
        };
        assert!(decode_frame(&done).is_none());

        let garbage = SseFrame {
            event: None,
            data: "{not json".into(),
        };
        let err = decode_frame(&garbage).expect("item").expect_err("malformed");
        assert!(err.is_malformed());

        let unknown = SseFrame {
            event: None,
            data: r#"{"type":"bogus"}"#.into(),
        };
        assert!(decode_frame(&unknown).expect("item").is_err());
    }
}
