use crate::errors::SourceError;
use crate::model::{Author, ContentKind, MessageContent, MessageId};

/// Incremental fragment carried by a `delta` wire event.
///
/// A well-formed fragment carries fields of exactly one content family.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeltaFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl DeltaFragment {
    /// Text fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text_delta: Some(text.into()),
            ..Self::default()
        }
    }

    /// Reasoning fragment.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning_delta: Some(text.into()),
            ..Self::default()
        }
    }

    /// Tool-call fragment; any field may be absent.
    pub fn tool_call(
        tool_call_id: Option<&str>,
        tool_name: Option<&str>,
        arguments_delta: Option<&str>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.map(ToOwned::to_owned),
            tool_name: tool_name.map(ToOwned::to_owned),
            arguments_delta: arguments_delta.map(ToOwned::to_owned),
            ..Self::default()
        }
    }

    /// Returns the content kind this fragment extends, or `None` when the
    /// fragment is empty or mixes families.
    pub fn kind(&self) -> Option<ContentKind> {
        let tool = self.tool_call_id.is_some()
            || self.tool_name.is_some()
            || self.arguments_delta.is_some();
        let families = [
            (self.text_delta.is_some(), ContentKind::Text),
            (self.reasoning_delta.is_some(), ContentKind::Reasoning),
            (tool, ContentKind::ToolRequest),
            (self.data.is_some(), ContentKind::Data),
        ];
        let mut present = families.iter().filter(|(set, _)| *set).map(|(_, kind)| *kind);
        match (present.next(), present.next()) {
            (Some(kind), None) => Some(kind),
            _ => None,
        }
    }
}

/// One unit pushed over a streaming transport.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    /// Transport connected; starts a new index space on the channel.
    Connected,
    /// Server-sent, non-fatal protocol error.
    Error { message: String },
    /// Incremental fragment for `index`.
    Delta {
        index: u32,
        #[serde(rename = "delta")]
        fragment: DeltaFragment,
    },
    /// Terminal override replacing everything accumulated for `index`.
    Full {
        index: u32,
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<Author>,
    },
    /// Finalizes `index` with the content accumulated so far.
    Done { index: u32 },
}

impl WireEvent {
    /// Decodes one JSON wire event.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        serde_json::from_str(raw)
            .map_err(|e| SourceError::malformed(format!("invalid wire event: {e}")))
    }

    /// Shorthand for a text delta.
    pub fn text_delta(index: u32, text: impl Into<String>) -> Self {
        Self::Delta {
            index,
            fragment: DeltaFragment::text(text),
        }
    }

    /// Shorthand for a `full` event without server id or author.
    pub fn full(index: u32, content: MessageContent) -> Self {
        Self::Full {
            index,
            content,
            id: None,
            author: None,
        }
    }

    /// Stream index the event belongs to, if any.
    pub fn index(&self) -> Option<u32> {
        match self {
            Self::Delta { index, .. } | Self::Full { index, .. } | Self::Done { index } => {
                Some(*index)
            }
            Self::Connected | Self::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_wire_shape() {
        assert_eq!(
            WireEvent::parse(r#"{"type":"connected"}"#).expect("connected"),
            WireEvent::Connected
        );
        assert_eq!(
            WireEvent::parse(r#"{"type":"error","message":"rate limited"}"#).expect("error"),
            WireEvent::Error {
                message: "rate limited".into()
            }
        );
        assert_eq!(
            WireEvent::parse(r#"{"type":"delta","index":0,"delta":{"text_delta":"Hel"}}"#)
                .expect("delta"),
            WireEvent::text_delta(0, "Hel")
        );
        assert_eq!(
            WireEvent::parse(
                r#"{"type":"full","index":2,"content":{"kind":"text","text":"X"},"id":"m-9"}"#
            )
            .expect("full"),
            WireEvent::Full {
                index: 2,
                content: MessageContent::text("X"),
                id: Some(MessageId::new("m-9")),
                author: None,
            }
        );
        assert_eq!(
            WireEvent::parse(r#"{"type":"done","index":3}"#).expect("done"),
            WireEvent::Done { index: 3 }
        );
    }

    #[test]
    fn unknown_type_and_negative_index_are_malformed() {
        assert!(WireEvent::parse(r#"{"type":"bogus"}"#)
            .expect_err("bogus")
            .is_malformed());
        assert!(WireEvent::parse(r#"{"type":"done","index":-1}"#)
            .expect_err("negative")
            .is_malformed());
    }

    #[test]
    fn fragment_kind_requires_a_single_family() {
        assert_eq!(DeltaFragment::text("a").kind(), Some(ContentKind::Text));
        assert_eq!(
            DeltaFragment::tool_call(None, None, Some("{")).kind(),
            Some(ContentKind::ToolRequest)
        );
        assert_eq!(DeltaFragment::default().kind(), None);
        let mixed = DeltaFragment {
            text_delta: Some("a".into()),
            reasoning_delta: Some("b".into()),
            ..DeltaFragment::default()
        };
        assert_eq!(mixed.kind(), None);
    }
}
