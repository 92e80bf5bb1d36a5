//! Tool call pairing for rendering.
//!
//! Derived from the read model on demand; nothing here is stored.

use std::collections::{HashMap, HashSet};

use crate::model::{ContentKind, Message};

/// A tool request joined with its response, if one arrived yet.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToolPair<'a> {
    pub request: &'a Message,
    pub response: Option<&'a Message>,
}

impl<'a> ToolPair<'a> {
    pub fn tool_call_id(&self) -> &'a str {
        self.request.content.tool_call_id().unwrap_or_default()
    }

    pub fn is_resolved(&self) -> bool {
        self.response.is_some()
    }
}

/// Joins tool requests with responses by `tool_call_id`.
///
/// Pairs come out in request order. A response may appear anywhere after
/// (or before) its request; duplicate responses resolve last-write-wins.
pub fn pair_tool_calls(messages: &[Message]) -> Vec<ToolPair<'_>> {
    let responses = latest_responses(messages);
    messages
        .iter()
        .filter(|m| m.content.kind() == ContentKind::ToolRequest)
        .map(|request| ToolPair {
            request,
            response: request
                .content
                .tool_call_id()
                .and_then(|id| responses.get(id).copied()),
        })
        .collect()
}

/// One renderable row of a conversation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewItem<'a> {
    Message(&'a Message),
    Tool(ToolPair<'a>),
    /// Response whose request is not in the list.
    OrphanResponse(&'a Message),
}

/// Folds paired tool responses into their request row, keeping list order.
pub fn view_items(messages: &[Message]) -> Vec<ViewItem<'_>> {
    let responses = latest_responses(messages);
    let requested: HashSet<&str> = messages
        .iter()
        .filter(|m| m.content.kind() == ContentKind::ToolRequest)
        .filter_map(|m| m.content.tool_call_id())
        .collect();

    messages
        .iter()
        .filter_map(|message| match message.content.kind() {
            ContentKind::ToolRequest => Some(ViewItem::Tool(ToolPair {
                request: message,
                response: message
                    .content
                    .tool_call_id()
                    .and_then(|id| responses.get(id).copied()),
            })),
            ContentKind::ToolResponse => {
                let id = message.content.tool_call_id().unwrap_or_default();
                if requested.contains(id) {
                    None
                } else {
                    Some(ViewItem::OrphanResponse(message))
                }
            }
            _ => Some(ViewItem::Message(message)),
        })
        .collect()
}

fn latest_responses(messages: &[Message]) -> HashMap<&str, &Message> {
    let mut responses = HashMap::new();
    for message in messages {
        if message.content.kind() != ContentKind::ToolResponse {
            continue;
        }
        if let Some(id) = message.content.tool_call_id() {
            responses.insert(id, message);
        }
    }
    responses
}
