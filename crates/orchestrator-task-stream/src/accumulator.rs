//! Per-index accumulation of streamed fragments.
//!
//! The accumulator never fails: anything it cannot apply is reported as
//! `Accumulated::Ignored` and leaves prior state untouched, so one bad event
//! cannot break the consumption loop that feeds it.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ContentKind, MessageContent};
use crate::wire::{DeltaFragment, WireEvent};

/// Accumulated state for one stream index.
#[derive(Clone, Debug, PartialEq)]
pub struct AccumulatorEntry {
    pub index: u32,
    pub content: MessageContent,
    pub finalized: bool,
}

impl AccumulatorEntry {
    pub fn kind(&self) -> ContentKind {
        self.content.kind()
    }
}

/// Why an event left the accumulator unchanged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IgnoreReason {
    /// The index was already closed by `full` or `done`.
    AlreadyFinalized,
    /// `done` for an index that never received content.
    UnknownIndex,
    /// Empty fragment, mixed families, or a kind that does not match the entry.
    MalformedFragment,
    /// `connected`/`error` carry no content.
    NotContent,
}

/// Outcome of applying one event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Accumulated {
    /// First fragment created the entry.
    Started,
    /// Fragment merged into an open entry.
    Appended,
    /// The entry transitioned to finalized by this event.
    Finalized,
    Ignored(IgnoreReason),
}

impl Accumulated {
    /// True when the event changed the entry's content or status.
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Ignored(_))
    }
}

/// Index-keyed fragment buffer for one delivery channel.
///
/// Index values restart on every connection, so `begin_generation` clears all
/// entries and bumps `generation`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeltaAccumulator {
    generation: u32,
    entries: BTreeMap<u32, AccumulatorEntry>,
    /// Finalized indexes whose content was already discarded.
    closed: BTreeSet<u32>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection counter for the channel this accumulator belongs to.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Starts a new index space. Prior entries are discarded.
    pub fn begin_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.entries.clear();
        self.closed.clear();
    }

    /// Drops the content of every entry once all of them are finalized.
    /// The indexes stay closed, so later events for them are still ignored.
    /// Returns the number of entries discarded.
    pub fn discard_settled(&mut self) -> usize {
        if self.entries.is_empty() || !self.is_settled() {
            return 0;
        }
        let discarded = self.entries.len();
        self.closed.extend(self.entries.keys().copied());
        self.entries.clear();
        discarded
    }

    /// True for finalized indexes, whether or not their content is retained.
    pub fn is_closed(&self, index: u32) -> bool {
        self.closed.contains(&index) || self.entries.get(&index).is_some_and(|e| e.finalized)
    }

    pub fn entry(&self, index: u32) -> Option<&AccumulatorEntry> {
        self.entries.get(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every known index has been finalized.
    pub fn is_settled(&self) -> bool {
        self.entries.values().all(|entry| entry.finalized)
    }

    /// Indexes that are still receiving fragments.
    pub fn open_indexes(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .values()
            .filter(|entry| !entry.finalized)
            .map(|entry| entry.index)
    }

    /// Applies one wire event in place.
    pub fn apply(&mut self, event: &WireEvent) -> Accumulated {
        match event {
            WireEvent::Delta { index, fragment } => self.apply_delta(*index, fragment),
            WireEvent::Full { index, content, .. } => self.apply_full(*index, content),
            WireEvent::Done { index } => self.apply_done(*index),
            WireEvent::Connected | WireEvent::Error { .. } => {
                Accumulated::Ignored(IgnoreReason::NotContent)
            }
        }
    }

    fn apply_delta(&mut self, index: u32, fragment: &DeltaFragment) -> Accumulated {
        if self.closed.contains(&index) {
            return Accumulated::Ignored(IgnoreReason::AlreadyFinalized);
        }
        let Some(kind) = fragment.kind() else {
            return Accumulated::Ignored(IgnoreReason::MalformedFragment);
        };
        match self.entries.get_mut(&index) {
            Some(entry) if entry.finalized => Accumulated::Ignored(IgnoreReason::AlreadyFinalized),
            Some(entry) => {
                if merge_fragment(&mut entry.content, kind, fragment) {
                    Accumulated::Appended
                } else {
                    Accumulated::Ignored(IgnoreReason::MalformedFragment)
                }
            }
            None => match content_from_fragment(kind, fragment) {
                Some(content) => {
                    self.entries.insert(
                        index,
                        AccumulatorEntry {
                            index,
                            content,
                            finalized: false,
                        },
                    );
                    Accumulated::Started
                }
                None => Accumulated::Ignored(IgnoreReason::MalformedFragment),
            },
        }
    }

    fn apply_full(&mut self, index: u32, content: &MessageContent) -> Accumulated {
        if self.is_closed(index) {
            return Accumulated::Ignored(IgnoreReason::AlreadyFinalized);
        }
        self.entries.insert(
            index,
            AccumulatorEntry {
                index,
                content: content.clone(),
                finalized: true,
            },
        );
        Accumulated::Finalized
    }

    fn apply_done(&mut self, index: u32) -> Accumulated {
        if self.closed.contains(&index) {
            return Accumulated::Ignored(IgnoreReason::AlreadyFinalized);
        }
        match self.entries.get_mut(&index) {
            Some(entry) if entry.finalized => Accumulated::Ignored(IgnoreReason::AlreadyFinalized),
            Some(entry) => {
                entry.finalized = true;
                Accumulated::Finalized
            }
            None => Accumulated::Ignored(IgnoreReason::UnknownIndex),
        }
    }
}

/// Value-style wrapper around [`DeltaAccumulator::apply`].
pub fn accumulate(mut state: DeltaAccumulator, event: &WireEvent) -> DeltaAccumulator {
    state.apply(event);
    state
}

fn content_from_fragment(kind: ContentKind, fragment: &DeltaFragment) -> Option<MessageContent> {
    match kind {
        ContentKind::Text => fragment.text_delta.clone().map(MessageContent::text),
        ContentKind::Reasoning => fragment
            .reasoning_delta
            .clone()
            .map(|text| MessageContent::Reasoning { text }),
        ContentKind::ToolRequest => Some(MessageContent::ToolRequest {
            tool_call_id: fragment.tool_call_id.clone().unwrap_or_default(),
            name: fragment.tool_name.clone().unwrap_or_default(),
            arguments: fragment.arguments_delta.clone().unwrap_or_default(),
        }),
        ContentKind::Data => match &fragment.data {
            Some(data @ serde_json::Value::Object(_)) => {
                Some(MessageContent::Data { data: data.clone() })
            }
            _ => None,
        },
        ContentKind::ToolResponse => None,
    }
}

/// Merges `fragment` into `current` in place. Returns `false` without touching
/// `current` when the fragment does not fit the entry.
fn merge_fragment(current: &mut MessageContent, kind: ContentKind, fragment: &DeltaFragment) -> bool {
    if current.kind() != kind {
        return false;
    }
    match current {
        MessageContent::Text { text } => match fragment.text_delta.as_deref() {
            Some(delta) => {
                text.push_str(delta);
                true
            }
            None => false,
        },
        MessageContent::Reasoning { text } => match fragment.reasoning_delta.as_deref() {
            Some(delta) => {
                text.push_str(delta);
                true
            }
            None => false,
        },
        MessageContent::ToolRequest {
            tool_call_id,
            name,
            arguments,
        } => {
            let incoming_id = fragment.tool_call_id.as_deref();
            let incoming_name = fragment.tool_name.as_deref();
            if !field_fits(tool_call_id, incoming_id) || !field_fits(name, incoming_name) {
                return false;
            }
            if let Some(id) = incoming_id {
                *tool_call_id = id.to_owned();
            }
            if let Some(incoming_name) = incoming_name {
                *name = incoming_name.to_owned();
            }
            if let Some(delta) = fragment.arguments_delta.as_deref() {
                arguments.push_str(delta);
            }
            true
        }
        MessageContent::Data { data } => {
            let (serde_json::Value::Object(fields), Some(serde_json::Value::Object(update))) =
                (data, fragment.data.as_ref())
            else {
                return false;
            };
            for (key, value) in update {
                fields.insert(key.clone(), value.clone());
            }
            true
        }
        MessageContent::ToolResponse { .. } => false,
    }
}

/// Identity fields are set once; a conflicting value marks the fragment malformed.
fn field_fits(current: &str, incoming: Option<&str>) -> bool {
    match incoming {
        None => true,
        Some(value) => current.is_empty() || current == value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(acc: &DeltaAccumulator, index: u32) -> Option<String> {
        acc.entry(index)
            .and_then(|entry| entry.content.as_text().map(ToOwned::to_owned))
    }

    #[test]
    fn deltas_concatenate_then_done_finalizes() {
        let mut acc = DeltaAccumulator::new();
        assert_eq!(acc.apply(&WireEvent::text_delta(0, "Hel")), Accumulated::Started);
        assert_eq!(acc.apply(&WireEvent::text_delta(0, "lo")), Accumulated::Appended);
        assert_eq!(acc.apply(&WireEvent::Done { index: 0 }), Accumulated::Finalized);
        assert_eq!(text_of(&acc, 0).as_deref(), Some("Hello"));
        assert!(acc.is_settled());
    }

    #[test]
    fn full_overrides_accumulated_content_and_closes_index() {
        let acc = [
            WireEvent::text_delta(0, "a"),
            WireEvent::text_delta(0, "b"),
            WireEvent::full(0, MessageContent::text("X")),
            WireEvent::Done { index: 0 },
        ]
        .iter()
        .fold(DeltaAccumulator::new(), accumulate);
        assert_eq!(text_of(&acc, 0).as_deref(), Some("X"));
    }

    #[test]
    fn finalized_entries_ignore_later_events() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&WireEvent::full(0, MessageContent::text("X")));
        assert_eq!(
            acc.apply(&WireEvent::text_delta(0, "z")),
            Accumulated::Ignored(IgnoreReason::AlreadyFinalized)
        );
        assert_eq!(
            acc.apply(&WireEvent::full(0, MessageContent::text("Y"))),
            Accumulated::Ignored(IgnoreReason::AlreadyFinalized)
        );
        assert_eq!(text_of(&acc, 0).as_deref(), Some("X"));
    }

    #[test]
    fn done_for_unknown_index_is_dropped() {
        let mut acc = DeltaAccumulator::new();
        assert_eq!(
            acc.apply(&WireEvent::Done { index: 7 }),
            Accumulated::Ignored(IgnoreReason::UnknownIndex)
        );
        assert!(acc.is_empty());
    }

    #[test]
    fn mismatched_fragment_preserves_prior_state() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&WireEvent::text_delta(0, "keep"));
        acc.apply(&WireEvent::text_delta(1, "other"));
        let bad = WireEvent::Delta {
            index: 0,
            fragment: DeltaFragment::reasoning("nope"),
        };
        assert_eq!(
            acc.apply(&bad),
            Accumulated::Ignored(IgnoreReason::MalformedFragment)
        );
        let empty = WireEvent::Delta {
            index: 1,
            fragment: DeltaFragment::default(),
        };
        assert_eq!(
            acc.apply(&empty),
            Accumulated::Ignored(IgnoreReason::MalformedFragment)
        );
        assert_eq!(text_of(&acc, 0).as_deref(), Some("keep"));
        assert_eq!(text_of(&acc, 1).as_deref(), Some("other"));
    }

    #[test]
    fn tool_call_fragments_merge_field_wise() {
        let mut acc = DeltaAccumulator::new();
        let frags = [
            DeltaFragment::tool_call(Some("abc"), Some("search"), None),
            DeltaFragment::tool_call(None, None, Some("{\"q\":")),
            DeltaFragment::tool_call(Some("abc"), None, Some("\"rust\"}")),
        ];
        for fragment in frags {
            assert!(acc.apply(&WireEvent::Delta { index: 0, fragment }).is_change());
        }
        let conflicting = DeltaFragment::tool_call(Some("zzz"), None, Some("junk"));
        assert_eq!(
            acc.apply(&WireEvent::Delta {
                index: 0,
                fragment: conflicting
            }),
            Accumulated::Ignored(IgnoreReason::MalformedFragment)
        );
        assert_eq!(
            acc.entry(0).map(|entry| entry.content.clone()),
            Some(MessageContent::ToolRequest {
                tool_call_id: "abc".into(),
                name: "search".into(),
                arguments: "{\"q\":\"rust\"}".into(),
            })
        );
    }

    #[test]
    fn data_fragments_merge_objects() {
        let mut acc = DeltaAccumulator::new();
        let first = DeltaFragment {
            data: Some(serde_json::json!({"a": 1})),
            ..DeltaFragment::default()
        };
        let second = DeltaFragment {
            data: Some(serde_json::json!({"b": 2})),
            ..DeltaFragment::default()
        };
        acc.apply(&WireEvent::Delta {
            index: 4,
            fragment: first,
        });
        acc.apply(&WireEvent::Delta {
            index: 4,
            fragment: second,
        });
        assert_eq!(
            acc.entry(4).map(|entry| entry.content.clone()),
            Some(MessageContent::Data {
                data: serde_json::json!({"a": 1, "b": 2})
            })
        );
    }

    #[test]
    fn settled_entries_are_discarded_but_stay_closed() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&WireEvent::text_delta(0, "Hel"));
        acc.apply(&WireEvent::text_delta(1, "open"));
        acc.apply(&WireEvent::Done { index: 0 });
        assert_eq!(acc.discard_settled(), 0);
        assert_eq!(acc.len(), 2);

        acc.apply(&WireEvent::Done { index: 1 });
        assert_eq!(acc.discard_settled(), 2);
        assert!(acc.is_empty());
        assert!(acc.is_closed(0) && acc.is_closed(1));
        assert_eq!(
            acc.apply(&WireEvent::text_delta(0, "late")),
            Accumulated::Ignored(IgnoreReason::AlreadyFinalized)
        );
        assert_eq!(
            acc.apply(&WireEvent::full(1, MessageContent::text("late"))),
            Accumulated::Ignored(IgnoreReason::AlreadyFinalized)
        );
        assert_eq!(
            acc.apply(&WireEvent::Done { index: 1 }),
            Accumulated::Ignored(IgnoreReason::AlreadyFinalized)
        );
        assert!(acc.is_empty());

        acc.begin_generation();
        assert!(!acc.is_closed(0));
        assert_eq!(acc.apply(&WireEvent::text_delta(0, "fresh")), Accumulated::Started);
    }

    #[test]
    fn new_generation_resets_index_space() {
        let mut acc = DeltaAccumulator::new();
        acc.apply(&WireEvent::full(0, MessageContent::text("old")));
        acc.begin_generation();
        assert_eq!(acc.generation(), 1);
        assert_eq!(acc.apply(&WireEvent::text_delta(0, "new")), Accumulated::Started);
        assert_eq!(acc.open_indexes().collect::<Vec<_>>(), vec![0]);
    }
}
