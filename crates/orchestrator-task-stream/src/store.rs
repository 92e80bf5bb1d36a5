//! Canonical per-task message list.
//!
//! The store is synchronous and has a single owner (the task session loop).
//! It merges four inputs:
//! - authoritative history snapshots (baseline and refetches),
//! - the task feed, reduced incrementally,
//! - per-call reply streams, each reduced in a private index space,
//! - optimistic user entries inserted before any round trip.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::accumulator::DeltaAccumulator;
use crate::buffer::EventBuffer;
use crate::model::{Author, Delivery, Message, MessageContent, MessageId, StreamKey, TaskId};
use crate::reducer::{ReduceContext, Signal, reduce};
use crate::wire::WireEvent;

/// Index space of one delivery channel.
#[derive(Debug)]
struct Channel {
    scope: uuid::Uuid,
    accumulator: DeltaAccumulator,
}

impl Channel {
    fn new() -> Self {
        Self {
            scope: uuid::Uuid::new_v4(),
            accumulator: DeltaAccumulator::new(),
        }
    }

    fn open_keys(&self) -> impl Iterator<Item = StreamKey> + '_ {
        let generation = self.accumulator.generation();
        self.accumulator
            .open_indexes()
            .map(move |index| StreamKey {
                scope: self.scope,
                generation,
                index,
            })
    }

    fn discard_settled(&mut self, task_id: &TaskId) {
        let discarded = self.accumulator.discard_settled();
        if discarded > 0 {
            debug!(task_id = %task_id, scope = %self.scope, discarded, "released settled stream entries");
        }
    }
}

#[derive(Debug)]
struct CallChannel {
    channel: Channel,
    local_id: uuid::Uuid,
}

/// What a store mutation produced, for the caller to act on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Applied {
    /// Connection signals in arrival order.
    pub signals: Vec<Signal>,
    /// Number of stream indexes finalized.
    pub finalized: usize,
    /// Optimistic entries replaced by their authoritative copy.
    pub confirmed: Vec<uuid::Uuid>,
    /// Events were held back because no baseline exists yet.
    pub buffered: bool,
}

impl Applied {
    fn absorb(&mut self, other: Applied) {
        self.signals.extend(other.signals);
        self.finalized += other.finalized;
        self.confirmed.extend(other.confirmed);
        self.buffered |= other.buffered;
    }
}

/// Owns the read model for one task.
#[derive(Debug)]
pub struct MessageStore {
    task_id: TaskId,
    messages: Vec<Message>,
    buffer: EventBuffer,
    feed: Channel,
    calls: HashMap<uuid::Uuid, CallChannel>,
}

impl MessageStore {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            messages: Vec::new(),
            buffer: EventBuffer::new(),
            feed: Channel::new(),
            calls: HashMap::new(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Chronological read model.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// True once the first history snapshot was applied.
    pub fn has_baseline(&self) -> bool {
        self.buffer.is_sealed()
    }

    /// Feed events waiting for the baseline.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn open_calls(&self) -> usize {
        self.calls.len()
    }

    /// Applies an authoritative history snapshot, given newest first.
    ///
    /// The first snapshot becomes the baseline and replays every buffered
    /// feed event in one reduction. Later snapshots replace the confirmed
    /// part of the list; pending optimistic entries without an authoritative
    /// match and placeholders of still-open stream indexes survive, appended
    /// after the snapshot in their previous order.
    pub fn apply_history(&mut self, newest_first: Vec<Message>, now: DateTime<Utc>) -> Applied {
        let seeding = !self.has_baseline();
        let confirmed = self.merge_snapshot(newest_first);
        let mut applied = Applied {
            confirmed,
            ..Applied::default()
        };
        if seeding {
            let replay = self.buffer.drain_with(std::iter::empty());
            debug!(task_id = %self.task_id, replayed = replay.len(), "baseline applied");
            if !replay.is_empty() {
                let reduced = self.reduce_feed(&replay, now);
                applied.absorb(reduced);
            }
        }
        applied
    }

    /// Applies task feed events, buffering them until a baseline exists.
    pub fn apply_feed(&mut self, events: Vec<WireEvent>, now: DateTime<Utc>) -> Applied {
        if !self.has_baseline() {
            for event in events {
                let _ = self.buffer.push(event);
            }
            return Applied {
                buffered: true,
                ..Applied::default()
            };
        }
        self.reduce_feed(&events, now)
    }

    /// Appends a local user entry and returns its local id.
    pub fn insert_optimistic(&mut self, content: MessageContent, now: DateTime<Utc>) -> uuid::Uuid {
        let local_id = uuid::Uuid::new_v4();
        self.messages.push(Message::optimistic_with_local_id(
            self.task_id.clone(),
            content,
            now,
            local_id,
        ));
        local_id
    }

    /// Opens a private index space for the reply stream of `local_id`.
    pub fn begin_call(&mut self, local_id: uuid::Uuid) -> uuid::Uuid {
        let call_id = uuid::Uuid::new_v4();
        self.calls.insert(
            call_id,
            CallChannel {
                channel: Channel::new(),
                local_id,
            },
        );
        call_id
    }

    /// Reduces events of one per-call stream. Events of unknown or finished
    /// calls are dropped.
    pub fn apply_call(
        &mut self,
        call_id: uuid::Uuid,
        events: Vec<WireEvent>,
        now: DateTime<Utc>,
    ) -> Applied {
        let Some(call) = self.calls.get_mut(&call_id) else {
            debug!(task_id = %self.task_id, %call_id, "dropping events of finished call");
            return Applied::default();
        };
        let ctx = ReduceContext::new(self.task_id.clone(), call.channel.scope, now);
        let reduction = reduce(
            std::mem::take(&mut self.messages),
            std::mem::take(&mut call.channel.accumulator),
            &events,
            &ctx,
        );
        call.channel.accumulator = reduction.accumulator;
        call.channel.discard_settled(&self.task_id);
        self.messages = reduction.messages;
        let confirmed = self.reconcile_finalized(&reduction.finalized);
        Applied {
            signals: reduction.signals,
            finalized: reduction.finalized.len(),
            confirmed,
            buffered: false,
        }
    }

    /// Discards the call's accumulator. Returns the optimistic entry it
    /// belonged to.
    pub fn finish_call(&mut self, call_id: uuid::Uuid) -> Option<uuid::Uuid> {
        let call = self.calls.remove(&call_id)?;
        debug!(
            task_id = %self.task_id,
            %call_id,
            settled = call.channel.accumulator.is_settled(),
            "call stream finished"
        );
        Some(call.local_id)
    }

    /// True while the optimistic entry waits for confirmation.
    pub fn is_pending(&self, local_id: uuid::Uuid) -> bool {
        self.optimistic(local_id).is_some_and(Message::is_pending)
    }

    /// Marks an unconfirmed optimistic entry as failed.
    pub fn mark_send_failed(&mut self, local_id: uuid::Uuid, reason: impl Into<String>) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.local_id == Some(local_id))
        {
            Some(message) => {
                message.delivery = Delivery::Failed {
                    reason: reason.into(),
                };
                true
            }
            None => false,
        }
    }

    /// Removes an optimistic entry.
    pub fn discard_optimistic(&mut self, local_id: uuid::Uuid) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.local_id != Some(local_id));
        before != self.messages.len()
    }

    fn optimistic(&self, local_id: uuid::Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.local_id == Some(local_id))
    }

    fn reduce_feed(&mut self, events: &[WireEvent], now: DateTime<Utc>) -> Applied {
        let ctx = ReduceContext::new(self.task_id.clone(), self.feed.scope, now);
        let reduction = reduce(
            std::mem::take(&mut self.messages),
            std::mem::take(&mut self.feed.accumulator),
            events,
            &ctx,
        );
        self.feed.accumulator = reduction.accumulator;
        self.feed.discard_settled(&self.task_id);
        self.messages = reduction.messages;
        let confirmed = self.reconcile_finalized(&reduction.finalized);
        Applied {
            signals: reduction.signals,
            finalized: reduction.finalized.len(),
            confirmed,
            buffered: false,
        }
    }

    /// Moves finalized user messages into the slot of the oldest optimistic
    /// entry with identical content.
    fn reconcile_finalized(&mut self, keys: &[StreamKey]) -> Vec<uuid::Uuid> {
        let mut confirmed = Vec::new();
        for key in keys {
            let Some(authoritative_pos) = self
                .messages
                .iter()
                .position(|m| m.stream_key == Some(*key))
            else {
                continue;
            };
            if self.messages[authoritative_pos].author != Author::User {
                continue;
            }
            let content = &self.messages[authoritative_pos].content;
            let Some(optimistic_pos) = self
                .messages
                .iter()
                .position(|m| m.is_optimistic() && &m.content == content)
            else {
                continue;
            };

            let authoritative = self.messages.remove(authoritative_pos);
            let slot = if optimistic_pos > authoritative_pos {
                optimistic_pos - 1
            } else {
                optimistic_pos
            };
            let replaced = std::mem::replace(&mut self.messages[slot], authoritative);
            if let Some(local_id) = replaced.local_id {
                debug!(task_id = %self.task_id, %local_id, "optimistic entry confirmed by stream");
                confirmed.push(local_id);
            }
        }
        confirmed
    }

    fn merge_snapshot(&mut self, newest_first: Vec<Message>) -> Vec<uuid::Uuid> {
        let mut snapshot = newest_first;
        snapshot.reverse();
        for message in &mut snapshot {
            message.local_id = None;
            message.delivery = Delivery::Confirmed;
            message.stream_key = None;
        }

        let known: HashSet<MessageId> = self.messages.iter().filter_map(|m| m.id.clone()).collect();
        let open: HashSet<StreamKey> = self
            .feed
            .open_keys()
            .chain(self.calls.values().flat_map(|call| call.channel.open_keys()))
            .collect();

        let mut claimed = vec![false; snapshot.len()];
        let mut retained = Vec::new();
        let mut confirmed = Vec::new();
        for message in std::mem::take(&mut self.messages) {
            if let Some(local_id) = message.local_id {
                let matched = (0..snapshot.len()).find(|&i| {
                    let candidate = &snapshot[i];
                    !claimed[i]
                        && candidate.author == Author::User
                        && candidate.content == message.content
                        && candidate.id.as_ref().is_none_or(|id| !known.contains(id))
                });
                match matched {
                    Some(i) => {
                        claimed[i] = true;
                        confirmed.push(local_id);
                    }
                    None => retained.push(message),
                }
                continue;
            }
            if message.stream_key.is_some_and(|key| open.contains(&key)) {
                retained.push(message);
            }
        }

        debug!(
            task_id = %self.task_id,
            snapshot = snapshot.len(),
            retained = retained.len(),
            confirmed = confirmed.len(),
            "history snapshot merged"
        );
        snapshot.extend(retained);
        self.messages = snapshot;
        confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StreamingStatus;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    fn history(id: &str, author: Author, text: &str, secs: i64) -> Message {
        Message::confirmed(id, TaskId::new("t"), author, MessageContent::text(text), at(secs))
    }

    fn texts(store: &MessageStore) -> Vec<String> {
        store
            .messages()
            .iter()
            .map(|m| m.content.as_text().unwrap_or_default().to_owned())
            .collect()
    }

    fn user_full(index: u32, text: &str, id: &str) -> WireEvent {
        WireEvent::Full {
            index,
            content: MessageContent::text(text),
            id: Some(MessageId::new(id)),
            author: Some(Author::User),
        }
    }

    #[test]
    fn history_is_reversed_exactly_once() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(
            vec![
                history("m3", Author::Agent, "third", 3),
                history("m2", Author::User, "second", 2),
                history("m1", Author::Agent, "first", 1),
            ],
            at(10),
        );
        assert_eq!(texts(&store), vec!["first", "second", "third"]);

        store.apply_history(
            vec![
                history("m4", Author::Agent, "fourth", 4),
                history("m3", Author::Agent, "third", 3),
                history("m2", Author::User, "second", 2),
                history("m1", Author::Agent, "first", 1),
            ],
            at(11),
        );
        assert_eq!(texts(&store), vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn buffered_events_match_post_baseline_delivery() {
        let events = vec![
            WireEvent::Connected,
            WireEvent::text_delta(0, "Hel"),
            WireEvent::text_delta(0, "lo"),
            WireEvent::text_delta(1, "partial"),
            WireEvent::Done { index: 0 },
        ];
        let baseline = vec![history("m1", Author::User, "hi", 1)];

        let mut early = MessageStore::new(TaskId::new("t"));
        for event in &events {
            assert!(early.apply_feed(vec![event.clone()], at(5)).buffered);
        }
        assert_eq!(early.buffered_len(), events.len());
        let replayed = early.apply_history(baseline.clone(), at(5));
        assert_eq!(replayed.signals, vec![Signal::Connected]);
        assert_eq!(early.buffered_len(), 0);

        let mut late = MessageStore::new(TaskId::new("t"));
        late.apply_history(baseline, at(5));
        late.apply_feed(events, at(5));

        let project = |store: &MessageStore| {
            store
                .messages()
                .iter()
                .map(|m| (m.id.clone(), m.content.clone(), m.streaming_status))
                .collect::<Vec<_>>()
        };
        assert_eq!(project(&early), project(&late));
        assert_eq!(
            early.messages()[1].streaming_status,
            StreamingStatus::Done
        );
    }

    #[test]
    fn optimistic_entry_is_replaced_in_place_by_feed_copy() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(Vec::new(), at(0));
        let local_id = store.insert_optimistic(MessageContent::text("ping"), at(1));
        store.apply_feed(vec![WireEvent::text_delta(0, "agent is typing")], at(2));

        let applied = store.apply_feed(vec![user_full(1, "ping", "m-7")], at(3));
        assert_eq!(applied.confirmed, vec![local_id]);
        assert_eq!(texts(&store), vec!["ping", "agent is typing"]);
        assert_eq!(store.messages()[0].id, Some(MessageId::new("m-7")));
        assert!(!store.is_pending(local_id));
    }

    #[test]
    fn unmatched_optimistic_entry_stays_until_refetch() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(Vec::new(), at(0));
        let local_id = store.insert_optimistic(MessageContent::text("ping"), at(1));
        store.apply_feed(vec![user_full(0, "different", "m-1")], at(2));
        assert!(store.is_pending(local_id));
        assert_eq!(store.messages().len(), 2);

        let merged = store.apply_history(
            vec![
                history("m-2", Author::User, "ping", 3),
                history("m-1", Author::User, "different", 2),
            ],
            at(4),
        );
        assert_eq!(merged.confirmed, vec![local_id]);
        assert_eq!(texts(&store), vec!["different", "ping"]);
        assert!(store.messages().iter().all(|m| !m.is_optimistic()));
    }

    #[test]
    fn refetch_does_not_match_previously_known_messages() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(vec![history("m-1", Author::User, "ping", 1)], at(1));
        let local_id = store.insert_optimistic(MessageContent::text("ping"), at(2));

        let merged = store.apply_history(vec![history("m-1", Author::User, "ping", 1)], at(3));
        assert!(merged.confirmed.is_empty());
        assert!(store.is_pending(local_id));
        assert_eq!(texts(&store), vec!["ping", "ping"]);

        assert!(store.mark_send_failed(local_id, "not confirmed"));
        assert!(!store.is_pending(local_id));
        assert!(store.messages()[1].is_failed());
        assert!(store.discard_optimistic(local_id));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn refetch_after_drop_matches_authoritative_source() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(vec![history("m-1", Author::User, "question", 1)], at(1));
        store.apply_feed(
            vec![WireEvent::Connected, WireEvent::text_delta(0, "half an ans")],
            at(2),
        );
        // transport dropped; the reconnect starts a new index space
        store.apply_feed(vec![WireEvent::Connected], at(3));

        let authoritative = vec![
            history("m-2", Author::Agent, "half an answer, completed", 2),
            history("m-1", Author::User, "question", 1),
        ];
        store.apply_history(authoritative.clone(), at(4));

        let mut expected = authoritative;
        expected.reverse();
        assert_eq!(store.messages(), expected.as_slice());
    }

    #[test]
    fn refetch_keeps_placeholders_of_open_indexes() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(Vec::new(), at(0));
        store.apply_feed(vec![WireEvent::text_delta(0, "stream")], at(1));
        store.apply_history(vec![history("m-1", Author::User, "q", 0)], at(2));
        assert_eq!(texts(&store), vec!["q", "stream"]);

        store.apply_feed(vec![WireEvent::text_delta(0, "ing")], at(3));
        assert_eq!(texts(&store), vec!["q", "streaming"]);
    }

    #[test]
    fn call_streams_reduce_in_private_index_space() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(Vec::new(), at(0));
        let local_id = store.insert_optimistic(MessageContent::text("hi"), at(1));
        let call_id = store.begin_call(local_id);

        store.apply_feed(vec![WireEvent::text_delta(0, "feed")], at(2));
        store.apply_call(call_id, vec![WireEvent::text_delta(0, "call")], at(2));
        assert_eq!(texts(&store), vec!["hi", "feed", "call"]);

        store.apply_call(call_id, vec![WireEvent::Done { index: 0 }], at(3));
        assert_eq!(store.messages()[2].streaming_status, StreamingStatus::Done);
        assert_eq!(store.messages()[1].streaming_status, StreamingStatus::InProgress);

        assert_eq!(store.finish_call(call_id), Some(local_id));
        assert_eq!(store.open_calls(), 0);
        let dropped = store.apply_call(call_id, vec![WireEvent::text_delta(1, "late")], at(4));
        assert_eq!(dropped, Applied::default());
        assert_eq!(store.messages().len(), 3);
    }

    #[test]
    fn optimistic_insert_returns_the_id_it_stores() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(Vec::new(), at(0));
        let first = store.insert_optimistic(MessageContent::text("a"), at(1));
        let second = store.insert_optimistic(MessageContent::text("b"), at(2));
        assert_ne!(first, second);
        assert_eq!(store.messages()[0].local_id, Some(first));
        assert_eq!(store.messages()[1].local_id, Some(second));
        assert!(store.is_pending(first));
        assert!(store.mark_send_failed(second, "offline"));
    }

    #[test]
    fn settled_feed_entries_are_released_and_stay_closed() {
        let mut store = MessageStore::new(TaskId::new("t"));
        store.apply_history(Vec::new(), at(0));
        store.apply_feed(
            vec![
                WireEvent::Connected,
                WireEvent::text_delta(0, "one"),
                WireEvent::text_delta(1, "two"),
                WireEvent::Done { index: 0 },
            ],
            at(1),
        );
        assert_eq!(store.feed.accumulator.len(), 2);

        store.apply_feed(vec![WireEvent::Done { index: 1 }], at(2));
        assert!(store.feed.accumulator.is_empty());
        assert_eq!(texts(&store), vec!["one", "two"]);

        let late = store.apply_feed(
            vec![
                WireEvent::text_delta(0, " more"),
                WireEvent::full(1, MessageContent::text("rewritten")),
            ],
            at(3),
        );
        assert_eq!(late.finalized, 0);
        assert_eq!(texts(&store), vec!["one", "two"]);
        assert!(store.feed.accumulator.is_empty());

        store.apply_feed(vec![WireEvent::text_delta(2, "three")], at(4));
        assert_eq!(texts(&store), vec!["one", "two", "three"]);
        assert_eq!(store.feed.accumulator.len(), 1);
    }
}
