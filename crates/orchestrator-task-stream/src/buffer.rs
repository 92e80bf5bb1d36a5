use std::collections::VecDeque;

use crate::wire::WireEvent;

/// Holds feed events that arrive before the baseline history is available.
///
/// Events are kept verbatim in arrival order until `drain_with` hands them
/// out once; after that the buffer is sealed and `push` passes events
/// straight back to the caller.
#[derive(Debug, Default)]
pub struct EventBuffer {
    pending: VecDeque<WireEvent>,
    sealed: bool,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `event` while unsealed. Returns it back when already sealed.
    pub fn push(&mut self, event: WireEvent) -> Option<WireEvent> {
        if self.sealed {
            return Some(event);
        }
        self.pending.push_back(event);
        None
    }

    /// Returns `buffered ++ since` and seals the buffer.
    ///
    /// A second call yields only `since`; buffered events are handed out once.
    pub fn drain_with(&mut self, since: impl IntoIterator<Item = WireEvent>) -> Vec<WireEvent> {
        self.sealed = true;
        let mut events: Vec<WireEvent> = self.pending.drain(..).collect();
        events.extend(since);
        events
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_arrival_order_and_drains_once() {
        let mut buffer = EventBuffer::new();
        assert!(buffer.push(WireEvent::text_delta(0, "a")).is_none());
        assert!(buffer.push(WireEvent::text_delta(0, "b")).is_none());
        assert_eq!(buffer.len(), 2);

        let drained = buffer.drain_with(vec![WireEvent::Done { index: 0 }]);
        assert_eq!(
            drained,
            vec![
                WireEvent::text_delta(0, "a"),
                WireEvent::text_delta(0, "b"),
                WireEvent::Done { index: 0 },
            ]
        );
        assert!(buffer.is_sealed());
        assert!(buffer.drain_with(Vec::new()).is_empty());
    }

    #[test]
    fn sealed_buffer_passes_events_through() {
        let mut buffer = EventBuffer::new();
        buffer.drain_with(Vec::new());
        let event = WireEvent::Connected;
        assert_eq!(buffer.push(event.clone()), Some(event));
        assert!(buffer.is_empty());
    }
}
