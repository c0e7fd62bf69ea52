use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use crate::event::CapturedEvent;

/// What became of a push against a full queue. Evictions hand back the
/// displaced event so the caller can count and log it.
#[derive(Debug)]
pub enum QueuePush {
    Queued,
    Evicted(CapturedEvent),
    /// Every slot held a critical event, so the incoming one was refused.
    Refused(CapturedEvent),
}

/// FIFO dispatch queue with a hard capacity. When full, the oldest
/// non-critical event is evicted to make room; critical events are never
/// displaced.
pub struct DispatchQueue {
    events: VecDeque<CapturedEvent>,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        DispatchQueue {
            events: VecDeque::with_capacity(capacity.min(128)),
            capacity,
        }
    }

    pub fn push(&mut self, event: CapturedEvent) -> QueuePush {
        if self.events.len() < self.capacity {
            self.events.push_back(event);
            return QueuePush::Queued;
        }

        match self.events.iter().position(|held| !held.is_critical()) {
            Some(index) => {
                let evicted = self
                    .events
                    .remove(index)
                    .expect("eviction index is in bounds");
                self.events.push_back(event);
                QueuePush::Evicted(evicted)
            }
            None => QueuePush::Refused(event),
        }
    }

    /// Clone the current contents in order, leaving them in place. Flushes
    /// snapshot, send, then remove what was confirmed.
    pub fn snapshot(&self) -> Vec<CapturedEvent> {
        self.events.iter().cloned().collect()
    }

    /// Remove the snapshot members that are still queued. Events evicted
    /// while the flush was in flight are simply no longer present.
    pub fn remove_ids(&mut self, sent: &HashSet<Uuid>) -> usize {
        let before = self.events.len();
        self.events.retain(|event| !sent.contains(&event.uuid));
        before - self.events.len()
    }

    pub fn drain(&mut self) -> Vec<CapturedEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Holds events tracked before a session id exists. Overflow drops the
/// oldest entry; the whole buffer is released into the dispatch queue once
/// an identity appears.
pub struct PendingBuffer {
    events: VecDeque<CapturedEvent>,
    capacity: usize,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        PendingBuffer {
            events: VecDeque::new(),
            capacity,
        }
    }

    /// Returns the dropped oldest event when the buffer was already full.
    pub fn push(&mut self, event: CapturedEvent) -> Option<CapturedEvent> {
        let dropped = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        dropped
    }

    pub fn drain(&mut self) -> Vec<CapturedEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RawEvent, SESSION_START};
    use chrono::Utc;

    fn event(name: &str) -> CapturedEvent {
        CapturedEvent::from_raw(RawEvent::new(name), Utc::now(), None, None)
    }

    #[test]
    fn keeps_fifo_order() {
        let mut queue = DispatchQueue::new(10);
        for name in ["a", "b", "c"] {
            assert!(matches!(queue.push(event(name)), QueuePush::Queued));
        }

        let names: Vec<String> = queue.snapshot().into_iter().map(|e| e.event).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn full_queue_evicts_oldest_non_critical() {
        let mut queue = DispatchQueue::new(3);
        queue.push(event(SESSION_START));
        queue.push(event("old"));
        queue.push(event("mid"));

        match queue.push(event("new")) {
            QueuePush::Evicted(evicted) => assert_eq!(evicted.event, "old"),
            other => panic!("expected eviction, got {other:?}"),
        }

        let names: Vec<String> = queue.snapshot().into_iter().map(|e| e.event).collect();
        assert_eq!(names, vec![SESSION_START, "mid", "new"]);
    }

    #[test]
    fn queue_of_criticals_refuses_new_events() {
        let mut queue = DispatchQueue::new(2);
        queue.push(event(SESSION_START));
        queue.push(event(SESSION_START));

        match queue.push(event("ignored")) {
            QueuePush::Refused(refused) => assert_eq!(refused.event, "ignored"),
            other => panic!("expected refusal, got {other:?}"),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut queue = DispatchQueue::new(100);
        for i in 0..110 {
            queue.push(event(&format!("event_{i}")));
        }

        assert_eq!(queue.len(), 100);
        // ten oldest were evicted
        assert_eq!(queue.snapshot()[0].event, "event_10");
    }

    #[test]
    fn remove_ids_only_touches_named_events() {
        let mut queue = DispatchQueue::new(10);
        queue.push(event("a"));
        queue.push(event("b"));
        let sent: HashSet<Uuid> = queue.snapshot().iter().map(|e| e.uuid).collect();
        queue.push(event("late"));

        assert_eq!(queue.remove_ids(&sent), 2);
        let names: Vec<String> = queue.snapshot().into_iter().map(|e| e.event).collect();
        assert_eq!(names, vec!["late"]);
    }

    #[test]
    fn pending_buffer_drops_oldest_on_overflow() {
        let mut pending = PendingBuffer::new(2);
        assert!(pending.push(event("a")).is_none());
        assert!(pending.push(event("b")).is_none());
        let dropped = pending.push(event("c")).unwrap();

        assert_eq!(dropped.event, "a");
        let names: Vec<String> = pending.drain().into_iter().map(|e| e.event).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(pending.is_empty());
    }
}
