// ABOUTME: Bounded set of already-seen transport event ids.
// ABOUTME: Guards against at-least-once delivery turning one message into two agent turns.

use std::collections::{HashSet, VecDeque};

pub struct EventDeduplicator {
    seen: HashSet<String>,
    order: VecDeque<String>,
    max_size: usize,
}

impl EventDeduplicator {
    pub fn new(max_size: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    /// True the first time an id is seen; oldest ids are forgotten past `max_size`
    pub fn check_and_mark(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return false;
        }

        if self.order.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(event_id.to_string());
        self.order.push_back(event_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(1000)
    }
}
