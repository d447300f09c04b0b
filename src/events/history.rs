use super::Event;
use std::collections::VecDeque;
use std::sync::Arc;

/// Bounded FIFO buffer of emitted events
#[derive(Debug)]
pub(crate) struct EventHistory {
    capacity: usize,
    events: VecDeque<Arc<Event>>,
}

impl EventHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append, evicting the oldest entries beyond capacity. Returns how many were evicted.
    pub(crate) fn push(&mut self, event: Arc<Event>) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        let mut evicted = 0;
        while self.events.len() >= self.capacity {
            self.events.pop_front();
            evicted += 1;
        }
        self.events.push_back(event);
        evicted
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Event>> {
        self.events.iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }
}
