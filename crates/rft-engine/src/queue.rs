//! Thread-safe event FIFO coupling the socket driver to the dispatcher.
//!
//! Producers (driver, timers, blocking workers) push and wake one waiter;
//! the dispatcher blocks on `wait` and drains with `pop`. Wakeups may be
//! spurious — callers always re-check by popping.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::event::Event;

/// Queue capacity. Overflow drops the incoming event — datagram semantics;
/// the retransmission machinery recovers anything that mattered.
const CAPACITY: usize = 1024;

pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    ready: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
        }
    }

    /// Enqueue an event and wake one waiter. Returns false when the queue
    /// is full and the event was dropped.
    pub fn push(&self, event: Event) -> bool {
        {
            let mut events = self.events.lock().unwrap();
            if events.len() >= CAPACITY {
                tracing::warn!(capacity = CAPACITY, "event queue full, dropping event");
                return false;
            }
            events.push_back(event);
        }
        self.ready.notify_one();
        true
    }

    pub fn pop(&self) -> Option<Event> {
        self.events.lock().unwrap().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Block until the queue is (probably) non-empty.
    pub async fn wait(&self) {
        loop {
            // Register interest before the emptiness check so a push
            // between the two cannot lose the wakeup.
            let notified = self.ready.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
