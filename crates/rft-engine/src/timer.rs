//! Re-armable deadline timers posting into the event queue.
//!
//! Each entity (connection or pending request) owns exactly one timer that
//! is re-armed in place. Cancellation is best-effort: a sleep task that has
//! already fired re-checks its generation and the wall clock before posting
//! anything, so a callback racing its own cancellation is a no-op.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::event::{Event, TimerKind};
use crate::queue::EventQueue;

#[derive(Clone)]
pub struct TransferTimer {
    queue: Arc<EventQueue>,
    state: Arc<Mutex<TimerState>>,
}

struct TimerState {
    generation: u64,
    deadline: Option<Instant>,
}

impl TransferTimer {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            state: Arc::new(Mutex::new(TimerState {
                generation: 0,
                deadline: None,
            })),
        }
    }

    /// Arm (or re-arm) the timer. A previously armed deadline is superseded.
    pub fn arm(&self, timeout: Duration, kind: TimerKind) {
        let deadline = Instant::now() + timeout;
        let generation = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.deadline = Some(deadline);
            state.generation
        };

        let queue = self.queue.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = state.lock().unwrap();
                if state.generation != generation {
                    // Cancelled or re-armed while we slept.
                    return;
                }
                if Instant::now() < deadline {
                    return;
                }
                state.deadline = None;
            }
            queue.push(Event::Timer(kind));
        });
    }

    /// Idempotent cancel; an already-enqueued firing becomes a no-op.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().deadline.is_some()
    }
}
