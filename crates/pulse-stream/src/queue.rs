//! Per-subscriber outbound queue.
//!
//! A bounded ring under a short `parking_lot` lock, with a `Notify` to wake
//! the single reader. `push` never waits: a full queue drops its oldest
//! message and records the loss, which the reader sees as an
//! [`StreamEvent::Overrun`] ahead of the next message.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::event::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest message.
    DroppedOldest,
    /// The queue is closed; the message was discarded.
    Closed,
}

#[derive(Debug, Default)]
struct State {
    items: VecDeque<StreamEvent>,
    /// Dropped since the last overrun notice.
    missed: u64,
    dropped_total: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct SubscriberQueue {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                ..State::default()
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: StreamEvent) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.missed += 1;
                state.dropped_total += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.items.push_back(event);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Next event without waiting. A pending overrun notice comes first.
    pub fn try_recv(&self) -> Option<StreamEvent> {
        let mut state = self.state.lock();
        if state.missed > 0 {
            let missed = std::mem::take(&mut state.missed);
            return Some(StreamEvent::Overrun { missed });
        }
        state.items.pop_front()
    }

    /// Wait for the next event. Returns `None` once the queue is closed and
    /// nothing is left to deliver.
    pub async fn recv(&self) -> Option<StreamEvent> {
        loop {
            {
                let state = self.state.lock();
                if state.closed && state.items.is_empty() && state.missed == 0 {
                    return None;
                }
            }
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting messages and wake the reader. Queued messages can
    /// still be drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages dropped over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped_total
    }
}
