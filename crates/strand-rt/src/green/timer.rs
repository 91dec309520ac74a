// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer queue.
//!
//! Min-heap of deadlines with lazily discarded cancellations. Timers with
//! the same deadline fire in registration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// Handle used to cancel a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub(crate) type TimerCallback = Box<dyn FnOnce()>;

pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, TimerCallback>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            callbacks: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((deadline, seq)));
        self.callbacks.insert(seq, callback);
        TimerId(seq)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id.0).is_some()
    }

    /// Earliest live deadline, discarding cancelled heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if self.callbacks.contains_key(&seq) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop one callback whose deadline is at or before `now`.
    ///
    /// Callers fire one at a time so a callback may cancel later timers.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerCallback> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&seq) {
                return Some(callback);
            }
        }
        None
    }

    pub fn clear(&mut self) -> Vec<TimerCallback> {
        self.heap.clear();
        self.callbacks.drain().map(|(_, cb)| cb).collect()
    }
}
