//! Deferred Actions
//!
//! A tick-keyed queue for actions that must fire after a delay (the
//! post-win lobby hop, countdown steps). Entries due on the same tick fire
//! in scheduling order.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::TICK_RATE;

/// Convert a wall duration to whole ticks, rounding up.
pub fn duration_to_ticks(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    (millis * TICK_RATE as u64).div_ceil(1000)
}

/// Actions keyed by due tick.
#[derive(Clone, Debug)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(u64, u64), T>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` at `due_tick`.
    pub fn schedule_at(&mut self, due_tick: u64, action: T) {
        self.next_seq += 1;
        self.entries.insert((due_tick, self.next_seq), action);
    }

    /// Schedule `action` `delay` after `now`.
    pub fn schedule(&mut self, now: u64, delay: Duration, action: T) {
        self.schedule_at(now + duration_to_ticks(delay), action);
    }

    /// Remove and return every action due at or before `now`.
    pub fn drain_due(&mut self, now: u64) -> Vec<T> {
        let later = self.entries.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut self.entries, later);
        due.into_values().collect()
    }

    /// Drop everything pending.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
