//! Min-heap timer queue with lazy cancellation.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

/// Opaque handle returned by [`TimerWheel::schedule`], used to cancel a
/// pending timer.
pub type TimerId = u64;

struct TimerEntry {
    id: TimerId,
    deadline_ms: u64,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ms == other.deadline_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // among ties, the earliest insertion) sorts first.
        other
            .deadline_ms
            .cmp(&self.deadline_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single-threaded min-heap of pending timers, ordered by deadline and
/// tie-broken by insertion order. Cancellation is lazy: a cancelled entry
/// stays in the heap until it is popped by [`TimerWheel::process_expired`]
/// and is then silently discarded.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<TimerEntry>,
    next_id: TimerId,
    next_seq: u64,
    flags: crate::hash::HashMap<TimerId, Rc<Cell<bool>>>,
}

impl TimerWheel {
    /// Creates an empty timer wheel.
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
            next_id: 1,
            next_seq: 0,
            flags: crate::hash::HashMap::default(),
        }
    }

    /// Schedules a one-shot timer `delay_ms` from `now_ms`. Returns an id
    /// usable with [`TimerWheel::cancel`].
    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64) -> TimerId {
        self.schedule_at(now_ms.saturating_add(delay_ms))
    }

    /// Schedules a one-shot timer at an absolute deadline.
    pub fn schedule_at(&mut self, deadline_ms: u64) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        let cancelled = Rc::new(Cell::new(false));
        self.flags.insert(id, cancelled.clone());
        self.heap.push(TimerEntry {
            id,
            deadline_ms,
            seq,
            cancelled,
        });
        id
    }

    /// Cancels a pending timer. Returns `true` if the id was found and had
    /// not already fired or been cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.flags.remove(&id) {
            Some(flag) if !flag.get() => {
                flag.set(true);
                true
            }
            _ => false,
        }
    }

    /// Pops and fires every timer whose deadline has passed, returning the
    /// fired ids in deadline order (cancelled entries are skipped and not
    /// counted). Safe to call again from inside a fired timer's effects
    /// since popping happens before the caller runs any callback logic.
    pub fn process_expired(&mut self, now_ms: u64) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline_ms > now_ms {
                break;
            }
            let entry = self.heap.pop().expect("peeked Some");
            if !entry.cancelled.get() {
                fired.push(entry.id);
            }
        }
        fired
    }

    /// Milliseconds until the next non-cancelled timer fires, `Some(0)` if
    /// one has already expired, or `None` if the wheel holds no live
    /// timers.
    pub fn next_deadline_ms(&self, now_ms: u64) -> Option<u64> {
        self.heap
            .iter()
            .filter(|e| !e.cancelled.get())
            .map(|e| e.deadline_ms.saturating_sub(now_ms))
            .min()
    }

    /// Number of entries still in the heap, including cancelled ones not
    /// yet popped.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if no timers, cancelled or live, remain in the heap.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let a = wheel.schedule(0, 30);
        let b = wheel.schedule(0, 10);
        let c = wheel.schedule(0, 20);

        let fired = wheel.process_expired(30);
        assert_eq!(fired, vec![b, c, a]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut wheel = TimerWheel::new();
        let a = wheel.schedule_at(100);
        let b = wheel.schedule_at(100);
        let fired = wheel.process_expired(100);
        assert_eq!(fired, vec![a, b]);
    }

    #[test]
    fn cancel_before_fire_is_skipped() {
        let mut wheel = TimerWheel::new();
        let a = wheel.schedule(0, 10);
        let b = wheel.schedule(0, 20);
        assert!(wheel.cancel(a));
        let fired = wheel.process_expired(100);
        assert_eq!(fired, vec![b]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut wheel = TimerWheel::new();
        let a = wheel.schedule(0, 10);
        assert!(wheel.cancel(a));
        assert!(!wheel.cancel(a));
    }

    #[test]
    fn next_deadline_reflects_only_live_timers() {
        let mut wheel = TimerWheel::new();
        let a = wheel.schedule(0, 10);
        wheel.schedule(0, 50);
        assert_eq!(wheel.next_deadline_ms(0), Some(10));
        wheel.cancel(a);
        assert_eq!(wheel.next_deadline_ms(0), Some(50));
    }

    #[test]
    fn empty_wheel_has_no_deadline() {
        let wheel = TimerWheel::new();
        assert_eq!(wheel.next_deadline_ms(0), None);
        assert!(wheel.is_empty());
    }

    #[test]
    fn already_expired_returns_zero() {
        let mut wheel = TimerWheel::new();
        wheel.schedule_at(5);
        assert_eq!(wheel.next_deadline_ms(10), Some(0));
    }
}
