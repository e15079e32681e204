//! Deterministic timers for the session.
//!
//! The session owns three task handles; scheduling onto a handle cancels
//! whatever previously occupied it, which is the only cancellation
//! primitive. Due tasks fire in deadline order, FIFO on ties. The queue is
//! polled — `next_deadline` tells the driver how long to sleep, `pop_due`
//! hands back the tasks to run — so production and tests share the exact
//! same arithmetic.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// The session's scheduled-task handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSlot {
    Heartbeat,
    ConnectTimeout,
    Reconnect,
}

const SLOT_COUNT: usize = 3;

impl TaskSlot {
    fn index(self) -> usize {
        match self {
            TaskSlot::Heartbeat => 0,
            TaskSlot::ConnectTimeout => 1,
            TaskSlot::Reconnect => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    deadline: u64,
    order: u64,
    generation: u64,
    slot: TaskSlot,
    period: Option<u64>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.order.cmp(&other.order))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    active: [Option<u64>; SLOT_COUNT],
    next_generation: u64,
    next_order: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot task after `delay_ns`; replaces the slot's prior occupant.
    pub fn schedule_in(&mut self, slot: TaskSlot, now_ns: u64, delay_ns: u64) {
        self.schedule(slot, now_ns + delay_ns, None);
    }

    /// Recurring task every `period_ns`, first firing one period from now;
    /// replaces the slot's prior occupant.
    pub fn schedule_every(&mut self, slot: TaskSlot, now_ns: u64, period_ns: u64) {
        self.schedule(slot, now_ns + period_ns, Some(period_ns));
    }

    fn schedule(&mut self, slot: TaskSlot, deadline: u64, period: Option<u64>) {
        self.next_generation += 1;
        self.next_order += 1;
        self.active[slot.index()] = Some(self.next_generation);
        self.heap.push(Reverse(Entry {
            deadline,
            order: self.next_order,
            generation: self.next_generation,
            slot,
            period,
        }));
    }

    pub fn cancel(&mut self, slot: TaskSlot) {
        self.active[slot.index()] = None;
    }

    pub fn is_scheduled(&self, slot: TaskSlot) -> bool {
        self.active[slot.index()].is_some()
    }

    /// Earliest live deadline, if any. Prunes cancelled entries.
    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.active[entry.slot.index()] == Some(entry.generation) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// The next task due at or before `now_ns`, in deadline-then-schedule
    /// order. Recurring tasks re-arm themselves.
    pub fn pop_due(&mut self, now_ns: u64) -> Option<TaskSlot> {
        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if self.active[entry.slot.index()] != Some(entry.generation) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now_ns {
                return None;
            }
            self.heap.pop();
            if let Some(period) = entry.period {
                self.next_order += 1;
                self.heap.push(Reverse(Entry {
                    deadline: entry.deadline + period,
                    order: self.next_order,
                    ..entry
                }));
            } else {
                self.active[entry.slot.index()] = None;
            }
            return Some(entry.slot);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule_in(TaskSlot::Reconnect, 0, 30);
        queue.schedule_in(TaskSlot::Heartbeat, 0, 10);
        queue.schedule_in(TaskSlot::ConnectTimeout, 0, 20);

        assert_eq!(queue.next_deadline(), Some(10));
        assert_eq!(queue.pop_due(5), None);
        assert_eq!(queue.pop_due(30), Some(TaskSlot::Heartbeat));
        assert_eq!(queue.pop_due(30), Some(TaskSlot::ConnectTimeout));
        assert_eq!(queue.pop_due(30), Some(TaskSlot::Reconnect));
        assert_eq!(queue.pop_due(30), None);
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn equal_deadlines_fire_in_schedule_order() {
        let mut queue = TimerQueue::new();
        queue.schedule_in(TaskSlot::Reconnect, 0, 10);
        queue.schedule_in(TaskSlot::Heartbeat, 0, 10);
        assert_eq!(queue.pop_due(10), Some(TaskSlot::Reconnect));
        assert_eq!(queue.pop_due(10), Some(TaskSlot::Heartbeat));
    }

    #[test]
    fn rescheduling_a_slot_cancels_the_prior_task() {
        let mut queue = TimerQueue::new();
        queue.schedule_in(TaskSlot::Heartbeat, 0, 10);
        queue.schedule_in(TaskSlot::Heartbeat, 0, 50);

        assert_eq!(queue.next_deadline(), Some(50));
        assert_eq!(queue.pop_due(20), None);
        assert_eq!(queue.pop_due(50), Some(TaskSlot::Heartbeat));
        assert_eq!(queue.pop_due(100), None);
    }

    #[test]
    fn cancel_drops_the_task() {
        let mut queue = TimerQueue::new();
        queue.schedule_in(TaskSlot::ConnectTimeout, 0, 10);
        assert!(queue.is_scheduled(TaskSlot::ConnectTimeout));
        queue.cancel(TaskSlot::ConnectTimeout);
        assert!(!queue.is_scheduled(TaskSlot::ConnectTimeout));
        assert_eq!(queue.pop_due(100), None);
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn recurring_tasks_re_arm() {
        let mut queue = TimerQueue::new();
        queue.schedule_every(TaskSlot::Heartbeat, 0, 15);

        assert_eq!(queue.pop_due(14), None);
        assert_eq!(queue.pop_due(15), Some(TaskSlot::Heartbeat));
        assert_eq!(queue.pop_due(15), None);
        assert_eq!(queue.next_deadline(), Some(30));
        assert_eq!(queue.pop_due(45), Some(TaskSlot::Heartbeat));
        assert_eq!(queue.pop_due(45), Some(TaskSlot::Heartbeat));
        assert_eq!(queue.pop_due(45), None);

        queue.cancel(TaskSlot::Heartbeat);
        assert_eq!(queue.pop_due(1000), None);
    }

    #[test]
    fn one_shot_slot_frees_after_firing() {
        let mut queue = TimerQueue::new();
        queue.schedule_in(TaskSlot::Reconnect, 0, 10);
        assert_eq!(queue.pop_due(10), Some(TaskSlot::Reconnect));
        assert!(!queue.is_scheduled(TaskSlot::Reconnect));
    }
}
