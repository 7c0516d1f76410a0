use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Opaque identifier correlating a scheduled timer with a cancellation
/// request.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[display("timer#{0}")]
pub struct TimerHandle(u64);

#[derive(Copy, Clone, Debug)]
struct Entry {
    when: Instant,
    id: u64,
    interval: Option<Duration>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.when == other.when
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed, so the binary max-heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Deadline-ordered queue of scheduled timers.
///
/// Cancellation is lazy: cancelled entries stay in the heap until their
/// deadline passes and are skipped when popped. Cancelling an already-fired
/// or already-cancelled handle is a no-op, never an error.
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    armed: HashSet<u64>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            armed: empty!(),
            next_id: 0,
        }
    }

    /// Schedules a one-shot timer expiring at `when`.
    pub fn schedule_at(&mut self, when: Instant) -> TimerHandle {
        self.arm(when, None)
    }

    /// Schedules a one-shot timer expiring `delay` from now.
    pub fn schedule_after(&mut self, delay: Duration) -> TimerHandle {
        self.arm(Instant::now() + delay, None)
    }

    /// Schedules a periodic timer firing every `interval`, first at
    /// `now + interval`, re-armed automatically until cancelled.
    pub fn schedule_every(&mut self, interval: Duration) -> TimerHandle {
        self.arm(Instant::now() + interval, Some(interval))
    }

    fn arm(&mut self, when: Instant, interval: Option<Duration>) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.armed.insert(id);
        self.heap.push(Entry { when, id, interval });
        TimerHandle(id)
    }

    /// Disarms a timer. Idempotent; races safely with firing since a timer
    /// which already fired is simply no longer armed.
    pub fn cancel(&mut self, timer: TimerHandle) {
        self.armed.remove(&timer.0);
    }

    /// Whether the timer is still scheduled to fire.
    pub fn is_armed(&self, timer: TimerHandle) -> bool {
        self.armed.contains(&timer.0)
    }

    /// Pops the next timer due at or before `now`, re-arming periodic
    /// entries. Returns `None` once no armed timer is due.
    pub fn pop_expired(&mut self, now: Instant) -> Option<TimerHandle> {
        while let Some(head) = self.heap.peek() {
            if !self.armed.contains(&head.id) {
                self.heap.pop();
                continue;
            }
            if head.when > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry is present");
            match entry.interval {
                Some(interval) => self.heap.push(Entry {
                    when: now + interval,
                    ..entry
                }),
                None => {
                    self.armed.remove(&entry.id);
                }
            }
            return Some(TimerHandle(entry.id));
        }
        None
    }

    /// Distance to the next armed deadline, bounded from above by `ceiling`;
    /// used to cap the multiplexer wait so timers fire on time.
    pub fn next_timeout(&mut self, ceiling: Duration, now: Instant) -> Duration {
        while let Some(head) = self.heap.peek() {
            if self.armed.contains(&head.id) {
                return ceiling.min(head.when.saturating_duration_since(now));
            }
            self.heap.pop();
        }
        ceiling
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        TimerQueue::new()
    }
}
