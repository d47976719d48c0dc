use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::rc::Weak;
use std::time::{Duration, Instant};

use super::TimerHandler;

/// Repeating timers never fire more often than this.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Repeating,
}

struct TimerEntry {
    deadline: Instant,
    period: Duration,
    mode: TimerMode,
    handler: Weak<dyn TimerHandler>,
}

/// Deadline-ordered timer set. Cancelled entries are dropped from the map
/// immediately and skipped lazily when they surface in the heap.
#[derive(Default)]
pub(super) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn schedule(
        &mut self,
        now: Instant,
        after: Duration,
        mode: TimerMode,
        handler: Weak<dyn TimerHandler>,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let period = match mode {
            TimerMode::OneShot => after,
            TimerMode::Repeating => after.max(MIN_PERIOD),
        };
        let deadline = now + period;
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(
            id,
            TimerEntry {
                deadline,
                period,
                mode,
                handler,
            },
        );
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Earliest live deadline, discarding stale heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            match self.entries.get(&id) {
                Some(entry) if entry.deadline == deadline => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop one timer due at `now`. One-shot timers are removed, repeating
    /// timers are pushed back one period past `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, Weak<dyn TimerHandler>)> {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                return None;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.deadline != deadline {
                continue;
            }

            if entry.mode == TimerMode::Repeating {
                entry.deadline = now + entry.period;
                let handler = entry.handler.clone();
                self.heap.push(Reverse((entry.deadline, id)));
                return Some((id, handler));
            }
            return self.entries.remove(&id).map(|entry| (id, entry.handler));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    struct Noop;
    impl TimerHandler for Noop {
        fn handle_timeout(&self, _timer: TimerId) {}
    }

    fn handler(rc: &Rc<Noop>) -> Weak<dyn TimerHandler> {
        let weak: Weak<Noop> = Rc::downgrade(rc);
        weak
    }

    #[test]
    fn test_one_shot_fires_once() {
        let noop = Rc::new(Noop);
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let id = queue.schedule(now, Duration::from_millis(10), TimerMode::OneShot, handler(&noop));

        assert!(queue.pop_due(now).is_none());
        let later = now + Duration::from_millis(10);
        assert_eq!(queue.pop_due(later).map(|(t, _)| t), Some(id));
        assert!(queue.pop_due(later + Duration::from_secs(1)).is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let noop = Rc::new(Noop);
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let id = queue.schedule(now, Duration::ZERO, TimerMode::OneShot, handler(&noop));

        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.pop_due(now + Duration::from_secs(1)).is_none());
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn test_deadline_order() {
        let noop = Rc::new(Noop);
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let late = queue.schedule(now, Duration::from_millis(50), TimerMode::OneShot, handler(&noop));
        let early = queue.schedule(now, Duration::from_millis(5), TimerMode::OneShot, handler(&noop));

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(5)));
        let end = now + Duration::from_secs(1);
        assert_eq!(queue.pop_due(end).map(|(t, _)| t), Some(early));
        assert_eq!(queue.pop_due(end).map(|(t, _)| t), Some(late));
    }

    #[test]
    fn test_repeating_reschedules() {
        let noop = Rc::new(Noop);
        let mut queue = TimerQueue::default();
        let now = Instant::now();
        let id = queue.schedule(now, Duration::from_millis(10), TimerMode::Repeating, handler(&noop));

        let first = now + Duration::from_millis(10);
        assert_eq!(queue.pop_due(first).map(|(t, _)| t), Some(id));
        assert!(queue.pop_due(first).is_none());
        assert_eq!(queue.next_deadline(), Some(first + Duration::from_millis(10)));
        assert_eq!(queue.len(), 1);
    }
}
