//! Hashed wheel timer for idle connections.
//!
//! ```text
//!            current
//!               │
//!   ┌────┬────┬─▼──┬────┬────┬────┐
//!   │ b0 │ b1 │ b2 │ b3 │ .. │ bN │   one bucket per interval
//!   └────┴────┴─┬──┴────┴────┴────┘
//!               ▼
//!          [key 7, rot 0] ⇄ [key 3, rot 1] ⇄ ...
//! ```
//!
//! Entries live in an arena indexed by key (the connection slot); bucket
//! lists are linked through arena indices, so insert and delete are O(1).
//! `tick()` walks one bucket and advances the wheel.
//!
//! The wheel is driven by a single thread and has no internal lock.

use std::time::{Duration, Instant};

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    /// Bucket holding this entry, `NIL` when not scheduled.
    bucket: usize,
    /// Full wheel turns left before expiry.
    rotation: usize,
    prev: usize,
    next: usize,
}

impl TimerEntry {
    const UNSCHEDULED: Self = Self {
        bucket: NIL,
        rotation: 0,
        prev: NIL,
        next: NIL,
    };

    #[inline]
    fn is_scheduled(&self) -> bool {
        self.bucket != NIL
    }
}

pub struct HashedWheelTimer {
    entries: Vec<TimerEntry>,
    heads: Vec<usize>,
    current: usize,
    interval: Duration,
    len: usize,
}

impl HashedWheelTimer {
    /// `buckets` slices of `interval` each; `capacity` pre-sizes the arena
    /// (keys beyond it grow the arena on demand).
    pub fn new(buckets: usize, interval: Duration, capacity: usize) -> Self {
        let buckets = buckets.max(1);
        let interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };
        Self {
            entries: vec![TimerEntry::UNSCHEDULED; capacity],
            heads: vec![NIL; buckets],
            current: 0,
            interval,
            len: 0,
        }
    }

    /// Schedule `key` to expire at `deadline`, replacing any earlier schedule.
    pub fn add_timer(&mut self, key: usize, deadline: Instant) {
        self.add_timer_at(key, deadline, Instant::now());
    }

    /// As [`add_timer`](Self::add_timer) with an explicit notion of now.
    pub fn add_timer_at(&mut self, key: usize, deadline: Instant, now: Instant) {
        if key >= self.entries.len() {
            self.entries.resize(key + 1, TimerEntry::UNSCHEDULED);
        }
        self.del_timer(key);

        let total = self.intervals_until(deadline, now);
        let nbuckets = self.heads.len();
        let bucket = (self.current + total % nbuckets) % nbuckets;
        let head = self.heads[bucket];

        self.entries[key] = TimerEntry {
            bucket,
            rotation: total / nbuckets,
            prev: NIL,
            next: head,
        };
        if head != NIL {
            self.entries[head].prev = key;
        }
        self.heads[bucket] = key;
        self.len += 1;
    }

    /// Unschedule `key`. No-op if it is not scheduled.
    pub fn del_timer(&mut self, key: usize) {
        let Some(entry) = self.entries.get(key).copied() else {
            return;
        };
        if !entry.is_scheduled() {
            return;
        }
        if entry.prev != NIL {
            self.entries[entry.prev].next = entry.next;
        } else {
            self.heads[entry.bucket] = entry.next;
        }
        if entry.next != NIL {
            self.entries[entry.next].prev = entry.prev;
        }
        self.entries[key] = TimerEntry::UNSCHEDULED;
        self.len -= 1;
    }

    /// Expire the current bucket, then advance one position.
    ///
    /// `on_expire` is called once per expired key, after the key has been
    /// unscheduled.
    pub fn tick(&mut self, mut on_expire: impl FnMut(usize)) {
        let mut cursor = self.heads[self.current];
        while cursor != NIL {
            let next = self.entries[cursor].next;
            if self.entries[cursor].rotation > 0 {
                self.entries[cursor].rotation -= 1;
            } else {
                self.del_timer(cursor);
                on_expire(cursor);
            }
            cursor = next;
        }
        self.current = (self.current + 1) % self.heads.len();
    }

    #[inline]
    pub fn contains(&self, key: usize) -> bool {
        self.entries.get(key).is_some_and(TimerEntry::is_scheduled)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn buckets(&self) -> usize {
        self.heads.len()
    }

    /// `ceil((deadline - now) / interval)`, 0 for past deadlines.
    fn intervals_until(&self, deadline: Instant, now: Instant) -> usize {
        let remaining = deadline.saturating_duration_since(now).as_nanos();
        let step = self.interval.as_nanos();
        usize::try_from(remaining.div_ceil(step)).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMERS: usize = 20;
    const SECOND: Duration = Duration::from_secs(1);

    fn wheel_with_staggered_timers() -> (HashedWheelTimer, Instant) {
        let mut timer = HashedWheelTimer::new(10, SECOND, TIMERS);
        let now = Instant::now();
        for i in 0..TIMERS {
            timer.add_timer_at(i, now + SECOND * i as u32, now);
        }
        (timer, now)
    }

    fn run_ticks(timer: &mut HashedWheelTimer, ticks: usize) -> Vec<usize> {
        let mut fired = vec![0usize; TIMERS];
        for _ in 0..ticks {
            timer.tick(|key| fired[key] += 1);
        }
        fired
    }

    #[test]
    fn test_all_timers_fire_once() {
        let (mut timer, _) = wheel_with_staggered_timers();
        assert_eq!(timer.len(), TIMERS);
        let fired = run_ticks(&mut timer, TIMERS + 1);
        assert!(fired.iter().all(|&n| n == 1), "{fired:?}");
        assert!(timer.is_empty());
    }

    #[test]
    fn test_fire_order_follows_deadline() {
        let (mut timer, _) = wheel_with_staggered_timers();
        let mut order = Vec::new();
        for _ in 0..=TIMERS {
            timer.tick(|key| order.push(key));
        }
        assert_eq!(order, (0..TIMERS).collect::<Vec<_>>());
    }

    #[test]
    fn test_removed_timers_never_fire() {
        let (mut timer, _) = wheel_with_staggered_timers();
        for key in [2, 7, 11] {
            timer.del_timer(key);
            assert!(!timer.contains(key));
        }
        // deleting twice is harmless
        timer.del_timer(7);
        assert_eq!(timer.len(), TIMERS - 3);

        let fired = run_ticks(&mut timer, TIMERS + 1);
        for (key, count) in fired.iter().enumerate() {
            let expected = usize::from(![2, 7, 11].contains(&key));
            assert_eq!(*count, expected, "key {key}");
        }
    }

    #[test]
    fn test_readd_replaces_schedule() {
        let mut timer = HashedWheelTimer::new(10, SECOND, TIMERS);
        let now = Instant::now();
        for i in 0..TIMERS {
            timer.add_timer_at(i, now + SECOND * 1000, now);
        }
        for i in 0..TIMERS {
            timer.add_timer_at(i, now + SECOND, now);
        }
        assert_eq!(timer.len(), TIMERS);

        let fired = run_ticks(&mut timer, 3);
        assert!(fired.iter().all(|&n| n == 1), "{fired:?}");
        assert!(timer.is_empty());
    }

    #[test]
    fn test_past_deadline_fires_next_tick() {
        let mut timer = HashedWheelTimer::new(4, SECOND, 1);
        let now = Instant::now();
        timer.add_timer_at(0, now, now + SECOND * 5);
        let mut fired = Vec::new();
        timer.tick(|key| fired.push(key));
        assert_eq!(fired, vec![0]);
    }

    #[test]
    fn test_rotation_spans_multiple_turns() {
        let mut timer = HashedWheelTimer::new(3, SECOND, 1);
        let now = Instant::now();
        timer.add_timer_at(0, now + SECOND * 7, now);
        let mut fired_at = None;
        for t in 1..=10 {
            timer.tick(|_| fired_at = Some(t));
            if fired_at.is_some() {
                break;
            }
        }
        assert_eq!(fired_at, Some(8));
    }

    #[test]
    fn test_unlink_middle_of_bucket() {
        let mut timer = HashedWheelTimer::new(2, SECOND, 4);
        let now = Instant::now();
        // all land in the same bucket
        for key in 0..4 {
            timer.add_timer_at(key, now, now);
        }
        timer.del_timer(2);
        timer.del_timer(0);
        let mut fired = Vec::new();
        timer.tick(|key| fired.push(key));
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 3]);
    }

    #[test]
    fn test_arena_grows_for_large_keys() {
        let mut timer = HashedWheelTimer::new(2, SECOND, 1);
        let now = Instant::now();
        timer.add_timer_at(40, now, now);
        assert!(timer.contains(40));
        assert!(!timer.contains(39));
        let mut fired = Vec::new();
        timer.tick(|key| fired.push(key));
        assert_eq!(fired, vec![40]);
    }
}
