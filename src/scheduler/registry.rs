use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Job {
    generation: u64,
    interval: Duration,
    due: Instant,
}

/// A job taken off the heap by [`Registry::take_due`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DueJob {
    pub feed_id: i64,
    pub generation: u64,
    pub interval: Duration,
    pub due: Instant,
}

/// Due times of registered feed jobs.
///
/// Heap entries are never removed in place. Replacing or removing a job bumps
/// or drops its generation, and entries with a stale generation are skipped
/// when they surface.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    heap: BinaryHeap<Reverse<(Instant, u64, i64)>>,
    jobs: HashMap<i64, Job>,
    next_generation: u64,
}

impl Registry {
    /// Register or replace the job for `feed_id`, due at `due`.
    pub fn insert(&mut self, feed_id: i64, interval: Duration, due: Instant) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.jobs.insert(
            feed_id,
            Job {
                generation,
                interval,
                due,
            },
        );
        self.heap.push(Reverse((due, generation, feed_id)));
        generation
    }

    /// Move an existing job to `due`, keeping its interval.
    pub fn reset(&mut self, feed_id: i64, due: Instant) -> bool {
        match self.jobs.get(&feed_id) {
            Some(job) => {
                let interval = job.interval;
                self.insert(feed_id, interval, due);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, feed_id: i64) -> bool {
        self.jobs.remove(&feed_id).is_some()
    }

    /// Remove the job only if it is still the one identified by `generation`.
    pub fn remove_generation(&mut self, feed_id: i64, generation: u64) -> bool {
        if self.jobs.get(&feed_id).is_some_and(|j| j.generation == generation) {
            self.jobs.remove(&feed_id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, feed_id: i64) -> bool {
        self.jobs.contains_key(&feed_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn interval(&self, feed_id: i64) -> Option<Duration> {
        self.jobs.get(&feed_id).map(|j| j.interval)
    }

    pub fn next_due(&self, feed_id: i64) -> Option<Instant> {
        self.jobs.get(&feed_id).map(|j| j.due)
    }

    /// Pop every live job due at or before `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<DueJob> {
        let mut due = Vec::new();
        while let Some(Reverse((at, generation, feed_id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(job) = self.jobs.get(&feed_id) {
                if job.generation == generation {
                    due.push(DueJob {
                        feed_id,
                        generation,
                        interval: job.interval,
                        due: at,
                    });
                }
            }
        }
        due
    }

    /// Put a taken job back, due at `due`. Ignored when the job was replaced
    /// or removed in the meantime.
    pub fn schedule(&mut self, feed_id: i64, generation: u64, due: Instant) -> bool {
        match self.jobs.get_mut(&feed_id) {
            Some(job) if job.generation == generation => {
                job.due = due;
                self.heap.push(Reverse((due, generation, feed_id)));
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_take_due_in_due_order() {
        let now = Instant::now();
        let mut registry = Registry::default();
        registry.insert(1, MINUTE, now + Duration::from_secs(5));
        registry.insert(2, MINUTE, now);
        registry.insert(3, MINUTE, now + Duration::from_secs(1));

        let ids: Vec<i64> = registry
            .take_due(now + Duration::from_secs(2))
            .iter()
            .map(|j| j.feed_id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(registry.take_due(now + Duration::from_secs(2)).is_empty());
        assert_eq!(registry.take_due(now + Duration::from_secs(5)).len(), 1);
    }

    #[test]
    fn test_replaced_and_removed_jobs_are_skipped() {
        let now = Instant::now();
        let mut registry = Registry::default();
        registry.insert(1, MINUTE, now);
        registry.insert(1, MINUTE * 2, now + MINUTE);
        registry.insert(2, MINUTE, now);
        assert!(registry.remove(2));
        assert!(!registry.remove(2));

        assert!(registry.take_due(now).is_empty());
        let due = registry.take_due(now + MINUTE);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].interval, MINUTE * 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_schedule_ignores_stale_generation() {
        let now = Instant::now();
        let mut registry = Registry::default();
        registry.insert(1, MINUTE, now);
        let job = registry.take_due(now).remove(0);

        // Replaced while the cycle was running
        registry.insert(1, MINUTE, now);
        assert!(!registry.schedule(1, job.generation, now + MINUTE));
        assert_eq!(registry.next_due(1), Some(now));

        let job = registry.take_due(now).remove(0);
        assert!(registry.schedule(1, job.generation, now + MINUTE));
        assert_eq!(registry.next_due(1), Some(now + MINUTE));
    }

    #[test]
    fn test_reset_keeps_interval() {
        let now = Instant::now();
        let mut registry = Registry::default();
        registry.insert(1, MINUTE * 3, now + MINUTE * 3);
        assert!(registry.reset(1, now));
        assert!(!registry.reset(9, now));

        let due = registry.take_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].interval, MINUTE * 3);
    }

    #[test]
    fn test_remove_generation_only_removes_current() {
        let now = Instant::now();
        let mut registry = Registry::default();
        let old = registry.insert(1, MINUTE, now);
        let new = registry.insert(1, MINUTE, now);
        assert!(!registry.remove_generation(1, old));
        assert!(registry.contains(1));
        assert!(registry.remove_generation(1, new));
        assert!(!registry.contains(1));
    }
}
