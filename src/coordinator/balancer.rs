use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Least-outstanding-load worker selection.
///
/// Each worker has an outstanding-task counter and the time of its last
/// assignment. Workers never seen count as 0 and as idle forever.
#[derive(Debug)]
pub struct LoadBalancer {
    inner: Mutex<Tables>,
    idle_window: Duration,
}

#[derive(Debug, Default)]
struct Tables {
    load: HashMap<usize, usize>,
    last_assigned: HashMap<usize, Instant>,
}

impl Tables {
    fn evict_idle(&mut self, now: Instant, window: Duration) {
        let stale: Vec<usize> = self
            .last_assigned
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > window)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            debug!(worker = id, "evicting idle balancer entry");
            self.last_assigned.remove(&id);
            self.load.remove(&id);
        }
    }

    /// Pick and charge in one step; `None` when `candidates` is empty
    fn pick(&mut self, candidates: impl Iterator<Item = usize>, now: Instant) -> Option<usize> {
        let chosen = candidates.min_by_key(|id| {
            (
                self.load.get(id).copied().unwrap_or(0),
                self.last_assigned.get(id).copied(),
                *id,
            )
        })?;
        *self.load.entry(chosen).or_insert(0) += 1;
        self.last_assigned.insert(chosen, now);
        Some(chosen)
    }
}

impl LoadBalancer {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
            idle_window,
        }
    }

    /// Least loaded worker in `0..worker_count`, oldest assignment first on ties
    pub fn pick_worker(&self, worker_count: usize) -> Option<usize> {
        let now = Instant::now();
        let mut tables = self.inner.lock().unwrap();
        tables.evict_idle(now, self.idle_window);
        tables.pick(0..worker_count, now)
    }

    /// Like `pick_worker` but skipping `excluded`, unless that leaves nobody
    pub fn pick_worker_excluding(&self, worker_count: usize, excluded: &[usize]) -> Option<usize> {
        let now = Instant::now();
        let mut tables = self.inner.lock().unwrap();
        tables.evict_idle(now, self.idle_window);

        let has_candidate = (0..worker_count).any(|id| !excluded.contains(&id));
        if has_candidate {
            tables.pick((0..worker_count).filter(|id| !excluded.contains(id)), now)
        } else {
            tables.pick(0..worker_count, now)
        }
    }

    /// Add one outstanding task to `worker_id` without a selection
    pub fn charge(&self, worker_id: usize) {
        let mut tables = self.inner.lock().unwrap();
        *tables.load.entry(worker_id).or_insert(0) += 1;
        tables.last_assigned.insert(worker_id, Instant::now());
    }

    pub fn on_task_complete(&self, worker_id: usize) {
        let mut tables = self.inner.lock().unwrap();
        if let Some(load) = tables.load.get_mut(&worker_id) {
            *load = load.saturating_sub(1);
        }
    }

    pub fn load_of(&self, worker_id: usize) -> usize {
        let tables = self.inner.lock().unwrap();
        tables.load.get(&worker_id).copied().unwrap_or(0)
    }

    /// Drop bookkeeping for workers not assigned anything within the idle window
    pub fn evict_idle(&self, now: Instant) {
        self.inner.lock().unwrap().evict_idle(now, self.idle_window);
    }

    pub fn clear(&self) {
        let mut tables = self.inner.lock().unwrap();
        tables.load.clear();
        tables.last_assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn balancer() -> LoadBalancer {
        LoadBalancer::new(Duration::from_secs(300))
    }

    #[test]
    fn test_unseen_workers_first_then_oldest() {
        let lb = balancer();
        assert_eq!(lb.pick_worker(3), Some(0));
        assert_eq!(lb.pick_worker(3), Some(1));
        assert_eq!(lb.pick_worker(3), Some(2));
        // all at load 1, worker 0 has waited longest
        assert_eq!(lb.pick_worker(3), Some(0));
    }

    #[test]
    fn test_completion_frees_capacity() {
        let lb = balancer();
        lb.pick_worker(2);
        lb.pick_worker(2);
        lb.pick_worker(2);
        assert_eq!(lb.load_of(0), 2);

        lb.on_task_complete(0);
        lb.on_task_complete(0);
        lb.on_task_complete(0);
        assert_eq!(lb.load_of(0), 0);
        assert_eq!(lb.pick_worker(2), Some(0));
    }

    #[test]
    fn test_exclusion_falls_back_when_everyone_excluded() {
        let lb = balancer();
        assert_eq!(lb.pick_worker_excluding(2, &[0]), Some(1));
        assert_eq!(lb.pick_worker_excluding(2, &[0]), Some(1));
        assert_eq!(lb.pick_worker_excluding(2, &[0, 1]), Some(0));
        assert_eq!(lb.pick_worker(0), None);
    }

    #[test]
    fn test_idle_entries_are_evicted() {
        let lb = LoadBalancer::new(Duration::from_millis(10));
        lb.pick_worker(1);
        assert_eq!(lb.load_of(0), 1);

        lb.evict_idle(Instant::now() + Duration::from_secs(1));
        assert_eq!(lb.load_of(0), 0);
    }

    proptest! {
        #[test]
        fn assignments_stay_within_one(workers in 1usize..12, picks in 0usize..200) {
            let lb = balancer();
            for _ in 0..picks {
                prop_assert!(lb.pick_worker(workers).is_some());
            }
            let loads: Vec<usize> = (0..workers).map(|w| lb.load_of(w)).collect();
            let max = *loads.iter().max().unwrap();
            let min = *loads.iter().min().unwrap();
            prop_assert!(max - min <= 1);
            prop_assert_eq!(loads.iter().sum::<usize>(), picks);
        }
    }
}
