use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct WorkerHealth {
    last_heartbeat: Instant,
    failures: u32,
}

/// Heartbeat bookkeeping per worker.
///
/// A worker is unhealthy once its last heartbeat is older than the timeout or
/// its consecutive failure count reaches the ceiling.
#[derive(Debug)]
pub struct HealthMonitor {
    workers: Mutex<HashMap<usize, WorkerHealth>>,
    timeout: Duration,
    failure_ceiling: u32,
}

impl HealthMonitor {
    pub fn new(timeout: Duration, failure_ceiling: u32) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            timeout,
            failure_ceiling: failure_ceiling.max(1),
        }
    }

    /// Refresh the worker's heartbeat and clear its failures
    pub fn record_heartbeat(&self, worker_id: usize) {
        self.record_heartbeat_at(worker_id, Instant::now());
    }

    pub fn record_heartbeat_at(&self, worker_id: usize, now: Instant) {
        let mut workers = self.workers.lock().unwrap();
        workers.insert(
            worker_id,
            WorkerHealth {
                last_heartbeat: now,
                failures: 0,
            },
        );
    }

    /// Start the clock for a worker that has not sent a heartbeat yet
    pub fn watch(&self, worker_id: usize) {
        let mut workers = self.workers.lock().unwrap();
        workers.entry(worker_id).or_insert(WorkerHealth {
            last_heartbeat: Instant::now(),
            failures: 0,
        });
    }

    pub fn record_failure(&self, worker_id: usize) {
        let mut workers = self.workers.lock().unwrap();
        let entry = workers.entry(worker_id).or_insert(WorkerHealth {
            last_heartbeat: Instant::now(),
            failures: 0,
        });
        entry.failures += 1;
    }

    pub fn unhealthy_workers(&self) -> Vec<usize> {
        self.unhealthy_workers_at(Instant::now())
    }

    pub fn unhealthy_workers_at(&self, now: Instant) -> Vec<usize> {
        let workers = self.workers.lock().unwrap();
        let mut ids: Vec<usize> = workers
            .iter()
            .filter(|(_, h)| {
                now.saturating_duration_since(h.last_heartbeat) > self.timeout
                    || h.failures >= self.failure_ceiling
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&self) {
        self.workers.lock().unwrap().clear();
    }
}
