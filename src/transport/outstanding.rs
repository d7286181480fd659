use crate::types::BlockResultChunk;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Sender-side record of chunks awaiting acknowledgement.
///
/// Entries are keyed by `"{row}_{col}_{index}"`. The send timestamp and the
/// cached chunk live in separate maps, so an entry can outlive its cached copy;
/// such entries are dropped on the next sweep instead of being resent forever.
#[derive(Debug, Default)]
pub struct OutstandingChunks {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    sent_at: HashMap<String, Instant>,
    cache: HashMap<String, BlockResultChunk>,
}

impl OutstandingChunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a chunk as sent at `now`
    pub fn track(&self, chunk: &BlockResultChunk, now: Instant) {
        let id = chunk.tracking_id();
        let mut tables = self.inner.lock().unwrap();
        tables.sent_at.insert(id.clone(), now);
        tables.cache.insert(id, chunk.clone());
    }

    /// Retire an entry; returns whether it was being tracked
    pub fn acknowledge(&self, tracking_id: &str) -> bool {
        let mut tables = self.inner.lock().unwrap();
        tables.cache.remove(tracking_id);
        tables.sent_at.remove(tracking_id).is_some()
    }

    /// Chunks unacknowledged for longer than `timeout`.
    ///
    /// Their timestamps are refreshed to `now`, so each sweep resends a chunk
    /// at most once. Entries without a cached chunk are removed.
    pub fn due_for_resend(&self, now: Instant, timeout: Duration) -> Vec<BlockResultChunk> {
        let mut tables = self.inner.lock().unwrap();
        let Tables { sent_at, cache } = &mut *tables;

        let overdue: Vec<String> = sent_at
            .iter()
            .filter(|(_, sent)| now.saturating_duration_since(**sent) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut resend = Vec::with_capacity(overdue.len());
        for id in overdue {
            match cache.get(&id) {
                Some(chunk) => {
                    sent_at.insert(id, now);
                    resend.push(chunk.clone());
                }
                None => {
                    warn!(chunk = %id, "no cached copy for unacknowledged chunk, dropping");
                    sent_at.remove(&id);
                }
            }
        }
        resend.sort_by_key(|c| (c.key, c.index));
        resend
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sent_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn evict_cached(&self, tracking_id: &str) {
        self.inner.lock().unwrap().cache.remove(tracking_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockKey;

    fn chunk(index: usize) -> BlockResultChunk {
        BlockResultChunk {
            key: BlockKey::new(0, 1),
            index,
            total: 2,
            data: "{}".to_string(),
            worker_id: 1,
        }
    }

    #[test]
    fn test_ack_retires_entry() {
        let table = OutstandingChunks::new();
        let now = Instant::now();
        table.track(&chunk(0), now);
        table.track(&chunk(1), now);

        assert!(table.acknowledge("0_1_0"));
        assert!(!table.acknowledge("0_1_0"));
        assert_eq!(table.len(), 1);

        let later = now + Duration::from_secs(10);
        let due = table.due_for_resend(later, Duration::from_secs(3));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].index, 1);
    }

    #[test]
    fn test_resend_refreshes_timestamp() {
        let table = OutstandingChunks::new();
        let now = Instant::now();
        table.track(&chunk(0), now);

        assert!(table.due_for_resend(now + Duration::from_secs(1), Duration::from_secs(3)).is_empty());

        let t1 = now + Duration::from_secs(4);
        assert_eq!(table.due_for_resend(t1, Duration::from_secs(3)).len(), 1);
        // just resent at t1
        assert!(table.due_for_resend(t1 + Duration::from_secs(1), Duration::from_secs(3)).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_missing_cache_entry_is_dropped() {
        let table = OutstandingChunks::new();
        let now = Instant::now();
        table.track(&chunk(0), now);
        table.evict_cached("0_1_0");

        let due = table.due_for_resend(now + Duration::from_secs(5), Duration::from_secs(3));
        assert!(due.is_empty());
        assert!(table.is_empty());
    }
}
