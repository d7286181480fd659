use crate::types::BlockKey;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Entries {
    owner: BTreeMap<BlockKey, usize>,
    pending: BTreeSet<BlockKey>,
}

/// Which worker owns each block, and which blocks still lack a result.
///
/// A block has exactly one owner at a time; assigning it again replaces the
/// previous owner in the same critical section.
#[derive(Debug, Default)]
pub struct AssignmentLedger {
    entries: Mutex<Entries>,
}

impl AssignmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `key` to `worker_id` and mark it pending; returns the previous owner
    pub fn assign(&self, key: BlockKey, worker_id: usize) -> Option<usize> {
        let mut entries = self.entries.lock().unwrap();
        entries.pending.insert(key);
        entries.owner.insert(key, worker_id)
    }

    pub fn owner(&self, key: BlockKey) -> Option<usize> {
        self.entries.lock().unwrap().owner.get(&key).copied()
    }

    pub fn is_pending(&self, key: BlockKey) -> bool {
        self.entries.lock().unwrap().pending.contains(&key)
    }

    /// Clear the pending flag; returns the owner if the block was pending
    pub fn mark_complete(&self, key: BlockKey) -> Option<usize> {
        let mut entries = self.entries.lock().unwrap();
        if entries.pending.remove(&key) {
            entries.owner.get(&key).copied()
        } else {
            None
        }
    }

    /// Pending blocks currently owned by `worker_id`, in grid order
    pub fn blocks_of(&self, worker_id: usize) -> Vec<BlockKey> {
        let entries = self.entries.lock().unwrap();
        entries
            .pending
            .iter()
            .filter(|k| entries.owner.get(k) == Some(&worker_id))
            .copied()
            .collect()
    }

    #[cfg(test)]
    pub fn pending(&self) -> Vec<BlockKey> {
        self.entries.lock().unwrap().pending.iter().copied().collect()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.owner.clear();
        entries.pending.clear();
    }
}
