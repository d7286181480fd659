use crate::types::BlockKey;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct BlockRecord {
    retries: u32,
    errors: Vec<String>,
}

/// Per-block retry budget and error history
#[derive(Debug)]
pub struct BlockRetryTracker {
    blocks: Mutex<HashMap<BlockKey, BlockRecord>>,
    max_block_retries: u32,
}

impl BlockRetryTracker {
    pub fn new(max_block_retries: u32) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            max_block_retries,
        }
    }

    /// Consume one retry for `key`; false once the budget is spent
    pub fn should_retry_block(&self, key: BlockKey) -> bool {
        let mut blocks = self.blocks.lock().unwrap();
        let record = blocks.entry(key).or_default();
        if record.retries < self.max_block_retries {
            record.retries += 1;
            true
        } else {
            false
        }
    }

    pub fn reset_retry_count(&self, key: BlockKey) {
        self.blocks.lock().unwrap().remove(&key);
    }

    pub fn record_error(&self, key: BlockKey, reason: impl Into<String>) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks.entry(key).or_default().errors.push(reason.into());
    }

    pub fn retry_count(&self, key: BlockKey) -> u32 {
        let blocks = self.blocks.lock().unwrap();
        blocks.get(&key).map_or(0, |r| r.retries)
    }

    pub fn errors(&self, key: BlockKey) -> Vec<String> {
        let blocks = self.blocks.lock().unwrap();
        blocks.get(&key).map(|r| r.errors.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        self.blocks.lock().unwrap().clear();
    }
}
