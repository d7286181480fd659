use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Grid position of a block: (block row, block column)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey {
    pub row: usize,
    pub col: usize,
}

impl BlockKey {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.row, self.col)
    }
}

/// Row-major block with its shape carried alongside the values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixBlock {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl MatrixBlock {
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, vec![0.0; rows * cols])
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    /// Values of the last column, top to bottom
    pub fn last_column(&self) -> Vec<f64> {
        if self.cols == 0 {
            return Vec::new();
        }
        (0..self.rows).map(|r| self.get(r, self.cols - 1)).collect()
    }
}

/// One block of work sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTask {
    pub key: BlockKey,
    pub block: MatrixBlock,
    /// Right-hand-side entries for the block's rows
    pub vector: Vec<f64>,
}

/// A worker's eliminated augmented block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockResult {
    pub worker_id: usize,
    pub key: BlockKey,
    pub block: MatrixBlock,
}

/// One slice of a serialized `BlockResult` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockResultChunk {
    pub key: BlockKey,
    pub index: usize,
    pub total: usize,
    pub data: String,
    pub worker_id: usize,
}

impl BlockResultChunk {
    /// Key used by the sender's outstanding-chunk table
    pub fn tracking_id(&self) -> String {
        chunk_tracking_id(self.key, self.index)
    }
}

pub fn chunk_tracking_id(key: BlockKey, index: usize) -> String {
    format!("{}_{}_{}", key.row, key.col, index)
}

/// Acknowledgement for one received chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub key: BlockKey,
    pub index: usize,
    pub worker_id: usize,
    pub received: bool,
}

impl ChunkAck {
    pub fn for_chunk(chunk: &BlockResultChunk) -> Self {
        Self {
            key: chunk.key,
            index: chunk.index,
            worker_id: chunk.worker_id,
            received: true,
        }
    }

    pub fn tracking_id(&self) -> String {
        chunk_tracking_id(self.key, self.index)
    }
}

/// Final answer delivered to the requester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionResult {
    pub matrix_size: usize,
    pub worker_count: usize,
    pub block_size: usize,
    pub solution: Vec<f64>,
    pub distributed_ms: u64,
    /// Filled in by the requester after its own sequential solve
    pub sequential_ms: Option<u64>,
    pub max_residual: f64,
    pub completed_at: DateTime<Utc>,
}

impl SolutionResult {
    /// Sequential time over distributed time, when both are known
    pub fn speedup(&self) -> Option<f64> {
        let sequential = self.sequential_ms? as f64;
        let distributed = self.distributed_ms.max(1) as f64;
        Some(sequential / distributed)
    }

    /// Two-worker result around `solution`, for tests
    #[cfg(test)]
    pub(crate) fn sample(solution: Vec<f64>) -> Self {
        Self {
            matrix_size: solution.len(),
            worker_count: 2,
            block_size: 2,
            solution,
            distributed_ms: 50,
            sequential_ms: None,
            max_residual: 0.0,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_column() {
        let block = MatrixBlock::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(block.last_column(), vec![3.0, 6.0]);
        assert_eq!(block.get(1, 0), 4.0);
    }

    #[test]
    fn test_tracking_ids_match() {
        let chunk = BlockResultChunk {
            key: BlockKey::new(2, 5),
            index: 3,
            total: 4,
            data: String::new(),
            worker_id: 1,
        };
        let ack = ChunkAck::for_chunk(&chunk);

        assert_eq!(chunk.tracking_id(), "2_5_3");
        assert_eq!(ack.tracking_id(), chunk.tracking_id());
        assert!(ack.received);
    }

    #[test]
    fn test_speedup() {
        let mut result = SolutionResult::sample(vec![0.0; 4]);
        assert!(result.speedup().is_none());

        result.sequential_ms = Some(100);
        assert_eq!(result.speedup(), Some(2.0));
    }
}
