//! Splitting block results into packet-sized chunks and putting them back together.

use crate::error::{SolveError, TransportError};
use crate::types::{BlockKey, BlockResult, BlockResultChunk, MatrixBlock};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Split `payload` into slices of at most `max_chunk` bytes, never inside a UTF-8 sequence
pub fn split_payload(payload: &str, max_chunk: usize) -> Vec<&str> {
    // one slice must be able to hold any UTF-8 character
    let max_chunk = max_chunk.max(4);
    let mut chunks = Vec::with_capacity(payload.len().div_ceil(max_chunk));
    let mut rest = payload;
    while !rest.is_empty() {
        let mut end = max_chunk.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// Serialize the result's block and wrap each slice in a `BlockResultChunk`
pub fn chunk_result(result: &BlockResult, max_chunk: usize) -> Result<Vec<BlockResultChunk>, TransportError> {
    let serialized = serde_json::to_string(&result.block)
        .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
    let slices = split_payload(&serialized, max_chunk);
    let total = slices.len();

    debug!(
        block = %result.key,
        bytes = serialized.len(),
        chunks = total,
        "split block result"
    );

    Ok(slices
        .into_iter()
        .enumerate()
        .map(|(index, data)| BlockResultChunk {
            key: result.key,
            index,
            total,
            data: data.to_string(),
            worker_id: result.worker_id,
        })
        .collect())
}

pub fn decode_block(text: &str) -> Result<MatrixBlock, TransportError> {
    let block: MatrixBlock =
        serde_json::from_str(text).map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
    if block.data.len() != block.rows * block.cols {
        return Err(TransportError::MalformedMessage(format!(
            "block declares {}x{} but carries {} values",
            block.rows,
            block.cols,
            block.data.len()
        )));
    }
    Ok(block)
}

#[derive(Debug)]
struct PartialBlock {
    slices: Vec<Option<String>>,
    received: usize,
}

impl PartialBlock {
    fn new(total: usize) -> Self {
        Self {
            slices: vec![None; total],
            received: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.slices.len()
    }
}

/// Rebuilds chunked block results keyed by grid position.
///
/// Chunks are deduplicated by index, so at-least-once delivery never
/// double-counts toward completion. A chunk announcing more than
/// `max_total` slices is dropped before anything is allocated for it.
#[derive(Debug)]
pub struct ChunkAssembler {
    blocks: Mutex<HashMap<BlockKey, PartialBlock>>,
    max_total: usize,
}

impl ChunkAssembler {
    pub fn new(max_total: usize) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            max_total,
        }
    }

    /// Record a chunk and, if that completes its block, take and decode it
    pub fn accept(&self, chunk: &BlockResultChunk) -> Result<Option<MatrixBlock>, SolveError> {
        let mut blocks = self.blocks.lock().unwrap();
        if !Self::insert(&mut blocks, chunk, self.max_total) {
            return Ok(None);
        }
        Self::take(&mut blocks, chunk.key).map(Some)
    }

    pub fn clear(&self) {
        self.blocks.lock().unwrap().clear();
    }

    fn insert(blocks: &mut HashMap<BlockKey, PartialBlock>, chunk: &BlockResultChunk, max_total: usize) -> bool {
        if chunk.index >= chunk.total {
            warn!(block = %chunk.key, index = chunk.index, total = chunk.total, "chunk index out of range");
            return false;
        }
        if chunk.total > max_total {
            warn!(block = %chunk.key, total = chunk.total, max_total, "chunk count over the limit, dropped");
            return false;
        }

        let partial = blocks
            .entry(chunk.key)
            .or_insert_with(|| PartialBlock::new(chunk.total));

        if partial.slices.len() != chunk.total {
            warn!(
                block = %chunk.key,
                declared = partial.slices.len(),
                got = chunk.total,
                "chunk disagrees on total count, dropped"
            );
            return false;
        }

        let slot = &mut partial.slices[chunk.index];
        if slot.is_none() {
            *slot = Some(chunk.data.clone());
            partial.received += 1;
        }
        partial.is_complete()
    }

    fn take(blocks: &mut HashMap<BlockKey, PartialBlock>, key: BlockKey) -> Result<MatrixBlock, SolveError> {
        let (received, expected) = match blocks.get(&key) {
            Some(p) => (p.received, p.slices.len()),
            None => (0, 0),
        };
        if expected == 0 || received != expected {
            return Err(SolveError::IncompleteBlock {
                key,
                received,
                expected,
            });
        }

        let partial = blocks.remove(&key).ok_or(SolveError::MissingBlock(key))?;
        let text: String = partial.slices.into_iter().flatten().collect();
        Ok(decode_block(&text)?)
    }
}
