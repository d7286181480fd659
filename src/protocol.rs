//! Wire envelope shared by requester, coordinator and workers.
//!
//! Every datagram is one JSON object with a `Type` discriminator and an
//! optional `Body`, e.g. `{"Type":"HEARTBEAT","Body":{"worker_id":2}}` or
//! `{"Type":"SHUTDOWN"}`. Decoding is a single serde match; anything that does
//! not parse is reported as `MalformedMessage` and dropped by the receiver.

use crate::error::TransportError;
use crate::types::{BlockKey, BlockResultChunk, BlockTask, ChunkAck, SolutionResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Body")]
pub enum Message {
    /// Requester -> coordinator: start a solve
    #[serde(rename = "INIT")]
    Init {
        worker_count: usize,
        rows: usize,
        cols: usize,
    },

    /// Requester -> coordinator: number of payload chunks that follow
    #[serde(rename = "COUNT")]
    Count { chunk_count: usize },

    /// Requester -> coordinator: one fragment of the `v1 v2 ... vn|b` row text
    #[serde(rename = "CHUNK")]
    Chunk { index: usize, data: String },

    #[serde(rename = "TASK")]
    Task(BlockTask),

    #[serde(rename = "RESULT_CHUNK")]
    ResultChunk(BlockResultChunk),

    #[serde(rename = "ACK")]
    Ack(ChunkAck),

    #[serde(rename = "HEARTBEAT")]
    Heartbeat { worker_id: usize },

    #[serde(rename = "SHUTDOWN")]
    Shutdown,

    #[serde(rename = "SOLUTION")]
    Solution(SolutionResult),

    /// Worker -> coordinator: a task could not be processed
    #[serde(rename = "TASK_FAILED")]
    TaskFailed {
        key: BlockKey,
        worker_id: usize,
        reason: String,
    },

    /// Coordinator -> requester: blocks exhausted their retry budget
    #[serde(rename = "SOLVE_FAILED")]
    SolveFailed {
        failed_blocks: Vec<BlockKey>,
        reason: String,
    },

    /// Requester -> coordinator: abandon the current solve
    #[serde(rename = "CANCEL")]
    Cancel,
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::MalformedMessage(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| {
            let preview = String::from_utf8_lossy(&bytes[..bytes.len().min(100)]).into_owned();
            TransportError::MalformedMessage(format!("{} (data: {})", e, preview))
        })
    }

    /// Short name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "INIT",
            Self::Count { .. } => "COUNT",
            Self::Chunk { .. } => "CHUNK",
            Self::Task(_) => "TASK",
            Self::ResultChunk(_) => "RESULT_CHUNK",
            Self::Ack(_) => "ACK",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::Shutdown => "SHUTDOWN",
            Self::Solution(_) => "SOLUTION",
            Self::TaskFailed { .. } => "TASK_FAILED",
            Self::SolveFailed { .. } => "SOLVE_FAILED",
            Self::Cancel => "CANCEL",
        }
    }
}
