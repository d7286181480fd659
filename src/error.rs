//! Error types for the transport and the solve pipeline.

use crate::types::BlockKey;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by the reliable datagram transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no datagram received within {0:?}")]
    Timeout(Duration),

    #[error("payload of {size} bytes exceeds the {limit} byte packet ceiling")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether resending the same datagram could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}

/// Failures raised while partitioning, processing or assembling blocks.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("block {key}: {rows} rows but a vector slice of {vector_len}")]
    DimensionMismatch {
        key: BlockKey,
        rows: usize,
        vector_len: usize,
    },

    #[error("block {key} assembled with {received} of {expected} chunks")]
    IncompleteBlock {
        key: BlockKey,
        received: usize,
        expected: usize,
    },

    #[error("worker {0} missed its heartbeat deadline")]
    WorkerUnhealthy(usize),

    #[error("block {0} has no result")]
    MissingBlock(BlockKey),

    #[error("unexpected {message} while {phase}")]
    UnexpectedMessage {
        message: &'static str,
        phase: &'static str,
    },

    #[error("invalid matrix payload: {0}")]
    InvalidPayload(String),

    #[error("matrix is singular at column {0}")]
    Singular(usize),

    #[error("failed to launch worker {worker_id}: {reason}")]
    LaunchFailed { worker_id: usize, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
