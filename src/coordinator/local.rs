use super::assembly::SolutionAssembler;
use crate::config::NetConfig;
use crate::error::SolveError;
use crate::matrix::{BlockMatrix, Matrix, choose_block_size, max_residual};
use crate::types::{BlockTask, MatrixBlock, SolutionResult};
use crate::worker::process_block;
use chrono::Utc;
use std::time::Instant;
use tracing::info;

/// Solve without any workers: every block is eliminated here and written back in place.
///
/// Uses the same per-block elimination and stitching as the distributed path,
/// with the residual taken against the untouched input.
pub fn solve_in_process(
    matrix: &Matrix,
    vector: &[f64],
    block_size: Option<usize>,
    config: &NetConfig,
) -> Result<SolutionResult, SolveError> {
    if matrix.rows() != matrix.cols() || matrix.rows() != vector.len() {
        return Err(SolveError::InvalidPayload(format!(
            "{}x{} matrix with a vector of {}",
            matrix.rows(),
            matrix.cols(),
            vector.len()
        )));
    }

    let started = Instant::now();
    let size = match block_size {
        Some(b) => b.max(1),
        None => choose_block_size(matrix.rows(), 1, config),
    };
    let mut blocks = BlockMatrix::new(matrix.clone(), size);
    let assembler = SolutionAssembler::for_grid(&blocks);

    let keys: Vec<_> = blocks.keys().collect();
    for key in keys {
        let block = blocks.get_block(key).ok_or(SolveError::MissingBlock(key))?;
        let task = BlockTask {
            key,
            vector: blocks.vector_slice(vector, key),
            block,
        };
        let eliminated = process_block(&task)?;
        blocks.set_block(key, &coefficients(&eliminated));
        assembler.accept(key, &eliminated)?;
    }

    let solution = assembler.solution();
    let residual = max_residual(matrix, &solution, vector);
    let elapsed = started.elapsed().as_millis() as u64;
    info!(size = matrix.rows(), block_size = size, residual, elapsed_ms = elapsed, "in-process solve finished");

    Ok(SolutionResult {
        matrix_size: matrix.rows(),
        worker_count: 0,
        block_size: size,
        solution,
        distributed_ms: elapsed,
        sequential_ms: None,
        max_residual: residual,
        completed_at: Utc::now(),
    })
}

/// The eliminated block without its augmented column
fn coefficients(augmented: &MatrixBlock) -> MatrixBlock {
    let cols = augmented.cols.saturating_sub(1);
    let mut out = MatrixBlock::zeros(augmented.rows, cols);
    for r in 0..augmented.rows {
        for c in 0..cols {
            out.set(r, c, augmented.get(r, c));
        }
    }
    out
}
