use crate::error::SolveError;
use crate::matrix::PIVOT_EPSILON;
use crate::types::{BlockTask, MatrixBlock};
use tracing::{debug, warn};

/// Forward elimination with partial pivoting on `[block | vector]`.
///
/// Returns the `rows x (cols + 1)` augmented block. Pivots below
/// `PIVOT_EPSILON` are skipped rather than treated as fatal.
pub fn process_block(task: &BlockTask) -> Result<MatrixBlock, SolveError> {
    let rows = task.block.rows;
    let cols = task.block.cols;
    if task.vector.len() != rows || task.block.data.len() != rows * cols {
        return Err(SolveError::DimensionMismatch {
            key: task.key,
            rows,
            vector_len: task.vector.len(),
        });
    }

    let width = cols + 1;
    let mut aug = MatrixBlock::zeros(rows, width);
    for r in 0..rows {
        for c in 0..cols {
            aug.set(r, c, task.block.get(r, c));
        }
        aug.set(r, cols, task.vector[r]);
    }

    let mut skipped = 0;
    for i in 0..rows.min(cols) {
        let pivot_row = (i..rows)
            .max_by(|&a, &b| aug.get(a, i).abs().total_cmp(&aug.get(b, i).abs()))
            .unwrap_or(i);
        let pivot = aug.get(pivot_row, i);
        if pivot.abs() < PIVOT_EPSILON {
            skipped += 1;
            continue;
        }

        if pivot_row != i {
            for j in 0..width {
                aug.data.swap(i * width + j, pivot_row * width + j);
            }
        }

        for k in i + 1..rows {
            let factor = aug.get(k, i) / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in i..width {
                let value = aug.get(k, j) - factor * aug.get(i, j);
                aug.set(k, j, value);
            }
        }
    }

    if skipped > 0 {
        warn!(block = %task.key, skipped, "near-zero pivots skipped");
    }
    debug!(block = %task.key, rows, cols, "block eliminated");
    Ok(aug)
}
