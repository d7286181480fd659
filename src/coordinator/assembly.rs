use crate::error::SolveError;
use crate::matrix::BlockMatrix;
use crate::types::{BlockKey, MatrixBlock};
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug)]
struct Progress {
    solution: Vec<f64>,
    completed: HashSet<BlockKey>,
}

/// Stitches eliminated blocks into the global solution vector.
///
/// Row band `r` is written from the last column of block
/// `(r, min(r, blocks_in_col - 1))` only; every other block of the band still
/// has to arrive before the solve counts as complete.
#[derive(Debug)]
pub struct SolutionAssembler {
    progress: Mutex<Progress>,
    dimension: usize,
    block_size: usize,
    blocks_in_row: usize,
    blocks_in_col: usize,
}

impl SolutionAssembler {
    pub fn for_grid(blocks: &BlockMatrix) -> Self {
        Self {
            progress: Mutex::new(Progress {
                solution: vec![0.0; blocks.matrix().rows()],
                completed: HashSet::new(),
            }),
            dimension: blocks.matrix().rows(),
            block_size: blocks.block_size(),
            blocks_in_row: blocks.blocks_in_row(),
            blocks_in_col: blocks.blocks_in_col(),
        }
    }

    /// The block whose last column supplies row band `block_row`
    pub fn author_of(&self, block_row: usize) -> BlockKey {
        BlockKey::new(block_row, block_row.min(self.blocks_in_col.saturating_sub(1)))
    }

    /// Record an eliminated block; returns false for a block already accepted
    pub fn accept(&self, key: BlockKey, block: &MatrixBlock) -> Result<bool, SolveError> {
        if key.row >= self.blocks_in_row || key.col >= self.blocks_in_col {
            return Err(SolveError::MissingBlock(key));
        }

        let start = key.row * self.block_size;
        let expected_rows = self.block_size.min(self.dimension - start);
        if block.rows != expected_rows {
            return Err(SolveError::DimensionMismatch {
                key,
                rows: block.rows,
                vector_len: expected_rows,
            });
        }

        let mut progress = self.progress.lock().unwrap();
        if !progress.completed.insert(key) {
            return Ok(false);
        }
        if key == self.author_of(key.row) {
            let column = block.last_column();
            progress.solution[start..start + expected_rows].copy_from_slice(&column);
        }
        Ok(true)
    }

    pub fn completed_count(&self) -> usize {
        self.progress.lock().unwrap().completed.len()
    }

    pub fn total_blocks(&self) -> usize {
        self.blocks_in_row * self.blocks_in_col
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.total_blocks()
    }

    pub fn solution(&self) -> Vec<f64> {
        self.progress.lock().unwrap().solution.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::Matrix;

    fn grid(dim: usize, block: usize) -> BlockMatrix {
        BlockMatrix::new(Matrix::identity(dim), block)
    }

    fn band(rows: usize, cols: usize, last: &[f64]) -> MatrixBlock {
        let width = cols + 1;
        let mut data = vec![0.0; rows * width];
        for (r, v) in last.iter().enumerate() {
            data[r * width + cols] = *v;
        }
        MatrixBlock::new(rows, width, data)
    }

    #[test]
    fn test_author_follows_diagonal_then_last_column() {
        let assembler = SolutionAssembler::for_grid(&grid(5, 2));
        assert_eq!(assembler.author_of(0), BlockKey::new(0, 0));
        assert_eq!(assembler.author_of(2), BlockKey::new(2, 2));

        let wide = SolutionAssembler::for_grid(&BlockMatrix::new(Matrix::zeros(6, 2), 2));
        assert_eq!(wide.author_of(2), BlockKey::new(2, 0));
    }

    #[test]
    fn test_only_author_writes() {
        let assembler = SolutionAssembler::for_grid(&grid(4, 2));

        assert!(assembler.accept(BlockKey::new(0, 1), &band(2, 2, &[9.0, 9.0])).unwrap());
        assert_eq!(assembler.solution(), vec![0.0; 4]);

        assert!(assembler.accept(BlockKey::new(0, 0), &band(2, 2, &[1.0, 2.0])).unwrap());
        assert_eq!(&assembler.solution()[..2], &[1.0, 2.0]);
        assert!(!assembler.is_complete());
    }

    #[test]
    fn test_duplicate_block_not_counted() {
        let assembler = SolutionAssembler::for_grid(&grid(2, 2));
        assert!(assembler.accept(BlockKey::new(0, 0), &band(2, 2, &[1.0, 1.0])).unwrap());
        assert!(!assembler.accept(BlockKey::new(0, 0), &band(2, 2, &[5.0, 5.0])).unwrap());

        assert_eq!(assembler.completed_count(), 1);
        assert!(assembler.is_complete());
        assert_eq!(assembler.solution(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_wrong_band_height_rejected() {
        let assembler = SolutionAssembler::for_grid(&grid(5, 2));
        let err = assembler.accept(BlockKey::new(2, 2), &band(2, 1, &[1.0, 1.0])).unwrap_err();
        assert!(matches!(err, SolveError::DimensionMismatch { rows: 2, vector_len: 1, .. }));
        assert!(assembler.accept(BlockKey::new(3, 0), &band(1, 1, &[1.0])).is_err());
    }
}
