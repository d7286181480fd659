//! Dense matrices, block partitioning and the numeric helpers around them.

use crate::config::NetConfig;
use crate::error::SolveError;
use crate::types::{BlockKey, MatrixBlock};
use std::ops::Range;

/// Pivots with a smaller magnitude are treated as zero
pub const PIVOT_EPSILON: f64 = 1e-10;

/// Upper bound on the JSON length of one f64 plus its separator
const SERIALIZED_VALUE_BYTES: usize = 25;

/// Dense row-major matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    #[cfg(test)]
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let cols = rows.first().map_or(0, |r| r.len());
        let n = rows.len();
        let data: Vec<f64> = rows.into_iter().flatten().collect();
        assert_eq!(data.len(), n * cols, "ragged rows");
        Self { rows: n, cols, data }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

/// Pick a block edge length for a `dimension` x `dimension` system.
///
/// The result targets `dimension / sqrt(workers)`, is clamped to the
/// configured range, and never exceeds the largest block whose task (block
/// plus vector slice) fits in one packet.
pub fn choose_block_size(dimension: usize, worker_count: usize, config: &NetConfig) -> usize {
    let fit = max_fitting_block(config);
    if let Some(forced) = config.block_size {
        return forced.clamp(1, fit);
    }

    let workers = worker_count.max(1) as f64;
    let suggested = (dimension as f64 / workers.sqrt()) as usize;
    let ceiling = fit.min(config.max_block_size).max(1);

    suggested.max(config.min_block_size).min(ceiling)
}

fn max_fitting_block(config: &NetConfig) -> usize {
    let budget = config.max_packet_size.saturating_sub(config.protocol_overhead);
    let mut edge = ((budget / SERIALIZED_VALUE_BYTES) as f64).sqrt() as usize;
    while edge > 1 && (edge * edge + edge) * SERIALIZED_VALUE_BYTES > budget {
        edge -= 1;
    }
    edge.max(1)
}

/// A matrix viewed as a grid of `block_size` blocks; edge blocks are clipped
#[derive(Debug, Clone)]
pub struct BlockMatrix {
    matrix: Matrix,
    block_size: usize,
    blocks_in_row: usize,
    blocks_in_col: usize,
}

impl BlockMatrix {
    pub fn new(matrix: Matrix, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        let blocks_in_row = matrix.rows.div_ceil(block_size);
        let blocks_in_col = matrix.cols.div_ceil(block_size);
        Self {
            matrix,
            block_size,
            blocks_in_row,
            blocks_in_col,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of block rows in the grid
    pub fn blocks_in_row(&self) -> usize {
        self.blocks_in_row
    }

    /// Number of block columns in the grid
    pub fn blocks_in_col(&self) -> usize {
        self.blocks_in_col
    }

    pub fn block_count(&self) -> usize {
        self.blocks_in_row * self.blocks_in_col
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    /// Every grid position in row-major order
    pub fn keys(&self) -> impl Iterator<Item = BlockKey> + '_ {
        (0..self.blocks_in_row)
            .flat_map(move |r| (0..self.blocks_in_col).map(move |c| BlockKey::new(r, c)))
    }

    pub fn contains(&self, key: BlockKey) -> bool {
        key.row < self.blocks_in_row && key.col < self.blocks_in_col
    }

    /// Global row indices covered by block row `block_row`
    pub fn row_range(&self, block_row: usize) -> Range<usize> {
        let start = (block_row * self.block_size).min(self.matrix.rows);
        start..(start + self.block_size).min(self.matrix.rows)
    }

    pub fn col_range(&self, block_col: usize) -> Range<usize> {
        let start = (block_col * self.block_size).min(self.matrix.cols);
        start..(start + self.block_size).min(self.matrix.cols)
    }

    /// Extract the block at `key`, or `None` outside the grid
    pub fn get_block(&self, key: BlockKey) -> Option<MatrixBlock> {
        if !self.contains(key) {
            return None;
        }
        let rows = self.row_range(key.row);
        let cols = self.col_range(key.col);

        let mut data = Vec::with_capacity(rows.len() * cols.len());
        for r in rows.clone() {
            data.extend_from_slice(&self.matrix.row(r)[cols.clone()]);
        }
        Some(MatrixBlock::new(rows.len(), cols.len(), data))
    }

    /// Write `block` back at `key`; values beyond the matrix edge are ignored
    pub fn set_block(&mut self, key: BlockKey, block: &MatrixBlock) {
        if !self.contains(key) {
            return;
        }
        let rows = self.row_range(key.row);
        let cols = self.col_range(key.col);

        for (i, r) in rows.enumerate().take(block.rows) {
            for (j, c) in cols.clone().enumerate().take(block.cols) {
                self.matrix.set(r, c, block.get(i, j));
            }
        }
    }

    /// The right-hand-side entries matching block row `key.row`
    pub fn vector_slice(&self, vector: &[f64], key: BlockKey) -> Vec<f64> {
        let range = self.row_range(key.row);
        let end = range.end.min(vector.len());
        let start = range.start.min(end);
        vector[start..end].to_vec()
    }
}

/// Render `matrix | vector` as the `v1 v2 ... vn|b` row lines of the handshake payload
pub fn format_rows(matrix: &Matrix, vector: &[f64]) -> Vec<String> {
    (0..matrix.rows)
        .map(|i| {
            let values: Vec<String> = matrix.row(i).iter().map(|v| v.to_string()).collect();
            format!("{}|{}", values.join(" "), vector[i])
        })
        .collect()
}

/// Parse the concatenated handshake payload back into a matrix and vector
pub fn parse_payload(text: &str, rows: usize, cols: usize) -> Result<(Matrix, Vec<f64>), SolveError> {
    let lines: Vec<&str> = text
        .split(['\n', '\r'])
        .filter(|l| !l.trim().is_empty())
        .collect();

    if lines.len() != rows {
        return Err(SolveError::InvalidPayload(format!(
            "expected {} rows, got {}",
            rows,
            lines.len()
        )));
    }

    let mut matrix = Matrix::zeros(rows, cols);
    let mut vector = Vec::with_capacity(rows);

    for (i, line) in lines.iter().enumerate() {
        let (values, rhs) = line
            .split_once('|')
            .ok_or_else(|| SolveError::InvalidPayload(format!("row {} has no '|'", i)))?;

        let parsed: Vec<f64> = values
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| SolveError::InvalidPayload(format!("row {}: {}", i, e)))?;

        if parsed.len() != cols {
            return Err(SolveError::InvalidPayload(format!(
                "row {} has {} values, expected {}",
                i,
                parsed.len(),
                cols
            )));
        }
        for (j, v) in parsed.into_iter().enumerate() {
            matrix.set(i, j, v);
        }

        let b = rhs
            .trim()
            .parse::<f64>()
            .map_err(|e| SolveError::InvalidPayload(format!("row {} rhs: {}", i, e)))?;
        vector.push(b);
    }

    Ok((matrix, vector))
}

/// `max_i |sum_j A[i,j] x[j] - b[i]|`
pub fn max_residual(matrix: &Matrix, solution: &[f64], vector: &[f64]) -> f64 {
    (0..matrix.rows)
        .map(|i| {
            let sum: f64 = matrix
                .row(i)
                .iter()
                .zip(solution)
                .map(|(a, x)| a * x)
                .sum();
            (sum - vector[i]).abs()
        })
        .fold(0.0, f64::max)
}

/// Plain Gaussian elimination with partial pivoting and back-substitution.
///
/// Used as the timing baseline for distributed solves.
pub fn solve_sequential(matrix: &Matrix, vector: &[f64]) -> Result<Vec<f64>, SolveError> {
    let n = vector.len();
    if matrix.rows != n || matrix.cols != n {
        return Err(SolveError::InvalidPayload(format!(
            "{}x{} matrix with a vector of {}",
            matrix.rows, matrix.cols, n
        )));
    }

    let width = n + 1;
    let mut aug = vec![0.0; n * width];
    for i in 0..n {
        aug[i * width..i * width + n].copy_from_slice(matrix.row(i));
        aug[i * width + n] = vector[i];
    }

    for i in 0..n {
        let pivot = (i..n)
            .max_by(|&a, &b| aug[a * width + i].abs().total_cmp(&aug[b * width + i].abs()))
            .unwrap_or(i);
        if aug[pivot * width + i].abs() < PIVOT_EPSILON {
            return Err(SolveError::Singular(i));
        }
        if pivot != i {
            for j in i..width {
                aug.swap(i * width + j, pivot * width + j);
            }
        }
        for k in i + 1..n {
            let factor = aug[k * width + i] / aug[i * width + i];
            for j in i..width {
                aug[k * width + j] -= factor * aug[i * width + j];
            }
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut value = aug[i * width + n];
        for j in i + 1..n {
            value -= aug[i * width + j] * x[j];
        }
        x[i] = value / aug[i * width + i];
    }
    Ok(x)
}
