//! Requester side: generate a system, push it to the coordinator and wait for the answer.

use crate::config::NetConfig;
use crate::error::TransportError;
use crate::matrix::{Matrix, format_rows, solve_sequential};
use crate::protocol::Message;
use crate::transport::Transport;
use crate::types::SolutionResult;
use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Random diagonally dominant `n x n` system
pub fn generate_system(n: usize) -> (Matrix, Vec<f64>) {
    let mut rng = rand::thread_rng();
    let mut matrix = Matrix::zeros(n, n);
    let mut vector = Vec::with_capacity(n);

    for i in 0..n {
        let mut off_diagonal = 0.0;
        for j in 0..n {
            if i != j {
                let v = rng.gen_range(0.0..10.0);
                matrix.set(i, j, v);
                off_diagonal += v;
            }
        }
        matrix.set(i, i, off_diagonal + rng.gen_range(1.0..11.0));
        vector.push(rng.gen_range(0.0..10.0));
    }
    (matrix, vector)
}

/// Pack row lines into chunks of at most `budget` bytes without splitting a row.
///
/// Each newline is counted twice since it is escaped on the wire. A row that
/// is longer than `budget` on its own becomes a chunk by itself.
pub fn prepare_chunks(matrix: &Matrix, vector: &[f64], budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut cost = 0;

    for line in format_rows(matrix, vector) {
        if !current.is_empty() && cost + line.len() + 2 > budget {
            chunks.push(std::mem::take(&mut current));
            cost = 0;
        }
        if !current.is_empty() {
            current.push('\n');
            cost += 2;
        }
        current.push_str(&line);
        cost += line.len();
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub struct Requester {
    config: NetConfig,
    transport: Arc<dyn Transport>,
}

impl Requester {
    pub fn new(config: NetConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Run the INIT / COUNT / CHUNK handshake and wait for the solution.
    ///
    /// On success the sequential baseline is timed locally and stored in
    /// `sequential_ms`. If nothing arrives within `timeout` a best-effort
    /// `CANCEL` is sent before returning the error.
    pub async fn submit(
        &self,
        matrix: &Matrix,
        vector: &[f64],
        worker_count: usize,
        timeout: Duration,
    ) -> Result<SolutionResult> {
        let coordinator = self.config.coordinator_addr();
        let init = Message::Init {
            worker_count,
            rows: matrix.rows(),
            cols: matrix.cols(),
        };
        self.transport
            .send(&init, coordinator)
            .await
            .context(format!("Failed to reach coordinator at {}", coordinator))?;
        tokio::time::sleep(self.config.task_distribution_delay()).await;

        let budget = self
            .config
            .max_packet_size
            .saturating_sub(self.config.protocol_overhead);
        let chunks = prepare_chunks(matrix, vector, budget);
        info!(size = matrix.rows(), workers = worker_count, chunks = chunks.len(), "sending system");

        self.transport
            .send(&Message::Count { chunk_count: chunks.len() }, coordinator)
            .await
            .context("Failed to announce chunk count")?;
        tokio::time::sleep(self.config.task_distribution_delay()).await;

        for (index, data) in chunks.into_iter().enumerate() {
            self.transport
                .send(&Message::Chunk { index, data }, coordinator)
                .await
                .context(format!("Failed to send payload chunk {}", index))?;
            tokio::time::sleep(self.config.chunk_transmission_delay()).await;
        }

        let mut result = self.await_solution(timeout).await?;

        let started = Instant::now();
        match solve_sequential(matrix, vector) {
            Ok(_) => result.sequential_ms = Some(started.elapsed().as_millis() as u64),
            Err(e) => warn!(error = %e, "sequential baseline failed"),
        }
        Ok(result)
    }

    async fn await_solution(&self, timeout: Duration) -> Result<SolutionResult> {
        let deadline = Instant::now() + timeout;
        let poll = self.config.recv_poll_interval();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = self
                    .transport
                    .send_once(&Message::Cancel, self.config.coordinator_addr())
                    .await;
                anyhow::bail!("No solution within {:?}; cancel sent", timeout);
            }

            match self.transport.recv_timeout(remaining.min(poll)).await {
                Ok((Message::Solution(result), _)) => return Ok(result),
                Ok((Message::SolveFailed { failed_blocks, reason }, _)) => {
                    anyhow::bail!("Solve failed ({} blocks): {}", failed_blocks.len(), reason);
                }
                Ok((other, from)) => debug!(kind = other.kind(), %from, "ignoring message"),
                Err(TransportError::Timeout(_)) => {}
                Err(TransportError::MalformedMessage(reason)) => {
                    warn!(%reason, "dropping malformed datagram");
                }
                Err(e) => return Err(e).context("Failed while waiting for the solution"),
            }
        }
    }
}
