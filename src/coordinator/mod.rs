//! Coordinator: takes a system from the requester, farms its blocks out to
//! workers, recovers from silent workers and stitches the results together.

pub mod assembly;
pub mod balancer;
pub mod health;
pub mod launcher;
pub mod ledger;
pub mod local;
pub mod phase;
pub mod retries;

use crate::config::NetConfig;
use crate::error::{SolveError, TransportError};
use crate::matrix::{BlockMatrix, choose_block_size, max_residual, parse_payload};
use crate::metrics::NetworkMetrics;
use crate::protocol::Message;
use crate::transport::Transport;
use crate::transport::chunking::ChunkAssembler;
use crate::types::{BlockKey, BlockResultChunk, BlockTask, ChunkAck, MatrixBlock, SolutionResult};
use assembly::SolutionAssembler;
use balancer::LoadBalancer;
use chrono::Utc;
use health::HealthMonitor;
use launcher::{WorkerHandle, WorkerLauncher};
use ledger::AssignmentLedger;
use phase::{Dimensions, Phase};
use retries::BlockRetryTracker;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Everything fixed once a payload has been parsed
struct Session {
    generation: u64,
    requester: SocketAddr,
    worker_count: usize,
    blocks: BlockMatrix,
    vector: Vec<f64>,
    assembler: SolutionAssembler,
    started: Instant,
}

impl Session {
    fn build_task(&self, key: BlockKey) -> Option<BlockTask> {
        let block = self.blocks.get_block(key)?;
        Some(BlockTask {
            key,
            block,
            vector: self.blocks.vector_slice(&self.vector, key),
        })
    }
}

pub struct Coordinator {
    config: NetConfig,
    transport: Arc<dyn Transport>,
    launcher: Box<dyn WorkerLauncher>,
    phase: Mutex<Phase>,
    requester: Mutex<Option<SocketAddr>>,
    session: Mutex<Option<Arc<Session>>>,
    handles: Mutex<Vec<WorkerHandle>>,
    balancer: LoadBalancer,
    health: HealthMonitor,
    retries: BlockRetryTracker,
    ledger: AssignmentLedger,
    chunks: ChunkAssembler,
    generation: AtomicU64,
    stop: AtomicBool,
    metrics: Arc<NetworkMetrics>,
}

impl Coordinator {
    pub fn new(
        config: NetConfig,
        transport: Arc<dyn Transport>,
        launcher: Box<dyn WorkerLauncher>,
        metrics: Arc<NetworkMetrics>,
    ) -> Self {
        Self {
            balancer: LoadBalancer::new(config.balancer_idle_window()),
            health: HealthMonitor::new(config.heartbeat_timeout(), config.max_retries),
            retries: BlockRetryTracker::new(config.max_block_retries),
            ledger: AssignmentLedger::new(),
            chunks: ChunkAssembler::new(config.max_result_chunks()),
            phase: Mutex::new(Phase::Idle),
            requester: Mutex::new(None),
            session: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            config,
            transport,
            launcher,
            metrics,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.lock().unwrap().clone()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn accepts_results(&self) -> bool {
        self.phase.lock().unwrap().accepts_results()
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Receive loop plus the periodic health sweep, until `stop` is called
    pub async fn run(self: Arc<Self>) {
        info!(addr = %self.config.coordinator_addr(), "coordinator listening");
        tokio::spawn(Arc::clone(&self).health_loop());

        let poll = self.config.recv_poll_interval();
        while !self.is_stopped() {
            match self.transport.recv_timeout(poll).await {
                Ok((message, from)) => self.dispatch(message, from).await,
                Err(TransportError::Timeout(_)) => {}
                Err(TransportError::MalformedMessage(reason)) => {
                    warn!(%reason, "dropping malformed datagram");
                }
                Err(e) => warn!(error = %e, "receive failed"),
            }
        }

        self.release_workers().await;
        self.metrics.log_summary("coordinator");
        info!("coordinator stopped");
    }

    async fn health_loop(self: Arc<Self>) {
        let interval = self.config.health_check_interval();
        while !self.is_stopped() {
            tokio::time::sleep(interval).await;
            self.sweep_health().await;
            self.balancer.evict_idle(Instant::now());
        }
    }

    /// Route one inbound message
    pub async fn dispatch(self: &Arc<Self>, message: Message, from: SocketAddr) {
        match message {
            Message::Init {
                worker_count,
                rows,
                cols,
            } => {
                let dims = Dimensions {
                    worker_count,
                    rows,
                    cols,
                };
                self.on_init(dims, from).await;
            }
            Message::Count { chunk_count } => {
                let counted = self.phase.lock().unwrap().on_count(chunk_count);
                match counted {
                    Ok(()) => debug!(chunk_count, "payload chunk count announced"),
                    Err(e @ SolveError::InvalidPayload(_)) => {
                        self.fail_solve(Vec::new(), e.to_string()).await;
                    }
                    Err(e) => warn!(error = %e, "handshake message rejected"),
                }
            }
            Message::Chunk { index, data } => {
                let step = self.phase.lock().unwrap().on_chunk(index, &data);
                trace!(index, bytes = data.len(), "payload chunk");
                self.after_payload_step(step);
            }
            Message::ResultChunk(chunk) => self.on_result_chunk(chunk, from).await,
            Message::Heartbeat { worker_id } => {
                trace!(worker = worker_id, "heartbeat");
                self.health.record_heartbeat(worker_id);
            }
            Message::TaskFailed {
                key,
                worker_id,
                reason,
            } => self.on_task_failed(key, worker_id, reason).await,
            Message::Cancel => self.cancel().await,
            other => warn!(kind = other.kind(), %from, "unexpected message"),
        }
    }

    async fn on_init(&self, dims: Dimensions, from: SocketAddr) {
        let accepted = self.phase.lock().unwrap().on_init(dims, self.config.worker_limit());
        match accepted {
            Ok(()) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                *self.requester.lock().unwrap() = Some(from);
                info!(
                    rows = dims.rows,
                    cols = dims.cols,
                    workers = dims.worker_count,
                    requester = %from,
                    "solve requested"
                );
            }
            Err(e @ SolveError::InvalidPayload(_)) => {
                warn!(error = %e, requester = %from, "init rejected");
                let notice = Message::SolveFailed {
                    failed_blocks: Vec::new(),
                    reason: e.to_string(),
                };
                if let Err(e) = self.transport.send(&notice, from).await {
                    warn!(error = %e, requester = %from, "could not deliver rejection");
                }
            }
            Err(e) => warn!(error = %e, requester = %from, "init rejected"),
        }
    }

    fn after_payload_step(self: &Arc<Self>, step: Result<Option<(Dimensions, String)>, SolveError>) {
        match step {
            Ok(None) => {}
            Ok(Some((dims, payload))) => {
                let generation = self.generation.load(Ordering::SeqCst);
                tokio::spawn(Arc::clone(self).on_payload(dims, payload, generation));
            }
            Err(e) => warn!(error = %e, "handshake message rejected"),
        }
    }

    async fn on_payload(self: Arc<Self>, dims: Dimensions, payload: String, generation: u64) {
        if let Err(e) = self.start_solve(dims, &payload, generation).await {
            error!(error = %e, "solve could not start");
            if self.is_current(generation) {
                self.fail_solve(Vec::new(), e.to_string()).await;
            }
        }
    }

    async fn start_solve(&self, dims: Dimensions, payload: &str, generation: u64) -> Result<(), SolveError> {
        let (matrix, vector) = parse_payload(payload, dims.rows, dims.cols)?;
        let requester = self
            .requester
            .lock()
            .unwrap()
            .ok_or_else(|| SolveError::InvalidPayload("no requester recorded".to_string()))?;

        if dims.worker_count == 0 {
            info!(size = dims.rows, "no workers requested, solving in process");
            let result = local::solve_in_process(&matrix, &vector, None, &self.config)?;
            self.phase.lock().unwrap().finish()?;
            self.deliver_solution(result, requester).await;
            return Ok(());
        }

        let block_size = choose_block_size(dims.rows, dims.worker_count, &self.config);
        let blocks = BlockMatrix::new(matrix, block_size);
        info!(
            size = dims.rows,
            block_size,
            blocks = blocks.block_count(),
            grid = %format!("{}x{}", blocks.blocks_in_row(), blocks.blocks_in_col()),
            "matrix partitioned"
        );

        for worker_id in 0..dims.worker_count {
            let handle = self
                .launcher
                .launch(worker_id)
                .map_err(|e| SolveError::LaunchFailed {
                    worker_id,
                    reason: format!("{:#}", e),
                })?;
            self.handles.lock().unwrap().push(handle);
        }
        tokio::time::sleep(self.config.worker_settle_delay()).await;

        if !self.is_current(generation) {
            debug!("solve superseded while workers were starting");
            return Ok(());
        }

        let session = Arc::new(Session {
            generation,
            requester,
            worker_count: dims.worker_count,
            assembler: SolutionAssembler::for_grid(&blocks),
            blocks,
            vector,
            started: Instant::now(),
        });
        *self.session.lock().unwrap() = Some(Arc::clone(&session));
        self.phase.lock().unwrap().begin_distribution()?;

        self.distribute(&session).await;
        Ok(())
    }

    /// Hand every block out in row-major order
    async fn distribute(&self, session: &Session) {
        let keys: Vec<BlockKey> = session.blocks.keys().collect();
        let n = session.worker_count;

        for key in keys {
            if !self.is_current(session.generation) || !self.accepts_results() {
                debug!(block = %key, "distribution stopped");
                return;
            }
            let Some(worker) = self.balancer.pick_worker(n) else {
                return;
            };

            if let Err(e) = self.assign_and_send(session, key, worker).await {
                let fallback = (worker + 1) % n;
                warn!(block = %key, worker, fallback, error = %e, "task send failed, trying next worker");
                self.balancer.on_task_complete(worker);
                self.balancer.charge(fallback);
                if let Err(e) = self.assign_and_send(session, key, fallback).await {
                    warn!(block = %key, worker = fallback, error = %e, "fallback send failed, leaving block to the health sweep");
                    self.health.record_failure(fallback);
                }
            }
            tokio::time::sleep(self.config.task_distribution_delay()).await;
        }

        self.phase.lock().unwrap().distribution_done();
        info!(blocks = session.blocks.block_count(), "all tasks distributed");
    }

    async fn assign_and_send(&self, session: &Session, key: BlockKey, worker: usize) -> Result<(), SolveError> {
        let task = session.build_task(key).ok_or(SolveError::MissingBlock(key))?;
        if let Some(previous) = self.ledger.assign(key, worker) {
            if previous != worker {
                debug!(block = %key, from = previous, to = worker, "ownership moved");
            }
        }
        self.health.watch(worker);
        self.transport
            .send(&Message::Task(task), self.config.worker_addr(worker))
            .await?;
        debug!(block = %key, worker, "task sent");
        Ok(())
    }

    /// Move blocks away from every worker that missed its heartbeat deadline
    pub async fn sweep_health(&self) {
        if !self.accepts_results() {
            return;
        }
        let Some(session) = self.current_session() else {
            return;
        };

        for worker in self.health.unhealthy_workers() {
            let owned = self.ledger.blocks_of(worker);
            if owned.is_empty() {
                continue;
            }
            warn!(worker, blocks = owned.len(), "worker unhealthy, redistributing its blocks");
            for key in owned {
                let reason = SolveError::WorkerUnhealthy(worker).to_string();
                if !self.reassign_block(&session, key, worker, reason).await {
                    return;
                }
            }
        }
    }

    /// Retry `key` on another worker, or fail the solve once its budget is spent.
    /// Returns false when the solve was failed.
    async fn reassign_block(&self, session: &Session, key: BlockKey, failed_worker: usize, reason: String) -> bool {
        self.retries.record_error(key, reason.clone());
        if !self.retries.should_retry_block(key) {
            error!(block = %key, errors = ?self.retries.errors(key), "block exhausted its retries");
            self.fail_solve(vec![key], format!("block {} failed: {}", key, reason))
                .await;
            return false;
        }

        let mut excluded = self.health.unhealthy_workers();
        if !excluded.contains(&failed_worker) {
            excluded.push(failed_worker);
        }
        let Some(replacement) = self
            .balancer
            .pick_worker_excluding(session.worker_count, &excluded)
        else {
            return true;
        };
        self.balancer.on_task_complete(failed_worker);

        info!(
            block = %key,
            from = failed_worker,
            to = replacement,
            attempt = self.retries.retry_count(key),
            "reassigning block"
        );
        if let Err(e) = self.assign_and_send(session, key, replacement).await {
            warn!(block = %key, worker = replacement, error = %e, "reassigned task could not be sent");
            self.health.record_failure(replacement);
        }
        true
    }

    async fn on_task_failed(&self, key: BlockKey, worker_id: usize, reason: String) {
        if !self.accepts_results() {
            return;
        }
        let Some(session) = self.current_session() else {
            return;
        };
        if !self.ledger.is_pending(key) || self.ledger.owner(key) != Some(worker_id) {
            debug!(block = %key, worker = worker_id, "stale task failure report");
            return;
        }
        warn!(block = %key, worker = worker_id, %reason, "worker reported task failure");
        self.reassign_block(&session, key, worker_id, reason).await;
    }

    async fn on_result_chunk(&self, chunk: BlockResultChunk, from: SocketAddr) {
        let ack = Message::Ack(ChunkAck::for_chunk(&chunk));
        if let Err(e) = self.transport.send_once(&ack, from).await {
            warn!(chunk = %chunk.tracking_id(), error = %e, "ack send failed");
        }

        if !self.accepts_results() || !self.ledger.is_pending(chunk.key) {
            trace!(chunk = %chunk.tracking_id(), "chunk for a block not awaiting results");
            return;
        }
        let Some(session) = self.current_session() else {
            return;
        };

        match self.chunks.accept(&chunk) {
            Ok(Some(block)) => self.on_block_result(&session, chunk.key, chunk.worker_id, block).await,
            Ok(None) => {}
            Err(e) => {
                let owner = self.ledger.owner(chunk.key).unwrap_or(chunk.worker_id);
                warn!(block = %chunk.key, sender = chunk.worker_id, owner, error = %e, "block result could not be assembled");
                self.reassign_block(&session, chunk.key, owner, e.to_string()).await;
            }
        }
    }

    async fn on_block_result(&self, session: &Session, key: BlockKey, sender: usize, block: MatrixBlock) {
        match session.assembler.accept(key, &block) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                let owner = self.ledger.owner(key).unwrap_or(sender);
                warn!(block = %key, sender, owner, error = %e, "rejecting block result");
                self.reassign_block(session, key, owner, e.to_string()).await;
                return;
            }
        }

        if let Some(owner) = self.ledger.mark_complete(key) {
            self.balancer.on_task_complete(owner);
        }
        self.retries.reset_retry_count(key);
        info!(
            block = %key,
            worker = sender,
            completed = session.assembler.completed_count(),
            total = session.assembler.total_blocks(),
            "block complete"
        );

        if session.assembler.is_complete() {
            let ready = self.phase.lock().unwrap().begin_assembly();
            match ready {
                Ok(()) => self.finish(session).await,
                Err(e) => debug!(error = %e, "assembly already under way"),
            }
        }
    }

    async fn finish(&self, session: &Session) {
        let solution = session.assembler.solution();
        let residual = max_residual(session.blocks.matrix(), &solution, &session.vector);
        let result = SolutionResult {
            matrix_size: session.blocks.matrix().rows(),
            worker_count: session.worker_count,
            block_size: session.blocks.block_size(),
            solution,
            distributed_ms: session.started.elapsed().as_millis() as u64,
            sequential_ms: None,
            max_residual: residual,
            completed_at: Utc::now(),
        };

        let finished = self.phase.lock().unwrap().finish();
        if let Err(e) = finished {
            warn!(error = %e, "solution assembled out of phase");
            return;
        }
        info!(
            size = result.matrix_size,
            residual = result.max_residual,
            elapsed_ms = result.distributed_ms,
            "solution assembled"
        );

        self.deliver_solution(result, session.requester).await;
        self.metrics.log_summary("coordinator");
        self.release_workers().await;
        self.reset_components();
    }

    /// Send the solution, or a failure notice if it cannot be delivered
    async fn deliver_solution(&self, result: SolutionResult, requester: SocketAddr) {
        let Err(e) = self.transport.send(&Message::Solution(result), requester).await else {
            return;
        };
        error!(error = %e, %requester, "could not deliver solution");
        let notice = Message::SolveFailed {
            failed_blocks: Vec::new(),
            reason: format!("solution could not be delivered: {}", e),
        };
        if let Err(e) = self.transport.send(&notice, requester).await {
            error!(error = %e, %requester, "could not deliver failure notice");
        }
    }

    async fn fail_solve(&self, failed_blocks: Vec<BlockKey>, reason: String) {
        self.phase.lock().unwrap().fail();
        let requester = *self.requester.lock().unwrap();
        error!(blocks = ?failed_blocks, %reason, "solve failed");

        if let Some(addr) = requester {
            let notice = Message::SolveFailed {
                failed_blocks,
                reason,
            };
            if let Err(e) = self.transport.send(&notice, addr).await {
                error!(error = %e, requester = %addr, "could not deliver failure notice");
            }
        }
        self.release_workers().await;
        self.reset_components();
    }

    /// Abandon the current solve and forget all of its state
    pub async fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let previous = {
            let mut phase = self.phase.lock().unwrap();
            let name = phase.name();
            phase.reset();
            name
        };
        info!(phase = previous, "solve cancelled");
        self.release_workers().await;
        self.reset_components();
    }

    /// Tell every started worker to shut down, then stop any leftover processes
    async fn release_workers(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        if handles.is_empty() {
            return;
        }
        for handle in &handles {
            let addr = self.config.worker_addr(handle.worker_id);
            if let Err(e) = self.transport.send_once(&Message::Shutdown, addr).await {
                warn!(worker = handle.worker_id, error = %e, "shutdown send failed");
            }
        }
        if handles.iter().any(|h| h.pid.is_some()) {
            tokio::time::sleep(self.config.worker_settle_delay()).await;
        }
        for handle in handles {
            if let Err(e) = self.launcher.terminate(handle) {
                warn!(worker = handle.worker_id, error = %format!("{:#}", e), "could not stop worker");
            }
        }
    }

    fn reset_components(&self) {
        *self.session.lock().unwrap() = None;
        *self.requester.lock().unwrap() = None;
        self.ledger.clear();
        self.retries.clear();
        self.health.clear();
        self.chunks.clear();
        self.balancer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Matrix, format_rows};
    use crate::transport::chunking::chunk_result;
    use crate::transport::memory::MemoryTransport;
    use crate::types::BlockResult;
    use crate::worker::process_block;
    use launcher::NoopLauncher;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn test_config() -> NetConfig {
        NetConfig {
            block_size: Some(2),
            worker_settle_delay_ms: 0,
            task_distribution_delay_ms: 0,
            heartbeat_timeout_ms: 50,
            ..NetConfig::default()
        }
    }

    fn requester() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40_000)
    }

    fn setup(config: NetConfig) -> (Arc<Coordinator>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let coordinator = Coordinator::new(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Box::new(NoopLauncher),
            Arc::new(NetworkMetrics::new()),
        );
        (Arc::new(coordinator), transport)
    }

    async fn wait_for_phase(c: &Coordinator, name: &str) {
        for _ in 0..400 {
            if c.phase().name() == name {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("still {} instead of {}", c.phase().name(), name);
    }

    async fn submit(c: &Arc<Coordinator>, workers: usize, matrix: &Matrix, vector: &[f64]) {
        let text = format_rows(matrix, vector).join("\n");
        c.dispatch(
            Message::Init {
                worker_count: workers,
                rows: matrix.rows(),
                cols: matrix.cols(),
            },
            requester(),
        )
        .await;
        c.dispatch(Message::Count { chunk_count: 1 }, requester()).await;
        c.dispatch(Message::Chunk { index: 0, data: text }, requester()).await;
    }

    fn sent_tasks(sent: &[(Message, SocketAddr)]) -> Vec<(BlockTask, SocketAddr)> {
        sent.iter()
            .filter_map(|(m, to)| match m {
                Message::Task(t) => Some((t.clone(), *to)),
                _ => None,
            })
            .collect()
    }

    /// Play a worker: eliminate the task and send its chunks back in reverse order
    async fn deliver(c: &Arc<Coordinator>, task: &BlockTask, worker_id: usize) {
        let result = BlockResult {
            worker_id,
            key: task.key,
            block: process_block(task).unwrap(),
        };
        let from = c.config.worker_addr(worker_id);
        for chunk in chunk_result(&result, 24).unwrap().into_iter().rev() {
            c.dispatch(Message::ResultChunk(chunk), from).await;
        }
    }

    #[tokio::test]
    async fn test_four_blocks_assembled_in_any_order() {
        let (c, transport) = setup(test_config());
        let b = vec![1.0, 2.0, 3.0, 4.0];
        submit(&c, 2, &Matrix::identity(4), &b).await;
        wait_for_phase(&c, "awaiting results").await;

        let mut tasks = sent_tasks(&transport.sent());
        assert_eq!(tasks.len(), 4);
        for (task, to) in &tasks {
            let owner = c.ledger.owner(task.key).unwrap();
            assert_eq!(*to, c.config.worker_addr(owner));
        }

        tasks.reverse();
        for (task, to) in &tasks {
            let worker = c.config.worker_id_for(*to).unwrap();
            deliver(&c, task, worker).await;
        }

        assert_eq!(c.phase(), Phase::Done);
        let sent = transport.sent();
        let solution = solution_sent(&sent).expect("solution delivered");
        assert_eq!(solution.solution, b);
        assert!(solution.max_residual <= 1e-6);
        assert_eq!((solution.matrix_size, solution.worker_count, solution.block_size), (4, 2, 2));

        for w in 0..2 {
            let addr = c.config.worker_addr(w);
            assert!(sent.iter().any(|(m, to)| matches!(m, Message::Shutdown) && *to == addr));
            assert!(sent.iter().any(|(m, to)| matches!(m, Message::Ack(_)) && *to == addr));
        }
    }

    fn solution_sent(sent: &[(Message, SocketAddr)]) -> Option<SolutionResult> {
        sent.iter().find_map(|(m, to)| match m {
            Message::Solution(r) if *to == requester() => Some(r.clone()),
            _ => None,
        })
    }

    fn failure_sent(sent: &[(Message, SocketAddr)]) -> Option<String> {
        sent.iter().find_map(|(m, to)| match m {
            Message::SolveFailed { reason, .. } if *to == requester() => Some(reason.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_eliminated_blocks_stitch_solution() {
        let (c, transport) = setup(test_config());
        // unit lower-triangular diagonal blocks, zero elsewhere: forward
        // elimination alone leaves x in the last column
        let m = Matrix::from_rows(vec![
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.5, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.5, 1.0],
        ]);
        let b = vec![1.0, 2.0, 3.0, 4.0];
        submit(&c, 2, &m, &b).await;
        wait_for_phase(&c, "awaiting results").await;

        let tasks = sent_tasks(&transport.sent());
        assert_eq!(tasks.len(), 4);
        for (task, to) in tasks.iter().rev() {
            let worker = c.config.worker_id_for(*to).unwrap();
            deliver(&c, task, worker).await;
        }

        assert_eq!(c.phase(), Phase::Done);
        let solution = solution_sent(&transport.sent()).expect("solution delivered");
        assert_eq!(solution.solution, vec![1.0, 1.5, 3.0, 2.5]);
        assert!(solution.max_residual <= 1e-6);
    }

    #[tokio::test]
    async fn test_invalid_init_is_refused() {
        let (c, transport) = setup(test_config());
        let shapes = [(2, 0, 0), (2, 3, 4), (c.config.worker_limit() + 1, 4, 4)];
        for (worker_count, rows, cols) in shapes {
            c.dispatch(Message::Init { worker_count, rows, cols }, requester()).await;
            assert_eq!(c.phase(), Phase::Idle);
        }

        let refusals = transport
            .sent()
            .iter()
            .filter(|(m, to)| matches!(m, Message::SolveFailed { .. }) && *to == requester())
            .count();
        assert_eq!(refusals, shapes.len());

        // a valid request is still accepted afterwards
        c.dispatch(Message::Init { worker_count: 2, rows: 4, cols: 4 }, requester()).await;
        assert!(matches!(c.phase(), Phase::Negotiated(_)));
    }

    #[tokio::test]
    async fn test_oversized_chunk_count_fails_the_solve() {
        for count in [0, 5, usize::MAX] {
            let (c, transport) = setup(test_config());
            c.dispatch(Message::Init { worker_count: 2, rows: 4, cols: 4 }, requester()).await;
            c.dispatch(Message::Count { chunk_count: count }, requester()).await;

            assert_eq!(c.phase(), Phase::Failed, "count {}", count);
            assert!(failure_sent(&transport.sent()).is_some());
        }
    }

    #[tokio::test]
    async fn test_corrupt_result_from_previous_owner_moves_current_owner() {
        let (c, _transport) = setup(test_config());
        submit(&c, 2, &Matrix::identity(4), &[1.0; 4]).await;
        wait_for_phase(&c, "awaiting results").await;

        let key = BlockKey::new(0, 1);
        assert_eq!(c.ledger.owner(key), Some(1));
        assert_eq!((c.balancer.load_of(0), c.balancer.load_of(1)), (2, 2));

        let corrupt = BlockResultChunk {
            key,
            index: 0,
            total: 1,
            data: "{".to_string(),
            worker_id: 0,
        };
        c.dispatch(Message::ResultChunk(corrupt), c.config.worker_addr(0)).await;

        // the owner (worker 1) is the one relieved and excluded
        assert_eq!(c.ledger.owner(key), Some(0));
        assert_eq!((c.balancer.load_of(0), c.balancer.load_of(1)), (3, 1));
        assert_eq!(c.retries.retry_count(key), 1);
    }

    #[tokio::test]
    async fn test_undeliverable_solution_reports_failure() {
        let (c, transport) = setup(test_config());
        transport.reject_as_oversized("SOLUTION");
        submit(&c, 0, &Matrix::identity(3), &[1.0, 2.0, 3.0]).await;
        wait_for_phase(&c, "done").await;

        let sent = transport.sent();
        assert!(solution_sent(&sent).is_none());
        let reason = failure_sent(&sent).expect("failure notice");
        assert!(reason.contains("could not be delivered"));
    }

    #[tokio::test]
    async fn test_silent_worker_blocks_are_reassigned() {
        let (c, transport) = setup(test_config());
        submit(&c, 2, &Matrix::identity(4), &[1.0; 4]).await;
        wait_for_phase(&c, "awaiting results").await;

        let key = BlockKey::new(0, 1);
        assert_eq!(c.ledger.owner(key), Some(1));
        transport.take_sent();

        tokio::time::sleep(Duration::from_millis(80)).await;
        c.dispatch(Message::Heartbeat { worker_id: 0 }, c.config.worker_addr(0))
            .await;
        c.sweep_health().await;

        assert_eq!(c.ledger.owner(key), Some(0));
        assert_eq!(c.retries.retry_count(key), 1);
        assert!(c.ledger.blocks_of(1).is_empty());

        let resent = sent_tasks(&transport.sent());
        assert!(resent
            .iter()
            .any(|(t, to)| t.key == key && *to == c.config.worker_addr(0)));
        assert!(c.phase().accepts_results());
    }

    #[tokio::test]
    async fn test_task_failure_moves_block_to_other_worker() {
        let (c, _transport) = setup(test_config());
        submit(&c, 2, &Matrix::identity(4), &[1.0; 4]).await;
        wait_for_phase(&c, "awaiting results").await;

        let key = BlockKey::new(0, 1);
        c.dispatch(
            Message::TaskFailed {
                key,
                worker_id: 1,
                reason: "boom".to_string(),
            },
            c.config.worker_addr(1),
        )
        .await;

        assert_eq!(c.ledger.owner(key), Some(0));
        assert_eq!(c.retries.errors(key), vec!["boom".to_string()]);

        // a report from a worker that no longer owns the block is ignored
        c.dispatch(
            Message::TaskFailed {
                key,
                worker_id: 1,
                reason: "late".to_string(),
            },
            c.config.worker_addr(1),
        )
        .await;
        assert_eq!(c.retries.retry_count(key), 1);
    }

    #[tokio::test]
    async fn test_exhausted_block_fails_the_solve() {
        let config = NetConfig {
            max_block_retries: 0,
            ..test_config()
        };
        let (c, transport) = setup(config);
        submit(&c, 2, &Matrix::identity(4), &[1.0; 4]).await;
        wait_for_phase(&c, "awaiting results").await;

        c.dispatch(
            Message::TaskFailed {
                key: BlockKey::new(0, 0),
                worker_id: 0,
                reason: "boom".to_string(),
            },
            c.config.worker_addr(0),
        )
        .await;

        assert_eq!(c.phase(), Phase::Failed);
        let sent = transport.sent();
        assert!(sent.iter().any(|(m, to)| matches!(
            m,
            Message::SolveFailed { failed_blocks, .. } if failed_blocks == &vec![BlockKey::new(0, 0)]
        ) && *to == requester()));
        assert!(sent.iter().any(|(m, _)| matches!(m, Message::Shutdown)));
        assert!(c.ledger.pending().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_falls_back_to_next_worker() {
        let (c, transport) = setup(test_config());
        transport.fail_sends_to(c.config.worker_addr(1));
        submit(&c, 2, &Matrix::identity(4), &[1.0; 4]).await;
        wait_for_phase(&c, "awaiting results").await;

        let tasks = sent_tasks(&transport.sent());
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|(_, to)| *to == c.config.worker_addr(0)));
        assert_eq!(c.ledger.blocks_of(0).len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_block_result_ignored() {
        let (c, transport) = setup(test_config());
        submit(&c, 2, &Matrix::identity(4), &[1.0; 4]).await;
        wait_for_phase(&c, "awaiting results").await;

        let (task, _) = sent_tasks(&transport.sent()).remove(0);
        deliver(&c, &task, 0).await;
        deliver(&c, &task, 0).await;

        let session = c.current_session().unwrap();
        assert_eq!(session.assembler.completed_count(), 1);
        assert!(!c.ledger.is_pending(task.key));
        assert_eq!(c.phase(), Phase::AwaitingResults);
    }

    #[tokio::test]
    async fn test_handshake_guards_and_cancel() {
        let (c, _transport) = setup(test_config());
        let init = |n| Message::Init {
            worker_count: n,
            rows: 4,
            cols: 4,
        };

        c.dispatch(Message::Chunk { index: 0, data: "1|1".into() }, requester()).await;
        assert_eq!(c.phase(), Phase::Idle);

        c.dispatch(init(2), requester()).await;
        c.dispatch(init(3), requester()).await;
        assert!(matches!(c.phase(), Phase::Negotiated(d) if d.worker_count == 2));

        c.dispatch(Message::Cancel, requester()).await;
        assert_eq!(c.phase(), Phase::Idle);
        c.dispatch(init(3), requester()).await;
        assert!(matches!(c.phase(), Phase::Negotiated(d) if d.worker_count == 3));
    }

    #[tokio::test]
    async fn test_cancel_mid_solve_resets_state() {
        let (c, transport) = setup(test_config());
        submit(&c, 2, &Matrix::identity(4), &[1.0; 4]).await;
        wait_for_phase(&c, "awaiting results").await;
        let (task, _) = sent_tasks(&transport.sent()).remove(0);

        c.dispatch(Message::Cancel, requester()).await;
        assert_eq!(c.phase(), Phase::Idle);
        assert!(c.current_session().is_none());
        assert!(c.ledger.pending().is_empty());
        assert!(transport.sent().iter().any(|(m, _)| matches!(m, Message::Shutdown)));

        // late results after a cancel are acknowledged and dropped
        deliver(&c, &task, 0).await;
        assert_eq!(c.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_zero_workers_solves_in_process() {
        let (c, transport) = setup(test_config());
        let b = vec![3.0, 1.0, 2.0];
        submit(&c, 0, &Matrix::identity(3), &b).await;
        wait_for_phase(&c, "done").await;

        let sent = transport.sent();
        assert!(sent_tasks(&sent).is_empty());
        match &sent.last().unwrap().0 {
            Message::Solution(r) => {
                assert_eq!(r.worker_count, 0);
                assert_eq!(r.solution, b);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_bad_payload_reports_failure() {
        let (c, transport) = setup(test_config());
        c.dispatch(
            Message::Init {
                worker_count: 2,
                rows: 2,
                cols: 2,
            },
            requester(),
        )
        .await;
        c.dispatch(Message::Count { chunk_count: 1 }, requester()).await;
        c.dispatch(Message::Chunk { index: 0, data: "1 0|x\n0 1|1".into() }, requester()).await;
        wait_for_phase(&c, "failed").await;

        assert!(transport
            .sent()
            .iter()
            .any(|(m, to)| matches!(m, Message::SolveFailed { failed_blocks, .. } if failed_blocks.is_empty())
                && *to == requester()));
    }
}
