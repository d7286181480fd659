//! Worker process: eliminates blocks and ships results back in acknowledged chunks.

pub mod processor;

use crate::config::NetConfig;
use crate::error::TransportError;
use crate::metrics::NetworkMetrics;
use crate::protocol::Message;
use crate::transport::Transport;
use crate::transport::chunking::chunk_result;
use crate::transport::outstanding::OutstandingChunks;
use crate::types::{BlockResult, BlockTask};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

pub use processor::process_block;

pub struct Worker {
    id: usize,
    config: NetConfig,
    transport: Arc<dyn Transport>,
    coordinator: SocketAddr,
    outstanding: OutstandingChunks,
    stop: AtomicBool,
    metrics: Arc<NetworkMetrics>,
}

impl Worker {
    pub fn new(id: usize, config: NetConfig, transport: Arc<dyn Transport>, metrics: Arc<NetworkMetrics>) -> Self {
        let coordinator = config.coordinator_addr();
        Self {
            id,
            config,
            transport,
            coordinator,
            outstanding: OutstandingChunks::new(),
            stop: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Serve until `SHUTDOWN` arrives or `stop` is called
    pub async fn run(self: Arc<Self>) {
        info!(worker = self.id, coordinator = %self.coordinator, "worker started");

        tokio::spawn(Arc::clone(&self).heartbeat_loop());
        tokio::spawn(Arc::clone(&self).resend_loop());

        let poll = self.config.recv_poll_interval();
        while !self.is_stopped() {
            match self.transport.recv_timeout(poll).await {
                Ok((message, from)) => self.handle(message, from),
                Err(TransportError::Timeout(_)) => {}
                Err(TransportError::MalformedMessage(reason)) => {
                    warn!(worker = self.id, %reason, "dropping malformed datagram");
                }
                Err(e) => warn!(worker = self.id, error = %e, "receive failed"),
            }
        }

        if !self.outstanding.is_empty() {
            warn!(worker = self.id, unacked = self.outstanding.len(), "exiting with unacknowledged chunks");
        }
        self.metrics.log_summary(&format!("worker {}", self.id));
        info!(worker = self.id, "worker stopped");
    }

    fn handle(self: &Arc<Self>, message: Message, from: SocketAddr) {
        match message {
            Message::Task(task) => {
                tokio::spawn(Arc::clone(self).handle_task(task));
            }
            Message::Ack(ack) => {
                if self.outstanding.acknowledge(&ack.tracking_id()) {
                    debug!(worker = self.id, chunk = %ack.tracking_id(), "chunk acknowledged");
                }
            }
            Message::Shutdown => {
                info!(worker = self.id, "shutdown received");
                self.stop();
            }
            other => {
                warn!(worker = self.id, kind = other.kind(), %from, "unexpected message");
            }
        }
    }

    /// Eliminate one block and send the result, or report why it failed
    pub async fn handle_task(self: Arc<Self>, task: BlockTask) {
        info!(worker = self.id, block = %task.key, rows = task.block.rows, cols = task.block.cols, "task received");

        let key = task.key;
        let reason = match process_block(&task) {
            Ok(block) => {
                let result = BlockResult {
                    worker_id: self.id,
                    key,
                    block,
                };
                match self.send_result(&result).await {
                    Ok(chunks) => {
                        info!(worker = self.id, block = %key, chunks, "result sent");
                        return;
                    }
                    Err(e) => e.to_string(),
                }
            }
            Err(e) => e.to_string(),
        };

        warn!(worker = self.id, block = %key, %reason, "task failed");
        let report = Message::TaskFailed {
            key,
            worker_id: self.id,
            reason,
        };
        if let Err(e) = self.transport.send(&report, self.coordinator).await {
            warn!(worker = self.id, block = %key, error = %e, "could not report task failure");
        }
    }

    /// Chunk and send a result; every chunk is tracked before it goes out
    async fn send_result(&self, result: &BlockResult) -> Result<usize, TransportError> {
        let chunks = chunk_result(result, self.config.max_chunk_size)?;
        let total = chunks.len();

        for chunk in chunks {
            self.outstanding.track(&chunk, Instant::now());
            let id = chunk.tracking_id();
            if let Err(e) = self.transport.send(&Message::ResultChunk(chunk), self.coordinator).await {
                if !e.is_transient() {
                    self.outstanding.acknowledge(&id);
                    return Err(e);
                }
                warn!(worker = self.id, chunk = %id, error = %e, "chunk send failed, left for resend");
            }
            tokio::time::sleep(self.config.chunk_transmission_delay()).await;
        }
        Ok(total)
    }

    /// Resend chunks whose acknowledgement is overdue at `now`
    pub async fn resend_overdue(&self, now: Instant) -> usize {
        let due = self.outstanding.due_for_resend(now, self.config.ack_timeout());
        let count = due.len();
        for chunk in due {
            debug!(worker = self.id, chunk = %chunk.tracking_id(), "resending unacknowledged chunk");
            if let Err(e) = self.transport.send(&Message::ResultChunk(chunk), self.coordinator).await {
                warn!(worker = self.id, error = %e, "resend failed");
            }
        }
        count
    }

    pub async fn send_heartbeat(&self) {
        let beat = Message::Heartbeat { worker_id: self.id };
        if let Err(e) = self.transport.send_once(&beat, self.coordinator).await {
            warn!(worker = self.id, error = %e, "heartbeat send failed");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval();
        while !self.is_stopped() {
            self.send_heartbeat().await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn resend_loop(self: Arc<Self>) {
        let interval = self.config.unacked_check_interval();
        while !self.is_stopped() {
            tokio::time::sleep(interval).await;
            self.resend_overdue(Instant::now()).await;
        }
    }
}
