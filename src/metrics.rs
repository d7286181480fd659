use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Packet and byte counters for one process's socket
#[derive(Debug)]
pub struct NetworkMetrics {
    started: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub elapsed_seconds: f64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl NetworkMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }

    /// Emit the counters as one structured log line
    pub fn log_summary(&self, who: &str) {
        let s = self.snapshot();
        let secs = s.elapsed_seconds.max(f64::EPSILON);
        info!(
            process = who,
            elapsed = %format!("{:.2}s", s.elapsed_seconds),
            packets_sent = s.packets_sent,
            packets_received = s.packets_received,
            sent = %format_bytes(s.bytes_sent),
            received = %format_bytes(s.bytes_received),
            send_rate = %format!("{}/s", format_bytes((s.bytes_sent as f64 / secs) as u64)),
            recv_rate = %format!("{}/s", format_bytes((s.bytes_received as f64 / secs) as u64)),
            "network statistics"
        );
    }
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a byte count as B, KB, MB or GB
fn format_bytes(bytes: u64) -> String {
    const SUFFIXES: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut idx = 0;
    while size >= 1024.0 && idx < SUFFIXES.len() - 1 {
        size /= 1024.0;
        idx += 1;
    }
    format!("{:.2} {}", size, SUFFIXES[idx])
}
