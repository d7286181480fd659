use crate::error::TransportError;
use crate::protocol::Message;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

pub mod chunking;
pub mod outstanding;
pub mod rdt;
pub mod retry;

#[cfg(test)]
pub(crate) mod memory;

pub use rdt::Rdt;

/// Message-level datagram transport used by the coordinator, workers and requester
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send with the packet ceiling enforced and transient failures retried
    async fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError>;

    /// Single best-effort send, no retry
    async fn send_once(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError>;

    /// Wait for the next datagram, failing with `Timeout` after `timeout`
    async fn recv_timeout(&self, timeout: Duration) -> Result<(Message, SocketAddr), TransportError>;
}
