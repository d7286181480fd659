use super::Transport;
use super::retry::RetryPolicy;
use crate::config::NetConfig;
use crate::error::TransportError;
use crate::metrics::NetworkMetrics;
use crate::protocol::Message;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::trace;

/// Reliable datagram transport over one UDP socket.
///
/// Enforces the packet ceiling on every outbound message, retries transient
/// send failures with backoff and turns receive deadlines into `Timeout`.
/// Chunk acknowledgement and resend live with the senders that need them.
pub struct Rdt {
    socket: UdpSocket,
    retry: RetryPolicy,
    max_packet_size: usize,
    recv_buffer_size: usize,
    metrics: Arc<NetworkMetrics>,
}

impl Rdt {
    pub async fn bind(
        addr: SocketAddr,
        config: &NetConfig,
        metrics: Arc<NetworkMetrics>,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_delay()),
            max_packet_size: config.max_packet_size,
            recv_buffer_size: config.recv_buffer_size.max(config.max_packet_size),
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    #[cfg(test)]
    pub fn metrics(&self) -> &NetworkMetrics {
        &self.metrics
    }

    fn encode_checked(&self, message: &Message) -> Result<Vec<u8>, TransportError> {
        let bytes = message.encode()?;
        if bytes.len() > self.max_packet_size {
            return Err(TransportError::PayloadTooLarge {
                size: bytes.len(),
                limit: self.max_packet_size,
            });
        }
        Ok(bytes)
    }

    async fn send_bytes(&self, bytes: &[u8], to: SocketAddr) -> Result<(), TransportError> {
        self.socket.send_to(bytes, to).await?;
        self.metrics.record_sent(bytes.len());
        Ok(())
    }
}

#[async_trait]
impl Transport for Rdt {
    async fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let bytes = self.encode_checked(message)?;
        trace!(kind = message.kind(), bytes = bytes.len(), %to, "send");
        self.retry.run(|| self.send_bytes(&bytes, to)).await
    }

    async fn send_once(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        let bytes = self.encode_checked(message)?;
        self.send_bytes(&bytes, to).await
    }

    async fn recv_timeout(&self, timeout: Duration) -> Result<(Message, SocketAddr), TransportError> {
        let mut buf = vec![0u8; self.recv_buffer_size];
        let (len, from) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;

        self.metrics.record_received(len);
        let message = Message::decode(&buf[..len])?;
        trace!(kind = message.kind(), bytes = len, %from, "recv");
        Ok((message, from))
    }
}
