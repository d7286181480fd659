use super::Transport;
use crate::error::TransportError;
use crate::protocol::Message;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

/// Loopback-free transport for tests: records every send and replays queued inbound messages
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(Message, SocketAddr)>>,
    inbound: Mutex<VecDeque<(Message, SocketAddr)>>,
    failing: Mutex<Vec<SocketAddr>>,
    oversized: Mutex<Vec<&'static str>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, message: Message, from: SocketAddr) {
        self.inbound.lock().unwrap().push_back((message, from));
    }

    /// Make every send to `addr` fail with an I/O error
    pub fn fail_sends_to(&self, addr: SocketAddr) {
        self.failing.lock().unwrap().push(addr);
    }

    /// Reject every message of this kind as over the packet ceiling
    pub fn reject_as_oversized(&self, kind: &'static str) {
        self.oversized.lock().unwrap().push(kind);
    }

    pub fn sent(&self) -> Vec<(Message, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<(Message, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn record(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        if self.failing.lock().unwrap().contains(&to) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "unreachable",
            )));
        }
        if self.oversized.lock().unwrap().contains(&message.kind()) {
            return Err(TransportError::PayloadTooLarge {
                size: usize::MAX,
                limit: 0,
            });
        }
        self.sent.lock().unwrap().push((message.clone(), to));
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        self.record(message, to)
    }

    async fn send_once(&self, message: &Message, to: SocketAddr) -> Result<(), TransportError> {
        self.record(message, to)
    }

    async fn recv_timeout(&self, timeout: Duration) -> Result<(Message, SocketAddr), TransportError> {
        let next = self.inbound.lock().unwrap().pop_front();
        match next {
            Some(entry) => Ok(entry),
            None => {
                tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }
}
