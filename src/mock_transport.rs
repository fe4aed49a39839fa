use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::config::DEFAULT_CHANNEL_BUFFER_SIZE;
use crate::transport::{Datagram, NodeTransport};

/// In-memory transport for protocol tests: records every outbound
/// datagram and lets the test inject inbound ones. Stream operations are
/// unavailable; tests that need them use real sockets on loopback.
pub(crate) struct MockTransport {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    datagram_tx: broadcast::Sender<Datagram>,
}

impl MockTransport {
    pub(crate) fn new(local_addr: SocketAddr) -> Self {
        let (datagram_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        Self {
            local_addr,
            sent: Mutex::new(Vec::new()),
            datagram_tx,
        }
    }

    pub(crate) fn sent_datagrams(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.lock().clone()
    }

    pub(crate) fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Deliver a datagram as if it had arrived off the wire.
    pub(crate) fn inject(&self, from: SocketAddr, data: Vec<u8>) {
        let _ = self.datagram_tx.send(Datagram {
            remote_addr: from,
            data,
        });
    }
}

#[async_trait]
impl NodeTransport for MockTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        self.sent.lock().push((target, data.to_vec()));
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<Datagram> {
        self.datagram_tx.subscribe()
    }

    async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr)> {
        // No stream support; park forever so the listener task idles.
        futures::future::pending().await
    }

    async fn dial_stream(&self, target: SocketAddr, _dial_timeout: Duration) -> Result<TcpStream> {
        Err(anyhow!("mock transport cannot dial {}", target))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
