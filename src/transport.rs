use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::config::{DEFAULT_CHANNEL_BUFFER_SIZE, MAX_UDP_PACKET_SIZE};

/// A raw inbound UDP packet.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub remote_addr: SocketAddr,
    pub data: Vec<u8>,
}

/// Network surface the protocol engine runs against: datagrams for
/// probing and gossip, streams for push/pull and reliable user messages.
///
/// The default implementation binds real sockets; tests inject a
/// recording mock instead.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Fire a single datagram at `target`.
    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()>;

    /// Subscribe to inbound datagrams.
    fn incoming(&self) -> broadcast::Receiver<Datagram>;

    /// Accept the next inbound stream connection.
    async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr)>;

    /// Open a stream to a peer, bounded by `dial_timeout`.
    async fn dial_stream(&self, target: SocketAddr, dial_timeout: Duration) -> Result<TcpStream>;

    /// Stop the inbound read loop and release the sockets.
    async fn shutdown(&self) -> Result<()>;
}

/// Tokio-backed transport: one UDP socket and one TCP listener bound to
/// the same address. The TCP listener is bound first so a UDP bind
/// failure can close it before surfacing the error. Both sockets live
/// behind `Option`s that `shutdown` empties, releasing them once any
/// in-flight operation completes.
pub struct DefaultTransport {
    local_addr: SocketAddr,
    udp_socket: RwLock<Option<Arc<UdpSocket>>>,
    tcp_listener: RwLock<Option<Arc<TcpListener>>>,
    datagram_tx: broadcast::Sender<Datagram>,
    reader_shutdown: broadcast::Sender<()>,
}

impl DefaultTransport {
    pub async fn new(ip_addr: IpAddr, port: u16) -> Result<Self> {
        let bind_addr = SocketAddr::new(ip_addr, port);

        let tcp_listener = TcpListener::bind(bind_addr)
            .await
            .context("failed to bind TCP listener")?;
        let udp_socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                // Dropping the TCP listener closes it.
                drop(tcp_listener);
                return Err(e).context("failed to bind UDP socket");
            }
        };
        let local_addr = udp_socket
            .local_addr()
            .context("failed to read bound address")?;

        let (datagram_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (reader_shutdown, shutdown_rx) = broadcast::channel(1);
        Self::spawn_reader(Arc::clone(&udp_socket), datagram_tx.clone(), shutdown_rx);

        info!(addr = %local_addr, "transport listening");
        Ok(Self {
            local_addr,
            udp_socket: RwLock::new(Some(udp_socket)),
            tcp_listener: RwLock::new(Some(Arc::new(tcp_listener))),
            datagram_tx,
            reader_shutdown,
        })
    }

    fn spawn_reader(
        socket: Arc<UdpSocket>,
        datagram_tx: broadcast::Sender<Datagram>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, remote_addr)) => {
                                let datagram = Datagram {
                                    remote_addr,
                                    data: buf[..len].to_vec(),
                                };
                                // Nobody listening yet is fine.
                                let _ = datagram_tx.send(datagram);
                            }
                            Err(e) => {
                                error!("failed to receive datagram: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("datagram reader stopping");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl NodeTransport for DefaultTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<()> {
        if data.len() > MAX_UDP_PACKET_SIZE {
            return Err(anyhow!(
                "datagram too large: {} bytes, limit is {}",
                data.len(),
                MAX_UDP_PACKET_SIZE
            ));
        }
        let socket = self
            .udp_socket
            .read()
            .as_ref()
            .ok_or_else(|| anyhow!("transport is shut down"))?
            .clone();
        socket
            .send_to(data, target)
            .await
            .with_context(|| format!("failed to send datagram to {}", target))?;
        Ok(())
    }

    fn incoming(&self) -> broadcast::Receiver<Datagram> {
        self.datagram_tx.subscribe()
    }

    async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr)> {
        let listener = self
            .tcp_listener
            .read()
            .as_ref()
            .ok_or_else(|| anyhow!("transport is shut down"))?
            .clone();
        listener
            .accept()
            .await
            .context("failed to accept stream connection")
    }

    async fn dial_stream(&self, target: SocketAddr, dial_timeout: Duration) -> Result<TcpStream> {
        timeout(dial_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| anyhow!("stream dial to {} timed out", target))?
            .with_context(|| format!("failed to connect to {}", target))
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self.reader_shutdown.send(());
        self.udp_socket.write().take();
        self.tcp_listener.write().take();
        Ok(())
    }
}
