//! # UDP Endpoint
//!
//! The single socket every map client talks to.
//!
//! Receives go through a [`BufferPool`] so the hot loop reuses its 4096-byte
//! read buffers; callers get a right-sized copy of each datagram.
//! Sends never hold a session lock; callers assemble under the lock and write
//! after releasing it.
//!
//! ## Shutdown
//! [`shutdown_channel`] wires Ctrl-C into the same `mpsc` channel a caller can
//! use to stop the router programmatically.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{info, instrument, trace};

use crate::error::Result;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::metrics::Metrics;

#[derive(Clone)]
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    buffers: BufferPool,
    metrics: Arc<Metrics>,
}

impl UdpEndpoint {
    /// Bind the listening socket.
    #[instrument(skip(metrics))]
    pub async fn bind(addr: &str, recv_buffer_size: usize, metrics: Arc<Metrics>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(address = %socket.local_addr()?, "Listening for map datagrams");
        Ok(Self::from_socket(socket, recv_buffer_size, metrics))
    }

    pub fn from_socket(socket: UdpSocket, recv_buffer_size: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            socket: Arc::new(socket),
            buffers: BufferPool::new(32, recv_buffer_size),
            metrics,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the next datagram. The returned buffer is owned and mutable so
    /// it can be decrypted in place.
    pub async fn recv(&self) -> Result<(BytesMut, SocketAddr)> {
        let mut buf = self.buffers.acquire();
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        self.metrics.datagram_received(len as u64);
        trace!(client = %addr, len, "Datagram received");
        Ok((BytesMut::from(&buf[..len]), addr))
    }

    pub async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> Result<()> {
        let sent = self.socket.send_to(datagram, addr).await?;
        self.metrics.datagram_sent(sent as u64);
        trace!(client = %addr, len = sent, "Datagram sent");
        Ok(())
    }
}

/// Shutdown channel that also fires on Ctrl-C.
pub fn shutdown_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = signal_tx.send(()).await;
        }
    });

    (shutdown_tx, shutdown_rx)
}
