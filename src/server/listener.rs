//! Control server listener
//!
//! Handles the TCP accept loop and spawns connection handlers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::commands::CommandBus;
use crate::server::connection::Connection;
use crate::sweep::StatusBroadcast;
use crate::utils::AppResult;

pub struct ControlServer {
    listener: TcpListener,
    bus: CommandBus,
    status: broadcast::Sender<StatusBroadcast>,
    next_session_id: AtomicU64,
}

impl ControlServer {
    /// Bind the control socket. Port 0 picks a free port.
    pub async fn bind(
        addr: &str,
        bus: CommandBus,
        status: broadcast::Sender<StatusBroadcast>,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Control server listening");
        Ok(Self {
            listener,
            bus,
            status,
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Control server shutting down");
            }
            _ = self.accept_loop() => {}
        }
    }

    async fn accept_loop(&self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id = session_id, peer = %peer_addr, "New control connection");

        if let Err(e) = socket.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to configure socket");
        }

        let connection = Connection::new(session_id, self.bus.clone(), self.status.subscribe());
        tokio::spawn(async move {
            if let Err(e) = connection.run(socket).await {
                tracing::debug!(session_id = session_id, error = %e, "Connection error");
            }
            tracing::debug!(session_id = session_id, "Control connection closed");
        });
    }
}
