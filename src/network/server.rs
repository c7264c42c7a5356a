//! Network Server
//!
//! TCP listener that accepts framed envelopes from other nodes and
//! forwards them to the local node's inbox.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::read_envelope;
use crate::error::{Error, Result};
use crate::replication::Envelope;

/// Network server for cluster communication
pub struct NetworkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Inbox of the local node
    incoming_tx: mpsc::Sender<Envelope>,
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str, incoming_tx: mpsc::Sender<Envelope>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            local_addr,
            incoming_tx,
            shutdown,
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops the accept loop
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Accept connections until shut down
    pub async fn run(self) -> Result<()> {
        tracing::info!("Cluster transport listening on {}", self.local_addr);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let incoming_tx = self.incoming_tx.clone();
                            let shutdown_rx = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, incoming_tx, shutdown_rx).await {
                                    tracing::debug!("Connection from {} closed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Cluster transport stopped");
        Ok(())
    }
}

/// Read envelopes from one peer connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    incoming_tx: mpsc::Sender<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, _writer) = socket.into_split();

    loop {
        let envelope = tokio::select! {
            result = read_envelope(&mut reader) => result,
            _ = shutdown_rx.changed() => return Ok(()),
        };
        match envelope {
            Ok(envelope) => {
                tracing::trace!(
                    "Received {} from {} ({})",
                    envelope.message.type_name(),
                    envelope.from,
                    peer_addr
                );
                if incoming_tx.send(envelope).await.is_err() {
                    return Err(Error::ShuttingDown);
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}
