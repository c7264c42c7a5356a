//! Network Client
//!
//! TCP transport for sending envelopes to peers over pooled connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{write_envelope, Transport};
use crate::error::{Error, Result};
use crate::replication::Envelope;

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Connection pool: address -> write half
    pool: RwLock<HashMap<String, Arc<Mutex<OwnedWriteHalf>>>>,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl NetworkClient {
    pub fn new(connect_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            send_timeout,
        }
    }

    async fn send_inner(&self, address: &str, envelope: &Envelope) -> Result<()> {
        // Try the pooled connection first
        let pooled = self.pool.read().await.get(address).cloned();
        if let Some(conn) = pooled {
            let mut writer = conn.lock().await;
            match write_envelope(&mut *writer, envelope).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed: {}; reconnecting", address, e);
                    drop(writer);
                    self.pool.write().await.remove(address);
                }
            }
        }

        let stream = self.connect(address).await?;
        let (_reader, mut writer) = stream.into_split();
        write_envelope(&mut writer, envelope).await?;
        self.pool
            .write()
            .await
            .insert(address.to_string(), Arc::new(Mutex::new(writer)));
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Close all connections
    pub async fn close_all(&self) {
        self.pool.write().await.clear();
    }

    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

#[async_trait]
impl Transport for NetworkClient {
    async fn send(&self, address: &str, envelope: &Envelope) -> Result<()> {
        match timeout(self.send_timeout, self.send_inner(address, envelope)).await {
            Ok(result) => result,
            Err(_) => {
                self.pool.write().await.remove(address);
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkServer;
    use crate::replication::Message;
    use tokio::sync::mpsc;

    fn heartbeat(to: &str) -> Envelope {
        Envelope {
            from: "leader".into(),
            from_address: "127.0.0.1:1".into(),
            to: to.into(),
            message: Message::AppendEntries {
                term: 2,
                leader_id: "leader".into(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_send_reuses_connection() {
        let (tx, mut rx) = mpsc::channel(16);
        let server = NetworkServer::bind("127.0.0.1:0", tx).await.unwrap();
        let address = server.local_addr().to_string();
        let stop = server.shutdown_handle();
        tokio::spawn(server.run());

        let client = NetworkClient::new(Duration::from_secs(1), Duration::from_secs(1));
        client.send(&address, &heartbeat("f1")).await.unwrap();
        client.send(&address, &heartbeat("f2")).await.unwrap();
        assert_eq!(client.connection_count().await, 1);

        assert_eq!(rx.recv().await.unwrap().to, "f1");
        assert_eq!(rx.recv().await.unwrap().to, "f2");
        let _ = stop.send(true);
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let client = NetworkClient::new(Duration::from_millis(100), Duration::from_millis(500));
        // Nothing listens on port 1
        let result = client.send("127.0.0.1:1", &heartbeat("x")).await;
        assert!(result.is_err());
        assert_eq!(client.connection_count().await, 0);
    }
}
