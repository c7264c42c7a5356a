//! In-process transport
//!
//! Routes envelopes between nodes of one process through channels.
//! Addresses can be isolated to simulate a network partition.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Transport;
use crate::error::{Error, Result};
use crate::replication::Envelope;

#[derive(Default)]
struct Routes {
    inboxes: HashMap<String, mpsc::Sender<Envelope>>,
    isolated: HashSet<String>,
}

/// A shared switchboard of in-process nodes
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` and return its inbox
    pub fn register(&self, address: &str, depth: usize) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(depth);
        self.with_routes(|routes| {
            routes.inboxes.insert(address.to_string(), tx);
        });
        rx
    }

    /// Transport handle for the node at `address`
    pub fn transport(&self, address: &str) -> InMemoryTransport {
        InMemoryTransport {
            network: self.clone(),
            local: address.to_string(),
        }
    }

    /// Cut `address` off from every other node
    pub fn isolate(&self, address: &str) {
        self.with_routes(|routes| {
            routes.isolated.insert(address.to_string());
        });
    }

    /// Remove all partitions
    pub fn heal(&self) {
        self.with_routes(|routes| routes.isolated.clear());
    }

    fn with_routes<T>(&self, f: impl FnOnce(&mut Routes) -> T) -> T {
        let mut guard = match self.routes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// Sends on behalf of one registered address
#[derive(Clone)]
pub struct InMemoryTransport {
    network: InMemoryNetwork,
    local: String,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, address: &str, envelope: &Envelope) -> Result<()> {
        let inbox = self.network.with_routes(|routes| {
            if routes.isolated.contains(&self.local) || routes.isolated.contains(address) {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: "partitioned".into(),
                });
            }
            routes
                .inboxes
                .get(address)
                .cloned()
                .ok_or_else(|| Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: "no such node".into(),
                })
        })?;

        inbox
            .try_send(envelope.clone())
            .map_err(|e| Error::Network(format!("inbox of {} unavailable: {}", address, e)))
    }
}
