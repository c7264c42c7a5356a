//! Cluster Facade
//!
//! The public entry point for applications and the HTTP API. Wraps a
//! running node and exposes statistics, membership management, and
//! backup/restore of the replicated state.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::WolfClusterConfig;
use crate::consensus::{ClusterStats, NodeOptions, RaftCore, RaftNode, Storage};
use crate::error::{Error, Result};
use crate::network::{NetworkClient, NetworkServer, Transport};
use crate::replication::Envelope;
use crate::state::{Peer, PeerRole};
use crate::statemachine::{KvStateMachine, StateMachine};
use crate::wal::{LogIndex, MembershipOp};

/// A running cluster member
pub struct Cluster {
    node: RaftNode,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Stops the TCP listener, if one was started
    transport_stop: Option<watch::Sender<bool>>,
    /// Outbound TCP connections, if the TCP transport is in use
    client: Option<Arc<NetworkClient>>,
}

impl Cluster {
    /// Open storage, start the TCP transport and the node driver
    pub async fn start(config: &WolfClusterConfig) -> Result<Self> {
        Self::start_with(config, Box::new(KvStateMachine::new())).await
    }

    /// Like [`Cluster::start`] with a custom application state machine
    pub async fn start_with(
        config: &WolfClusterConfig,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.data_dir())?;

        let storage = Storage::open(config)?;
        let mut core = RaftCore::new(
            config.node_id(),
            config.advertise_address(),
            config.core_config(),
            storage,
            state_machine,
        )?;
        if config.cluster.bootstrap {
            core.bootstrap(&config.bootstrap_peers()?)?;
        }

        let (inbound_tx, inbound) = mpsc::channel(config.cluster.peer_queue_depth);
        let server = NetworkServer::bind(&config.node.bind_address, inbound_tx).await?;
        let transport_stop = server.shutdown_handle();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Cluster transport failed: {}", e);
            }
        });

        let client = Arc::new(NetworkClient::new(
            config.heartbeat_interval() * 4,
            config.apply_timeout(),
        ));
        let options = NodeOptions {
            tick_interval: config.tick_interval(),
            apply_timeout: config.apply_timeout(),
            peer_queue_depth: config.cluster.peer_queue_depth,
        };

        let mut cluster = Self::from_parts(core, client.clone(), inbound, options);
        cluster.transport_stop = Some(transport_stop);
        cluster.client = Some(client);
        Ok(cluster)
    }

    /// Run an already constructed core over any transport
    pub fn from_parts(
        core: RaftCore,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Envelope>,
        options: NodeOptions,
    ) -> Self {
        let (node, driver) = RaftNode::spawn(core, transport, inbound, options);
        Self {
            node,
            driver: Mutex::new(Some(driver)),
            transport_stop: None,
            client: None,
        }
    }

    /// Current view of this node and its cluster
    pub fn statistics(&self) -> ClusterStats {
        self.node.stats()
    }

    /// Members of the committed membership table
    pub fn peers(&self) -> Vec<Peer> {
        self.node
            .stats()
            .peers
            .into_iter()
            .map(|p| Peer::new(p.id, p.address, p.role, p.joined_at_index))
            .collect()
    }

    /// Address of the current leader, if known
    pub fn leader(&self) -> Option<String> {
        self.node.stats().leader_address
    }

    pub fn is_leader(&self) -> bool {
        self.node.stats().is_leader()
    }

    /// Add the node at `address` as a voter. A new member's id is its
    /// address; a non-voter already at that address is promoted.
    pub async fn join(&self, address: &str) -> Result<()> {
        let id = self
            .node
            .stats()
            .peers
            .into_iter()
            .find(|p| p.address == address)
            .map_or_else(|| address.to_string(), |p| p.id);
        self.join_as(&id, address, PeerRole::Voter).await
    }

    /// Add a member with an explicit id and role
    pub async fn join_as(&self, id: &str, address: &str, role: PeerRole) -> Result<()> {
        tracing::info!("Requesting join of {} ({}) as {}", id, address, role);
        let index = self
            .node
            .change_membership(MembershipOp::Add(Peer::new(id, address, role, 0)))
            .await?;
        tracing::info!("Member {} joined at index {}", id, index);
        Ok(())
    }

    /// Remove the member with this address (or id)
    pub async fn remove(&self, address: &str) -> Result<()> {
        let id = self
            .node
            .stats()
            .peers
            .into_iter()
            .find(|p| p.address == address || p.id == address)
            .map(|p| p.id)
            .ok_or_else(|| Error::NotMember(address.to_string()))?;

        tracing::info!("Requesting removal of {}", id);
        let index = self
            .node
            .change_membership(MembershipOp::Remove { id: id.clone() })
            .await?;
        tracing::info!("Member {} removed at index {}", id, index);
        Ok(())
    }

    /// Submit application data and wait until it is applied
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        self.node.propose(data).await
    }

    /// Capture a snapshot now; returns its index
    pub async fn snapshot(&self) -> Result<LogIndex> {
        Ok(self.node.snapshot().await?.last_included_index)
    }

    /// Latest snapshot plus the committed entries after it
    pub async fn backup(&self) -> Result<Vec<u8>> {
        self.node.backup().await
    }

    /// Replace local state with a backup
    pub async fn restore(&self, bytes: Vec<u8>) -> Result<()> {
        self.restore_with(bytes, false).await
    }

    /// Restore, optionally accepting a backup older than the local commit index
    pub async fn restore_with(&self, bytes: Vec<u8>, force: bool) -> Result<()> {
        let index = self.node.restore(bytes, force).await?;
        tracing::info!("Restore complete at index {}", index);
        Ok(())
    }

    /// Restore from a backup file on this node's filesystem
    pub async fn restore_from_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        tracing::info!("Restoring from {}", path.display());
        let bytes = tokio::fs::read(path).await?;
        self.restore(bytes).await
    }

    /// Serialized application state
    pub async fn state_image(&self) -> Result<Vec<u8>> {
        self.node.state_image().await
    }

    /// Subscribe to statistics updates
    pub fn watch(&self) -> watch::Receiver<ClusterStats> {
        self.node.watch()
    }

    /// Stop the node and its transport
    pub async fn shutdown(&self) {
        self.node.shutdown().await;
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.await {
                tracing::error!("Node driver panicked: {}", e);
            }
        }
        if let Some(stop) = &self.transport_stop {
            let _ = stop.send(true);
        }
        if let Some(client) = &self.client {
            client.close_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(dir: &Path) -> WolfClusterConfig {
        let mut config = WolfClusterConfig::for_node("127.0.0.1:0", dir.to_path_buf());
        config.node.id = "solo".into();
        config.node.advertise_address = Some("127.0.0.1:1".into());
        config.cluster.bootstrap = true;
        config.cluster.tick_interval_ms = 5;
        config.cluster.heartbeat_interval_ms = 10;
        config.cluster.election_timeout_min_ms = 20;
        config.cluster.election_timeout_max_ms = 40;
        config.cluster.leader_lease_timeout_ms = 40;
        config
    }

    async fn wait_leader(cluster: &Cluster) {
        let mut status = cluster.watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !status.borrow().is_leader() {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_single_node_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let cluster = Cluster::start(&cfg).await.unwrap();
        wait_leader(&cluster).await;
        assert_eq!(cluster.peers().len(), 1);
        let cmd = crate::statemachine::KvCommand::Set {
            key: "k".into(),
            value: "v".into(),
        };
        let index = cluster.propose(cmd.encode().unwrap()).await.unwrap();
        cluster.shutdown().await;

        let cluster = Cluster::start(&cfg).await.unwrap();
        let stats = cluster.statistics();
        assert!(stats.last_applied_index >= index);
        assert_eq!(stats.peers.len(), 1);

        let image = cluster.state_image().await.unwrap();
        let data = KvStateMachine::decode_image(&image).unwrap();
        assert_eq!(data.get("k").map(String::as_str), Some("v"));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_member() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::start(&config(dir.path())).await.unwrap();
        wait_leader(&cluster).await;
        let err = cluster.remove("10.9.9.9:7654").await.unwrap_err();
        assert!(matches!(err, Error::NotMember(_)));

        let err = cluster.remove("solo").await.unwrap_err();
        assert!(matches!(err, Error::WouldBreakQuorum(_)));
        cluster.shutdown().await;
    }
}
