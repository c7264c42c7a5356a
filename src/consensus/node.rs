//! Node driver
//!
//! Runs a [`RaftCore`] inside a single tokio task. Callers talk to it
//! through a cloneable [`RaftNode`] handle; ticks, inbound envelopes and
//! requests are multiplexed with `tokio::select!`. Outgoing messages go
//! through one sender task per peer so a slow peer never stalls the
//! others.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use super::core::{CoreEvent, Outbound, RaftCore};
use super::stats::ClusterStats;
use crate::error::{Error, Result};
use crate::network::Transport;
use crate::replication::Envelope;
use crate::snapshot::Snapshot;
use crate::wal::{EntryPayload, LogIndex, MembershipOp, Term};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Driver timing
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub tick_interval: Duration,
    /// How long a proposal waits for its entry to apply
    pub apply_timeout: Duration,
    /// Queue depth of each peer sender
    pub peer_queue_depth: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            apply_timeout: Duration::from_secs(5),
            peer_queue_depth: 1024,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Resolves when a proposed entry is applied
type Completion = oneshot::Receiver<Result<LogIndex>>;

enum Request {
    Propose {
        payload: EntryPayload,
        response: Reply<(LogIndex, Completion)>,
    },
    Membership {
        op: MembershipOp,
        response: Reply<(LogIndex, Completion)>,
    },
    Bootstrap {
        peers: Vec<(String, String)>,
        response: Reply<bool>,
    },
    Snapshot {
        response: Reply<Snapshot>,
    },
    Backup {
        response: Reply<Vec<u8>>,
    },
    Restore {
        bytes: Vec<u8>,
        force: bool,
        response: Reply<LogIndex>,
    },
    StateImage {
        response: Reply<Vec<u8>>,
    },
    Shutdown,
}

/// A proposal waiting for its entry
struct Waiter {
    term: Term,
    response: oneshot::Sender<Result<LogIndex>>,
}

/// Handle to a running node
#[derive(Clone)]
pub struct RaftNode {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<ClusterStats>,
    apply_timeout: Duration,
}

impl RaftNode {
    /// Start the driver task for `core`
    pub fn spawn(
        core: RaftCore,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Envelope>,
        options: NodeOptions,
    ) -> (Self, JoinHandle<()>) {
        let (requests, receiver) = mpsc::channel(256);
        let (status_tx, status) = watch::channel(core.stats());

        let driver = Driver {
            core,
            transport,
            senders: HashMap::new(),
            waiters: BTreeMap::new(),
            status: status_tx,
            peer_queue_depth: options.peer_queue_depth,
        };
        let handle = tokio::spawn(driver.run(receiver, inbound, options.tick_interval));

        let node = Self {
            requests,
            status,
            apply_timeout: options.apply_timeout,
        };
        (node, handle)
    }

    /// Latest published statistics; never blocks on consensus
    pub fn stats(&self) -> ClusterStats {
        self.status.borrow().clone()
    }

    /// Subscribe to statistics updates
    pub fn watch(&self) -> watch::Receiver<ClusterStats> {
        self.status.clone()
    }

    /// Propose application data and wait until it is applied
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        let completion = self
            .call(|response| Request::Propose {
                payload: EntryPayload::Data(data),
                response,
            })
            .await?;
        self.wait_applied(completion).await
    }

    /// Propose a membership change and wait until it is applied
    pub async fn change_membership(&self, op: MembershipOp) -> Result<LogIndex> {
        let completion = self
            .call(|response| Request::Membership { op, response })
            .await?;
        self.wait_applied(completion).await
    }

    pub async fn bootstrap(&self, peers: Vec<(String, String)>) -> Result<bool> {
        self.call(|response| Request::Bootstrap { peers, response }).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.call(|response| Request::Snapshot { response }).await
    }

    pub async fn backup(&self) -> Result<Vec<u8>> {
        self.call(|response| Request::Backup { response }).await
    }

    pub async fn restore(&self, bytes: Vec<u8>, force: bool) -> Result<LogIndex> {
        self.call(|response| Request::Restore {
            bytes,
            force,
            response,
        })
        .await
    }

    pub async fn state_image(&self) -> Result<Vec<u8>> {
        self.call(|response| Request::StateImage { response }).await
    }

    /// Stop the driver; outstanding proposals fail with `ShuttingDown`
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    async fn wait_applied(&self, (index, completion): (LogIndex, Completion)) -> Result<LogIndex> {
        match timeout(self.apply_timeout, completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => Err(Error::Timeout(index)),
        }
    }
}

struct Driver {
    core: RaftCore,
    transport: Arc<dyn Transport>,
    /// Per-address outbound queues
    senders: HashMap<String, mpsc::Sender<Envelope>>,
    waiters: BTreeMap<LogIndex, Waiter>,
    status: watch::Sender<ClusterStats>,
    peer_queue_depth: usize,
}

impl Driver {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut inbound: mpsc::Receiver<Envelope>,
        tick_interval: Duration,
    ) {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Node {} driver started", self.core.id());

        loop {
            tokio::select! {
                request = requests.recv() => {
                    match request {
                        Some(Request::Shutdown) | None => break,
                        Some(request) => self.handle_request(request),
                    }
                }
                Some(envelope) = inbound.recv() => {
                    if let Err(e) = self.core.step(envelope) {
                        tracing::error!("Failed to handle message: {}", e);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.core.tick() {
                        tracing::error!("Tick failed: {}", e);
                    }
                    self.waiters.retain(|_, w| !w.response.is_closed());
                }
            }
            self.flush();
        }

        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.response.send(Err(Error::ShuttingDown));
        }
        tracing::info!("Node {} driver stopped", self.core.id());
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Propose { payload, response } => {
                let result = self.core.propose(payload);
                let _ = response.send(result.map(|(index, term)| self.register(index, term)));
            }
            Request::Membership { op, response } => {
                let result = self.core.propose_membership(op);
                let _ = response.send(result.map(|(index, term)| self.register(index, term)));
            }
            Request::Bootstrap { peers, response } => {
                let _ = response.send(self.core.bootstrap(&peers));
            }
            Request::Snapshot { response } => {
                let _ = response.send(self.core.snapshot());
            }
            Request::Backup { response } => {
                let _ = response.send(self.core.backup());
            }
            Request::Restore {
                bytes,
                force,
                response,
            } => {
                let _ = response.send(self.core.restore(&bytes, force));
            }
            Request::StateImage { response } => {
                let _ = response.send(self.core.state_image());
            }
            Request::Shutdown => {}
        }
    }

    fn register(&mut self, index: LogIndex, term: Term) -> (LogIndex, Completion) {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(index, Waiter { term, response: tx });
        (index, rx)
    }

    /// Resolve waiters, dispatch messages and publish statistics
    fn flush(&mut self) {
        for event in self.core.take_events() {
            match event {
                CoreEvent::Applied { index, term } => {
                    if let Some(waiter) = self.waiters.remove(&index) {
                        let result = if waiter.term == term {
                            Ok(index)
                        } else {
                            Err(Error::Unavailable(format!(
                                "entry {} was replaced by a newer leader",
                                index
                            )))
                        };
                        let _ = waiter.response.send(result);
                    }
                }
                CoreEvent::LeadershipLost { term } => {
                    for (index, waiter) in std::mem::take(&mut self.waiters) {
                        let _ = waiter.response.send(Err(Error::Unavailable(format!(
                            "leadership lost in term {} before entry {} applied",
                            term, index
                        ))));
                    }
                }
                CoreEvent::BecameLeader { term } => {
                    tracing::debug!("Driver observed leadership for term {}", term);
                }
            }
        }

        for outbound in self.core.take_outbox() {
            self.dispatch(outbound);
        }

        let stats = self.core.stats();
        self.status.send_if_modified(|current| {
            if *current != stats {
                *current = stats;
                true
            } else {
                false
            }
        });
    }

    fn dispatch(&mut self, outbound: Outbound) {
        let Outbound { address, envelope } = outbound;
        let depth = self.peer_queue_depth;
        let transport = &self.transport;
        let sender = self.senders.entry(address.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(depth);
            tokio::spawn(peer_sender(address.clone(), transport.clone(), rx));
            tx
        });

        match sender.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                tracing::debug!(
                    "Queue to {} full; dropping {}",
                    address,
                    envelope.message.type_name()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.senders.remove(&address);
            }
        }
    }
}

/// Deliver queued envelopes to one peer, backing off after failures
async fn peer_sender(
    address: String,
    transport: Arc<dyn Transport>,
    mut queue: mpsc::Receiver<Envelope>,
) {
    let mut backoff = INITIAL_BACKOFF;
    let mut failing = false;

    while let Some(envelope) = queue.recv().await {
        match transport.send(&address, &envelope).await {
            Ok(()) => {
                if failing {
                    tracing::info!("Peer {} reachable again", address);
                }
                failing = false;
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                if !failing {
                    tracing::warn!("Failed to send to {}: {}", address, e);
                }
                failing = true;
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{CoreConfig, Storage};
    use crate::network::InMemoryNetwork;
    use crate::statemachine::{KvCommand, KvStateMachine};

    fn single_node() -> (RaftNode, JoinHandle<()>) {
        let net = InMemoryNetwork::new();
        let inbox = net.register("n1", 64);
        let config = CoreConfig {
            election_ticks_min: 2,
            election_ticks_max: 4,
            seed: Some(7),
            ..CoreConfig::default()
        };
        let mut core = RaftCore::new(
            "n1",
            "n1",
            config,
            Storage::in_memory().unwrap(),
            Box::new(KvStateMachine::new()),
        )
        .unwrap();
        core.bootstrap(&[]).unwrap();

        let options = NodeOptions {
            tick_interval: Duration::from_millis(5),
            ..NodeOptions::default()
        };
        RaftNode::spawn(core, Arc::new(net.transport("n1")), inbox, options)
    }

    async fn wait_leader(node: &RaftNode) {
        let mut status = node.watch();
        while !status.borrow().is_leader() {
            status.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_propose_waits_for_apply() {
        let (node, handle) = single_node();
        wait_leader(&node).await;

        let cmd = KvCommand::Set {
            key: "a".into(),
            value: "1".into(),
        };
        let index = node.propose(cmd.encode().unwrap()).await.unwrap();
        assert!(index >= 3);
        assert!(node.stats().last_applied_index >= index);

        let image = node.state_image().await.unwrap();
        let data = KvStateMachine::decode_image(&image).unwrap();
        assert_eq!(data.get("a").map(String::as_str), Some("1"));

        node.shutdown().await;
        handle.await.unwrap();
        assert!(matches!(node.backup().await, Err(Error::ShuttingDown)));
    }
}
