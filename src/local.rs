//! # Local Node State
//!
//! [`LocalNode`] is the single ownership boundary for everything the sync
//! loop and the RPC handlers mutate:
//!
//! - the [`RoutingTable`]
//! - the [`SearchStore`] handle
//! - the first-sync (bootstrapping) flag
//!
//! State lives in a private actor task; the public handle is a cheap clone
//! around an `mpsc` sender. Each command is applied to completion before the
//! next one is read, so a routing decision and the store update that follows
//! it are never interleaved with another caller's.
//!
//! [`LocalNode::do_nodes_lookup`] walks the overlay from the current K
//! closest nodes, asking each one for its own peers until no unvisited node
//! remains.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument, Span};

use crate::dht::{K, NUM_BUCKETS, RoutingTable};
use crate::identity::{Contact, Identity};
use crate::protocols::PeerRpc;
use crate::store::{ContentHash, Metadata, SearchResult, SearchStore, SyncStatus};

/// Capacity of the command queue in front of the actor.
const COMMAND_QUEUE: usize = 256;

/// Answer to an inbound ping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingReply {
    Pong(Identity),
    /// Still in first-sync; the caller should not pull from us yet.
    Bootstrapping,
}

#[derive(Clone)]
pub struct LocalNode {
    cmd_tx: mpsc::Sender<Command>,
}

struct LocalNodeActor {
    routing: RoutingTable,
    store: Box<dyn SearchStore>,
    routing_path: Option<PathBuf>,
    bootstrapping: bool,
    cmd_rx: mpsc::Receiver<Command>,
}

enum Command {
    // Routing
    PushNodes(Vec<Contact>),
    RemoveNode(Identity, oneshot::Sender<bool>),
    EvictNode(Identity, oneshot::Sender<bool>),
    SelfNode(oneshot::Sender<Contact>),
    SetSelfNode(Contact),
    KClosest(oneshot::Sender<Vec<Contact>>),
    IsRoutingFull(oneshot::Sender<bool>),
    RoutingSnapshot(oneshot::Sender<RoutingTable>),

    // Store
    Insert(SearchResult, oneshot::Sender<Result<()>>),
    Search(String, oneshot::Sender<Vec<SearchResult>>),
    Status(oneshot::Sender<SyncStatus>),
    IsStoreEmpty(oneshot::Sender<bool>),
    ResultsSince(u64, usize, oneshot::Sender<Vec<SearchResult>>),
    MetadataSince(u64, usize, oneshot::Sender<Vec<Metadata>>),
    MetadataOf(ContentHash, oneshot::Sender<Option<Metadata>>),
    MergeRecords(Vec<SearchResult>, oneshot::Sender<usize>),
    MergeMetadata(Vec<Metadata>, oneshot::Sender<usize>),

    // Bootstrap flag
    IsBootstrapping(oneshot::Sender<bool>),
    SetBootstrapping(bool),

    // RPC handlers
    HandlePing(Contact, oneshot::Sender<PingReply>),

    // Maintenance
    Persist(oneshot::Sender<()>),
    Quit(oneshot::Sender<()>),
}

impl LocalNode {
    /// Spawn the actor. `routing_path`, when set, is where [`Self::persist`]
    /// and shutdown save the routing table.
    pub fn new(
        routing: RoutingTable,
        store: Box<dyn SearchStore>,
        routing_path: Option<PathBuf>,
        bootstrapping: bool,
        span: Span,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let actor = LocalNodeActor {
            routing,
            store,
            routing_path,
            bootstrapping,
            cmd_rx,
        };
        tokio::spawn(actor.run().instrument(span));
        Self { cmd_tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn push_node(&self, contact: Contact) {
        self.push_nodes(vec![contact]).await;
    }

    pub async fn push_nodes(&self, contacts: Vec<Contact>) {
        if contacts.is_empty() {
            return;
        }
        let _ = self.cmd_tx.send(Command::PushNodes(contacts)).await;
    }

    /// Evict (or mark stale) a peer. Returns whether it was active.
    pub async fn remove_node(&self, identity: Identity) -> bool {
        self.request(|tx| Command::RemoveNode(identity, tx))
            .await
            .unwrap_or(false)
    }

    /// Drop a peer from the routing table outright.
    pub async fn evict_node(&self, identity: Identity) -> bool {
        self.request(|tx| Command::EvictNode(identity, tx))
            .await
            .unwrap_or(false)
    }

    pub async fn self_node(&self) -> Result<Contact> {
        self.request(Command::SelfNode)
            .await
            .ok_or_else(|| anyhow!("local node stopped"))
    }

    pub async fn set_self_node(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::SetSelfNode(contact)).await;
    }

    pub async fn k_closest(&self) -> Vec<Contact> {
        self.request(Command::KClosest).await.unwrap_or_default()
    }

    pub async fn is_routing_full(&self) -> bool {
        self.request(Command::IsRoutingFull).await.unwrap_or(false)
    }

    /// Copy of the routing table as it stands now.
    pub async fn routing_snapshot(&self) -> Result<RoutingTable> {
        self.request(Command::RoutingSnapshot)
            .await
            .ok_or_else(|| anyhow!("local node stopped"))
    }

    pub async fn insert(&self, record: SearchResult) -> Result<()> {
        self.request(|tx| Command::Insert(record, tx))
            .await
            .ok_or_else(|| anyhow!("local node stopped"))?
    }

    pub async fn search(&self, query: &str) -> Vec<SearchResult> {
        let query = query.to_owned();
        self.request(|tx| Command::Search(query, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn status(&self) -> SyncStatus {
        self.request(Command::Status).await.unwrap_or_default()
    }

    pub async fn is_store_empty(&self) -> bool {
        self.request(Command::IsStoreEmpty).await.unwrap_or(true)
    }

    pub async fn results_since(&self, since: u64, max_count: usize) -> Vec<SearchResult> {
        self.request(|tx| Command::ResultsSince(since, max_count, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn metadata_since(&self, since: u64, max_count: usize) -> Vec<Metadata> {
        self.request(|tx| Command::MetadataSince(since, max_count, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn metadata_of(&self, hash: ContentHash) -> Option<Metadata> {
        self.request(|tx| Command::MetadataOf(hash, tx)).await.flatten()
    }

    pub async fn merge_records(&self, records: Vec<SearchResult>) -> usize {
        self.request(|tx| Command::MergeRecords(records, tx))
            .await
            .unwrap_or(0)
    }

    pub async fn merge_metadata(&self, metadata: Vec<Metadata>) -> usize {
        self.request(|tx| Command::MergeMetadata(metadata, tx))
            .await
            .unwrap_or(0)
    }

    pub async fn is_bootstrapping(&self) -> bool {
        self.request(Command::IsBootstrapping).await.unwrap_or(false)
    }

    pub async fn set_bootstrapping(&self, bootstrapping: bool) {
        let _ = self.cmd_tx.send(Command::SetBootstrapping(bootstrapping)).await;
    }

    /// Record the caller and answer its ping. A node that is shutting down
    /// answers as if bootstrapping, so callers keep it in their tables.
    pub async fn handle_ping(&self, from: Contact) -> PingReply {
        self.request(|tx| Command::HandlePing(from, tx))
            .await
            .unwrap_or(PingReply::Bootstrapping)
    }

    /// Flush the store and save the routing table. Failures are logged.
    pub async fn persist(&self) {
        let _ = self.request(Command::Persist).await;
    }

    /// Persist, close the store and stop the actor.
    pub async fn quit(&self) {
        let _ = self.request(Command::Quit).await;
    }

    /// Iterative closure walk over the overlay.
    ///
    /// Starting from the K closest nodes, every node not yet visited is asked
    /// for its peers; returned nodes (except ourselves) are pushed into the
    /// routing table and queued. A node that fails to answer is removed.
    /// Returns how many nodes were queried.
    pub async fn do_nodes_lookup<R: PeerRpc + ?Sized>(&self, rpc: &R) -> Result<usize> {
        let me = self.self_node().await?;
        let mut visited: HashSet<Identity> = HashSet::new();
        visited.insert(me.identity);

        let mut queue: VecDeque<Contact> = self.k_closest().await.into();
        let mut queried = 0usize;

        while let Some(peer) = queue.pop_front() {
            if queried >= NUM_BUCKETS * K {
                debug!(queried, "node lookup reached its query limit");
                break;
            }
            if !visited.insert(peer.identity) {
                continue;
            }
            queried += 1;

            match rpc.get_peers(&peer).await {
                Ok(peers) => {
                    let fresh: Vec<Contact> = peers
                        .into_iter()
                        .filter(|c| c.identity != me.identity)
                        .map(|c| Contact::new(c.identity, c.addr))
                        .collect();
                    for contact in &fresh {
                        if !visited.contains(&contact.identity) {
                            queue.push_back(contact.clone());
                        }
                    }
                    self.push_nodes(fresh).await;
                }
                Err(e) => {
                    debug!(peer = %peer.short_id(), error = %e, "get_peers failed during lookup");
                    self.remove_node(peer.identity).await;
                }
            }
        }

        info!(queried, "node lookup complete");
        Ok(queried)
    }
}

impl LocalNodeActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::PushNodes(contacts) => {
                    for contact in contacts {
                        self.routing.push_node(contact);
                    }
                }
                Command::RemoveNode(identity, reply) => {
                    let _ = reply.send(self.routing.remove_node(&identity));
                }
                Command::EvictNode(identity, reply) => {
                    let _ = reply.send(self.routing.evict_node(&identity));
                }
                Command::SelfNode(reply) => {
                    let _ = reply.send(self.routing.self_node().clone());
                }
                Command::SetSelfNode(contact) => {
                    self.rebind(contact);
                }
                Command::KClosest(reply) => {
                    let _ = reply.send(self.routing.get_k_closest());
                }
                Command::IsRoutingFull(reply) => {
                    let _ = reply.send(self.routing.is_full());
                }
                Command::RoutingSnapshot(reply) => {
                    let _ = reply.send(self.routing.clone());
                }
                Command::Insert(record, reply) => {
                    let _ = reply.send(self.store.insert(record));
                }
                Command::Search(query, reply) => {
                    let _ = reply.send(self.store.search_by_text(&query));
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.store.status());
                }
                Command::IsStoreEmpty(reply) => {
                    let _ = reply.send(self.store.is_empty());
                }
                Command::ResultsSince(since, max, reply) => {
                    let _ = reply.send(self.store.records_since(since, max));
                }
                Command::MetadataSince(since, max, reply) => {
                    let _ = reply.send(self.store.metadata_since(since, max));
                }
                Command::MetadataOf(hash, reply) => {
                    let _ = reply.send(self.store.metadata_by_hash(&hash));
                }
                Command::MergeRecords(records, reply) => {
                    let _ = reply.send(self.store.merge_records(records));
                }
                Command::MergeMetadata(metadata, reply) => {
                    let _ = reply.send(self.store.merge_metadata(metadata));
                }
                Command::IsBootstrapping(reply) => {
                    let _ = reply.send(self.bootstrapping);
                }
                Command::SetBootstrapping(flag) => {
                    if self.bootstrapping != flag {
                        debug!(bootstrapping = flag, "first-sync flag changed");
                    }
                    self.bootstrapping = flag;
                }
                Command::HandlePing(from, reply) => {
                    self.routing.push_node(from);
                    let answer = if self.bootstrapping {
                        PingReply::Bootstrapping
                    } else {
                        PingReply::Pong(self.routing.identity())
                    };
                    let _ = reply.send(answer);
                }
                Command::Persist(reply) => {
                    self.persist();
                    let _ = reply.send(());
                }
                Command::Quit(reply) => {
                    self.persist();
                    if let Err(e) = self.store.close() {
                        warn!(error = %e, "failed to close search store");
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn rebind(&mut self, contact: Contact) {
        let old = self.routing.identity();
        self.routing.set_self_node(contact);
        let new = self.routing.identity();
        if old != new
            && let Some(path) = &self.routing_path
            && let Some(dir) = path.parent()
        {
            let renamed = dir.join(routing_file_name(&new));
            match std::fs::rename(path, &renamed) {
                Ok(()) => debug!(from = %path.display(), to = %renamed.display(), "moved routing table file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to move routing table file"),
            }
            self.routing_path = Some(renamed);
        }
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.flush() {
            warn!(error = %e, "failed to flush search store");
        }
        if let Some(path) = &self.routing_path
            && let Err(e) = self.routing.save(path)
        {
            warn!(path = %path.display(), error = %e, "failed to save routing table");
        }
    }
}

/// File name of the persisted routing table for a node identity.
pub fn routing_file_name(identity: &Identity) -> String {
    format!("routing-{}.bin", identity.to_hex())
}
