//! # Gossip Pull Synchronization
//!
//! Epidemic (susceptible-infected) pull sync: on every cycle the node walks
//! its K closest peers one at a time and pulls whatever records and metadata
//! are newer than its own watermarks.
//!
//! ## Per-peer stages
//!
//! ```text
//! Ping ─► RefreshRouting ─► Status ─► FirstSyncCheck ─► SyncResults ─► SyncMetadata
//!   │           │              │                             │              │
//!   └───────────┴──────────────┴──────── failure ────────────┴──────────────┴─► evict
//! ```
//!
//! - A ping answered with the bootstrapping sentinel skips the peer without
//!   evicting it.
//! - `RefreshRouting` only runs while the routing table has no full bucket.
//! - A peer whose watermarks are not ahead of ours receives no pull calls.
//!
//! ## First-sync mode
//!
//! A node with an empty store creates a zero-length marker file in its data
//! directory. While the marker exists at start-up the node is in first-sync:
//! it refuses to serve pulls (the sentinel), cycles on the fast interval, and
//! leaves the mode when a peer has nothing newer to give it. The marker is
//! deleted once a peer's watermarks are both caught up.
//!
//! Cycles never abort early; a failing peer is evicted and the walk moves on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::identity::Contact;
use crate::local::LocalNode;
use crate::messages::MAX_SYNC_BATCH;
use crate::protocols::PeerRpc;
use crate::rpc::is_bootstrapping;

/// Delay between cycles while in first-sync.
pub const FAST_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between cycles once caught up.
pub const SLOW_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Store and routing table are persisted every this many cycles.
pub const FLUSH_EVERY_CYCLES: u64 = 5;

/// Name of the first-sync marker file inside the data directory.
pub const FIRST_SYNC_MARKER: &str = "first-sync";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStage {
    Ping,
    RefreshRouting,
    Status,
    FirstSyncCheck,
    SyncResults,
    SyncMetadata,
}

/// What happened to one peer during a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerOutcome {
    /// All stages ran; counts are entries that changed the local store.
    Synced { results: usize, metadata: usize },
    /// The peer is still bootstrapping.
    Skipped,
    /// The peer failed at this stage and was dropped from the routing table.
    Evicted(SyncStage),
}

pub struct SyncEngine<R: PeerRpc> {
    local: LocalNode,
    rpc: Arc<R>,
    marker: PathBuf,
    fast_interval: Duration,
    slow_interval: Duration,
    flush_every: u64,
}

impl<R: PeerRpc> SyncEngine<R> {
    /// Create the engine, placing the first-sync marker when the store is
    /// empty and entering first-sync when the marker exists.
    pub async fn new(local: LocalNode, rpc: Arc<R>, data_dir: &Path) -> Self {
        let marker = data_dir.join(FIRST_SYNC_MARKER);
        if local.is_store_empty().await && !marker.exists() {
            if let Err(e) = std::fs::create_dir_all(data_dir)
                .and_then(|_| std::fs::File::create(&marker).map(|_| ()))
            {
                warn!(path = %marker.display(), error = %e, "failed to create first-sync marker");
            } else {
                debug!(path = %marker.display(), "created first-sync marker");
            }
        }

        let first_sync = marker.exists();
        local.set_bootstrapping(first_sync).await;
        if first_sync {
            info!("starting in first-sync mode");
        }

        Self {
            local,
            rpc,
            marker,
            fast_interval: FAST_SYNC_INTERVAL,
            slow_interval: SLOW_SYNC_INTERVAL,
            flush_every: FLUSH_EVERY_CYCLES,
        }
    }

    pub fn with_intervals(mut self, fast: Duration, slow: Duration) -> Self {
        self.fast_interval = fast;
        self.slow_interval = slow;
        self
    }

    pub fn with_flush_every(mut self, cycles: u64) -> Self {
        self.flush_every = cycles.max(1);
        self
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Run the driving loop on its own task.
    pub fn spawn(self: Arc<Self>, span: Span) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await }.instrument(span))
    }

    async fn run(&self) {
        let mut cycle: u64 = 0;
        loop {
            let delay = if self.local.is_bootstrapping().await {
                self.fast_interval
            } else {
                self.slow_interval
            };
            tokio::time::sleep(delay).await;

            let outcomes = self.sync_cycle().await;
            cycle += 1;
            debug!(
                cycle,
                peers = outcomes.len(),
                evicted = outcomes
                    .iter()
                    .filter(|(_, o)| matches!(o, PeerOutcome::Evicted(_)))
                    .count(),
                "sync cycle finished"
            );

            if cycle % self.flush_every == 0 {
                trace!(cycle, "persisting store and routing table");
                self.local.persist().await;
            }
        }
    }

    /// One pass over the current K-closest snapshot, one peer at a time.
    pub async fn sync_cycle(&self) -> Vec<(Contact, PeerOutcome)> {
        let me = match self.local.self_node().await {
            Ok(me) => me,
            Err(e) => {
                warn!(error = %e, "sync cycle skipped");
                return Vec::new();
            }
        };
        let peers = self.local.k_closest().await;
        let mut first_sync = self.local.is_bootstrapping().await;

        let mut outcomes = Vec::with_capacity(peers.len());
        for peer in peers {
            if peer.identity == me.identity {
                continue;
            }
            let outcome = self.sync_peer(&me, &peer, &mut first_sync).await;
            trace!(peer = %peer.short_id(), ?outcome, "peer synced");
            outcomes.push((peer, outcome));
        }
        outcomes
    }

    async fn evict(&self, peer: &Contact, stage: SyncStage, error: &anyhow::Error) -> PeerOutcome {
        debug!(peer = %peer.short_id(), addr = %peer.addr, ?stage, error = %error, "sync failed, evicting peer");
        self.local.evict_node(peer.identity).await;
        PeerOutcome::Evicted(stage)
    }

    async fn set_first_sync(&self, first_sync: &mut bool, value: bool) {
        if *first_sync != value {
            *first_sync = value;
            self.local.set_bootstrapping(value).await;
        }
    }

    async fn sync_peer(&self, me: &Contact, peer: &Contact, first_sync: &mut bool) -> PeerOutcome {
        let ping = self.rpc.ping(peer, me).await;
        if *first_sync {
            self.set_first_sync(first_sync, ping.is_ok()).await;
        }
        match ping {
            Ok(_) => {}
            Err(e) if is_bootstrapping(&e) => {
                debug!(peer = %peer.short_id(), "peer is bootstrapping, skipping");
                return PeerOutcome::Skipped;
            }
            Err(e) => return self.evict(peer, SyncStage::Ping, &e).await,
        }

        if !self.local.is_routing_full().await {
            match self.rpc.get_peers(peer).await {
                Ok(contacts) => {
                    let contacts: Vec<Contact> = contacts
                        .into_iter()
                        .filter(|c| c.identity != me.identity)
                        .map(|c| Contact::new(c.identity, c.addr))
                        .collect();
                    self.local.push_nodes(contacts).await;
                }
                Err(e) => return self.evict(peer, SyncStage::RefreshRouting, &e).await,
            }
        }

        let remote = match self.rpc.get_status(peer).await {
            Ok(status) => status,
            Err(e) => return self.evict(peer, SyncStage::Status, &e).await,
        };
        let local = self.local.status().await;

        if *first_sync
            && local.results_timestamp >= remote.results_timestamp
            && local.metadata_timestamp >= remote.metadata_timestamp
        {
            self.complete_first_sync();
        }

        let mut pulled = 0;
        let mut merged_results = 0;
        if local.results_timestamp < remote.results_timestamp {
            match self
                .rpc
                .get_results_since(peer, local.results_timestamp, MAX_SYNC_BATCH)
                .await
            {
                Ok(records) => {
                    pulled = records.len();
                    merged_results = self.local.merge_records(records).await;
                }
                Err(e) => return self.evict(peer, SyncStage::SyncResults, &e).await,
            }
        }
        if pulled == 0 && *first_sync {
            self.set_first_sync(first_sync, false).await;
        }

        let mut merged_metadata = 0;
        if local.metadata_timestamp < remote.metadata_timestamp {
            match self
                .rpc
                .get_metadata_since(peer, local.metadata_timestamp, MAX_SYNC_BATCH)
                .await
            {
                Ok(metadata) => merged_metadata = self.local.merge_metadata(metadata).await,
                Err(e) => return self.evict(peer, SyncStage::SyncMetadata, &e).await,
            }
        }

        if merged_results > 0 || merged_metadata > 0 {
            info!(
                peer = %peer.short_id(),
                results = merged_results,
                metadata = merged_metadata,
                "pulled updates"
            );
        }
        PeerOutcome::Synced {
            results: merged_results,
            metadata: merged_metadata,
        }
    }

    fn complete_first_sync(&self) {
        match std::fs::remove_file(&self.marker) {
            Ok(()) => info!("first sync complete"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.marker.display(), error = %e, "failed to remove first-sync marker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::dht::RoutingTable;
    use crate::identity::Identity;
    use crate::messages::ErrorCode;
    use crate::rpc::RpcError;
    use crate::store::{ContentHash, MemoryStore, Metadata, SearchResult, SearchStore, SyncStatus};

    #[derive(Clone, Copy)]
    enum PingBehaviour {
        Answer,
        Fail,
        Bootstrapping,
    }

    #[derive(Clone)]
    struct StubPeer {
        ping: PingBehaviour,
        status: SyncStatus,
        results: Vec<SearchResult>,
        metadata: Vec<Metadata>,
        peers: Vec<Contact>,
    }

    impl StubPeer {
        fn answering(status: SyncStatus) -> Self {
            Self {
                ping: PingBehaviour::Answer,
                status,
                results: Vec::new(),
                metadata: Vec::new(),
                peers: Vec::new(),
            }
        }
    }

    #[derive(Default)]
    struct StubNetwork {
        peers: HashMap<String, StubPeer>,
        calls: Mutex<Vec<(String, &'static str)>>,
    }

    impl StubNetwork {
        fn with(peers: Vec<(&Contact, StubPeer)>) -> Self {
            Self {
                peers: peers.into_iter().map(|(c, p)| (c.addr.clone(), p)).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        async fn peer(&self, to: &Contact, call: &'static str) -> Result<StubPeer> {
            self.calls.lock().await.push((to.addr.clone(), call));
            self.peers
                .get(&to.addr)
                .cloned()
                .ok_or_else(|| anyhow!("connection refused"))
        }

        async fn calls_to(&self, addr: &str) -> Vec<&'static str> {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|(a, _)| a == addr)
                .map(|(_, c)| *c)
                .collect()
        }
    }

    #[async_trait]
    impl PeerRpc for StubNetwork {
        async fn ping(&self, to: &Contact, _from: &Contact) -> Result<Identity> {
            let peer = self.peer(to, "ping").await?;
            match peer.ping {
                PingBehaviour::Answer => Ok(to.identity),
                PingBehaviour::Fail => Err(anyhow!("connection reset")),
                PingBehaviour::Bootstrapping => Err(RpcError::Remote(ErrorCode::Bootstrapping).into()),
            }
        }

        async fn get_status(&self, to: &Contact) -> Result<SyncStatus> {
            Ok(self.peer(to, "status").await?.status)
        }

        async fn get_peers(&self, to: &Contact) -> Result<Vec<Contact>> {
            Ok(self.peer(to, "peers").await?.peers)
        }

        async fn get_results_since(&self, to: &Contact, since: u64, max: usize) -> Result<Vec<SearchResult>> {
            let peer = self.peer(to, "results").await?;
            Ok(peer.results.into_iter().filter(|r| r.timestamp > since).take(max).collect())
        }

        async fn get_metadata_since(&self, to: &Contact, since: u64, max: usize) -> Result<Vec<Metadata>> {
            let peer = self.peer(to, "metadata").await?;
            Ok(peer.metadata.into_iter().filter(|m| m.timestamp > since).take(max).collect())
        }

        async fn get_metadata_of(&self, to: &Contact, hash: ContentHash) -> Result<Option<Metadata>> {
            let peer = self.peer(to, "metadata_of").await?;
            Ok(peer.metadata.into_iter().find(|m| m.hash == hash))
        }
    }

    fn record(n: u64) -> SearchResult {
        SearchResult::new(format!("http://page{n}.i2p/"), format!("page {n}"), "body", n)
    }

    fn status(results: u64, metadata: u64) -> SyncStatus {
        SyncStatus {
            results_timestamp: results,
            metadata_timestamp: metadata,
        }
    }

    fn local_node(records: &[u64], peers: &[&Contact]) -> LocalNode {
        let mut store = MemoryStore::new();
        for n in records {
            store.insert(record(*n)).expect("insert");
        }
        let mut table = RoutingTable::new(Contact::from_addr("127.0.0.1:7000"));
        for peer in peers {
            table.push_node((*peer).clone());
        }
        LocalNode::new(table, Box::new(store), None, false, Span::none())
    }

    async fn start_engine(local: &LocalNode, net: StubNetwork, dir: &Path) -> (SyncEngine<StubNetwork>, Arc<StubNetwork>) {
        let net = Arc::new(net);
        let engine = SyncEngine::new(local.clone(), net.clone(), dir).await;
        (engine, net)
    }

    #[tokio::test]
    async fn failed_ping_evicts_peer_from_next_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dead = Contact::from_addr("10.0.0.1:7000");
        let alive = Contact::from_addr("10.0.0.2:7000");
        let local = local_node(&[10], &[&dead, &alive]);
        let mut dead_peer = StubPeer::answering(status(10, 0));
        dead_peer.ping = PingBehaviour::Fail;
        let net = StubNetwork::with(vec![(&dead, dead_peer), (&alive, StubPeer::answering(status(10, 0)))]);
        let (engine, net) = start_engine(&local, net, dir.path()).await;

        let outcomes = engine.sync_cycle().await;
        let dead_outcome = outcomes.iter().find(|(c, _)| c == &dead).map(|(_, o)| *o);
        assert_eq!(dead_outcome, Some(PeerOutcome::Evicted(SyncStage::Ping)));

        let snapshot = local.k_closest().await;
        assert!(!snapshot.contains(&dead));
        assert!(snapshot.contains(&alive));

        let second = engine.sync_cycle().await;
        assert!(second.iter().all(|(c, _)| c != &dead));
        assert_eq!(net.calls_to(&dead.addr).await, vec!["ping"]);
    }

    #[tokio::test]
    async fn stale_peer_gets_no_pull_calls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let behind = Contact::from_addr("10.0.0.3:7000");
        let local = local_node(&[500], &[&behind]);
        local
            .merge_metadata(vec![Metadata { hash: record(500).hash, score: 1.0, votes: 1, timestamp: 500 }])
            .await;
        let mut peer = StubPeer::answering(status(100, 100));
        peer.results = vec![record(50), record(100)];
        let net = StubNetwork::with(vec![(&behind, peer)]);
        let (engine, net) = start_engine(&local, net, dir.path()).await;

        let outcomes = engine.sync_cycle().await;
        assert_eq!(outcomes, vec![(behind.clone(), PeerOutcome::Synced { results: 0, metadata: 0 })]);
        let calls = net.calls_to(&behind.addr).await;
        assert!(!calls.contains(&"results"));
        assert!(!calls.contains(&"metadata"));
    }

    #[tokio::test]
    async fn newer_peer_data_is_pulled_and_merged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ahead = Contact::from_addr("10.0.0.4:7000");
        let local = local_node(&[10], &[&ahead]);
        let mut peer = StubPeer::answering(status(30, 40));
        peer.results = vec![record(5), record(20), record(30)];
        peer.metadata = vec![Metadata { hash: record(20).hash, score: 0.5, votes: 2, timestamp: 40 }];
        let net = StubNetwork::with(vec![(&ahead, peer)]);
        let (engine, _net) = start_engine(&local, net, dir.path()).await;

        let outcomes = engine.sync_cycle().await;
        assert_eq!(outcomes[0].1, PeerOutcome::Synced { results: 2, metadata: 1 });
        assert_eq!(local.status().await, status(30, 40));
        assert!(local.metadata_of(record(20).hash).await.is_some());
    }

    #[tokio::test]
    async fn routing_refresh_adds_peer_neighbours_but_not_self() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seed = Contact::from_addr("10.0.0.5:7000");
        let local = local_node(&[1], &[&seed]);
        let me = local.self_node().await.expect("self");
        let neighbour = Contact::from_addr("10.0.9.1:7000");
        let mut peer = StubPeer::answering(status(1, 0));
        peer.peers = vec![me.clone(), neighbour.clone()];
        let net = StubNetwork::with(vec![(&seed, peer)]);
        let (engine, _net) = start_engine(&local, net, dir.path()).await;

        engine.sync_cycle().await;
        let table = local.routing_snapshot().await.expect("snapshot");
        assert!(table.contains(&neighbour.identity));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn routing_refresh_does_not_import_remote_staleness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seed = Contact::from_addr("10.0.0.11:7000");
        let local = local_node(&[1], &[&seed]);
        let mut neighbour = Contact::from_addr("10.0.9.2:7000");
        neighbour.stale_count = u8::MAX;
        neighbour.last_seen = 1;
        let mut peer = StubPeer::answering(status(1, 0));
        peer.peers = vec![neighbour.clone()];
        let net = StubNetwork::with(vec![(&seed, peer)]);
        let (engine, _net) = start_engine(&local, net, dir.path()).await;

        engine.sync_cycle().await;
        let table = local.routing_snapshot().await.expect("snapshot");
        let stored = table
            .buckets()
            .iter()
            .flat_map(|b| b.nodes())
            .find(|c| c.identity == neighbour.identity)
            .expect("learned");
        assert_eq!(stored.stale_count, 0);
        assert!(stored.last_seen > 1);
    }

    #[tokio::test]
    async fn bootstrapping_peer_is_skipped_not_evicted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fresh = Contact::from_addr("10.0.0.6:7000");
        let local = local_node(&[1], &[&fresh]);
        let mut peer = StubPeer::answering(status(99, 99));
        peer.ping = PingBehaviour::Bootstrapping;
        let net = StubNetwork::with(vec![(&fresh, peer)]);
        let (engine, net) = start_engine(&local, net, dir.path()).await;

        let outcomes = engine.sync_cycle().await;
        assert_eq!(outcomes, vec![(fresh.clone(), PeerOutcome::Skipped)]);
        assert!(local.k_closest().await.contains(&fresh));
        assert_eq!(net.calls_to(&fresh.addr).await, vec!["ping"]);
    }

    #[tokio::test]
    async fn empty_store_enters_first_sync_and_leaves_when_caught_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let peer_contact = Contact::from_addr("10.0.0.7:7000");
        let local = local_node(&[], &[&peer_contact]);
        let net = StubNetwork::with(vec![(&peer_contact, StubPeer::answering(status(0, 0)))]);
        let (engine, _net) = start_engine(&local, net, dir.path()).await;

        assert!(engine.marker_path().exists());
        assert!(local.is_bootstrapping().await);

        engine.sync_cycle().await;
        assert!(!engine.marker_path().exists());
        assert!(!local.is_bootstrapping().await);
    }

    #[tokio::test]
    async fn first_sync_ends_when_first_contact_is_unreachable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dead = Contact::from_addr("10.0.0.8:7000");
        let local = local_node(&[], &[&dead]);
        let (engine, _net) = start_engine(&local, StubNetwork::default(), dir.path()).await;
        assert!(local.is_bootstrapping().await);

        let outcomes = engine.sync_cycle().await;
        assert_eq!(outcomes[0].1, PeerOutcome::Evicted(SyncStage::Ping));
        assert!(!local.is_bootstrapping().await);
        assert!(engine.marker_path().exists());
    }

    #[tokio::test]
    async fn first_sync_stays_while_records_arrive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = Contact::from_addr("10.0.0.9:7000");
        let local = local_node(&[], &[&source]);
        let mut peer = StubPeer::answering(status(3, 0));
        peer.results = vec![record(1), record(2), record(3)];
        let net = StubNetwork::with(vec![(&source, peer)]);
        let (engine, _net) = start_engine(&local, net, dir.path()).await;

        engine.sync_cycle().await;
        assert!(local.is_bootstrapping().await);
        assert!(engine.marker_path().exists());

        engine.sync_cycle().await;
        assert!(!local.is_bootstrapping().await);
        assert!(!engine.marker_path().exists());
    }

    /// Memory store that counts flushes.
    struct CountingStore {
        inner: MemoryStore,
        flushes: Arc<AtomicUsize>,
    }

    impl SearchStore for CountingStore {
        fn insert(&mut self, record: SearchResult) -> Result<()> {
            self.inner.insert(record)
        }
        fn search_by_text(&self, query: &str) -> Vec<SearchResult> {
            self.inner.search_by_text(query)
        }
        fn records_since(&self, since: u64, max_count: usize) -> Vec<SearchResult> {
            self.inner.records_since(since, max_count)
        }
        fn metadata_since(&self, since: u64, max_count: usize) -> Vec<Metadata> {
            self.inner.metadata_since(since, max_count)
        }
        fn metadata_by_hash(&self, hash: &ContentHash) -> Option<Metadata> {
            self.inner.metadata_by_hash(hash)
        }
        fn merge_records(&mut self, records: Vec<SearchResult>) -> usize {
            self.inner.merge_records(records)
        }
        fn merge_metadata(&mut self, metadata: Vec<Metadata>) -> usize {
            self.inner.merge_metadata(metadata)
        }
        fn flush(&mut self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            self.inner.flush()
        }
        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
        fn last_results_timestamp(&self) -> u64 {
            self.inner.last_results_timestamp()
        }
        fn last_metadata_timestamp(&self) -> u64 {
            self.inner.last_metadata_timestamp()
        }
        fn is_empty(&self) -> bool {
            self.inner.is_empty()
        }
    }

    async fn advance_to(start: tokio::time::Instant, secs: u64) {
        tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn driving_loop_picks_interval_from_flag_and_persists_every_fifth_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let peer = Contact::from_addr("10.0.0.10:7000");
        let me = Contact::from_addr("127.0.0.1:7000");
        let routing_path = dir.path().join(crate::local::routing_file_name(&me.identity));
        let mut table = RoutingTable::new(me);
        table.push_node(peer.clone());

        let flushes = Arc::new(AtomicUsize::new(0));
        let store = CountingStore { inner: MemoryStore::new(), flushes: flushes.clone() };
        let local = LocalNode::new(table, Box::new(store), Some(routing_path.clone()), false, Span::none());
        let net = StubNetwork::with(vec![(&peer, StubPeer::answering(status(0, 0)))]);
        let (engine, net) = start_engine(&local, net, dir.path()).await;
        assert!(local.is_bootstrapping().await);

        let start = tokio::time::Instant::now();
        let engine = Arc::new(engine.with_intervals(Duration::from_secs(5), Duration::from_secs(60)));
        let task = engine.spawn(Span::none());

        advance_to(start, 4).await;
        assert!(net.calls_to(&peer.addr).await.is_empty());

        // first cycle on the fast interval, which also ends first-sync
        advance_to(start, 6).await;
        assert_eq!(net.calls_to(&peer.addr).await.iter().filter(|c| **c == "ping").count(), 1);
        assert!(!local.is_bootstrapping().await);

        // the next delay is the slow one
        advance_to(start, 64).await;
        assert_eq!(net.calls_to(&peer.addr).await.iter().filter(|c| **c == "ping").count(), 1);
        advance_to(start, 66).await;
        assert_eq!(net.calls_to(&peer.addr).await.iter().filter(|c| **c == "ping").count(), 2);

        // cycles at 5, 65, 125, 185, 245, ..., 545
        advance_to(start, 244).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 0);
        assert!(!routing_path.exists());
        advance_to(start, 246).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        assert!(routing_path.exists());
        advance_to(start, 544).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
        advance_to(start, 546).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 2);

        task.abort();
    }

    #[tokio::test]
    async fn existing_marker_survives_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(FIRST_SYNC_MARKER), b"").expect("marker");
        let local = local_node(&[1, 2, 3], &[]);
        let (_engine, _net) = start_engine(&local, StubNetwork::default(), dir.path()).await;
        assert!(local.is_bootstrapping().await);

        let other = tempfile::tempdir().expect("tempdir");
        let populated = local_node(&[1], &[]);
        let (engine, _net) = start_engine(&populated, StubNetwork::default(), other.path()).await;
        assert!(!engine.marker_path().exists());
        assert!(!populated.is_bootstrapping().await);
    }
}
