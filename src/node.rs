//! # High-Level Node API
//!
//! A [`Node`] wires every component into one running search-overlay peer.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::start(NodeConfig {
//!     listen_addr: "0.0.0.0:7000".into(),
//!     ..NodeConfig::default()
//! })
//! .await?;
//!
//! node.bootstrap("198.51.100.7:7000").await?;
//! node.insert(SearchResult::new("http://example.i2p/", "Example", "...", now_ms())).await?;
//! ```
//!
//! ## Component Integration
//!
//! - **LocalNode**: actor owning the routing table, store and first-sync flag
//! - **RpcServer**: acceptor plus worker pool answering peers
//! - **RpcClient**: outbound calls over a [`TcpConnector`]
//! - **SyncEngine**: timer-driven gossip pull loop
//!
//! The routing table is loaded from `<data_dir>/routing-<id>.bin` at start-up
//! and saved every few sync cycles and on shutdown.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Span};

use crate::config::NodeConfig;
use crate::dht::RoutingTable;
use crate::identity::{Contact, Identity};
use crate::local::{LocalNode, routing_file_name};
use crate::protocols::PeerRpc;
use crate::rpc::{RpcClient, RpcServer, is_bootstrapping};
use crate::store::{MemoryStore, SearchResult, SearchStore, SyncStatus};
use crate::sync::{PeerOutcome, SyncEngine};
use crate::transport::{TcpConnector, bind_listener};

/// File name of the store snapshot inside the data directory.
const STORE_FILE: &str = "store.bin";

pub struct Node {
    local: LocalNode,
    rpc: Arc<RpcClient>,
    server: RpcServer,
    engine: Arc<SyncEngine<RpcClient>>,
    sync_task: JoinHandle<()>,
    span: Span,
}

impl Node {
    /// Start a node backed by a [`MemoryStore`] snapshot in the data directory.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
        let store = MemoryStore::open(config.data_dir.join(STORE_FILE))?;
        Self::start_with_store(config, Box::new(store)).await
    }

    pub async fn start_with_store(config: NodeConfig, store: Box<dyn SearchStore>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

        let listener = bind_listener(&config.listen_addr).await?;
        let bound = listener.local_addr().context("listener has no local address")?;
        let advertise = advertised_address(config.advertise_addr.as_deref(), bound)?;
        let me = Contact::from_addr(advertise);
        let span = info_span!("node", id = %me.short_id());

        let routing_path = config.data_dir.join(routing_file_name(&me.identity));
        let routing = load_routing(&routing_path, &me);
        let local = LocalNode::new(routing, store, Some(routing_path), false, span.clone());

        let connector = TcpConnector::new(config.connect_timeout);
        let rpc = Arc::new(RpcClient::new(Arc::new(connector), config.call_timeout));

        let engine = Arc::new(
            SyncEngine::new(local.clone(), rpc.clone(), &config.data_dir)
                .await
                .with_intervals(config.first_sync_interval, config.sync_interval)
                .with_flush_every(config.flush_every_cycles),
        );

        let server = RpcServer::spawn(
            listener,
            local.clone(),
            config.rpc_workers,
            config.rpc_queue_capacity,
            span.clone(),
        )?;
        let sync_task = engine.clone().spawn(span.clone());

        info!(
            parent: &span,
            addr = %bound,
            advertise = %me.addr,
            identity = %me.identity,
            "node started"
        );

        Ok(Self {
            local,
            rpc,
            server,
            engine,
            sync_task,
            span,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub async fn contact(&self) -> Result<Contact> {
        self.local.self_node().await
    }

    pub async fn identity(&self) -> Result<Identity> {
        Ok(self.contact().await?.identity)
    }

    /// Join the overlay through a seed address.
    ///
    /// The seed is pinged (a bootstrapping seed still counts as reachable),
    /// added to the routing table, and then used to start a node lookup.
    /// Returns the number of nodes the lookup queried.
    pub async fn bootstrap(&self, addr: &str) -> Result<usize> {
        let me = self.local.self_node().await?;
        let seed = match self.rpc.ping(&Contact::from_addr(addr), &me).await {
            Ok(identity) => Contact::new(identity, addr),
            Err(e) if is_bootstrapping(&e) => {
                debug!(parent: &self.span, peer = %addr, "seed is bootstrapping");
                Contact::from_addr(addr)
            }
            Err(e) => return Err(e).with_context(|| format!("bootstrap peer {addr} unreachable")),
        };
        self.local.push_node(seed).await;
        self.local.do_nodes_lookup(self.rpc.as_ref()).await
    }

    /// Move to a new advertised address. The identity is re-derived from it
    /// and every routing-table entry is rehomed.
    pub async fn rebind_address(&self, addr: &str) -> Result<Identity> {
        let contact = Contact::from_addr(addr);
        let identity = contact.identity;
        self.local.set_self_node(contact).await;
        info!(parent: &self.span, advertise = %addr, identity = %identity, "rebound node address");
        Ok(identity)
    }

    pub async fn insert(&self, record: SearchResult) -> Result<()> {
        self.local.insert(record).await
    }

    pub async fn search(&self, query: &str) -> Vec<SearchResult> {
        self.local.search(query).await
    }

    pub async fn status(&self) -> SyncStatus {
        self.local.status().await
    }

    pub async fn is_bootstrapping(&self) -> bool {
        self.local.is_bootstrapping().await
    }

    pub async fn peers(&self) -> Vec<Contact> {
        self.local.k_closest().await
    }

    /// Run one sync cycle now, outside the timer.
    pub async fn sync_now(&self) -> Vec<(Contact, PeerOutcome)> {
        self.engine.sync_cycle().await
    }

    /// Stop the sync loop and the RPC tasks, then persist and close.
    pub async fn shutdown(&self) {
        self.sync_task.abort();
        self.server.shutdown();
        self.local.quit().await;
        info!(parent: &self.span, "node stopped");
    }
}

/// The address peers reach us on. A wildcard bind has no address peers could
/// use, so it needs an explicit advertise address.
fn advertised_address(advertise: Option<&str>, bound: SocketAddr) -> Result<String> {
    match advertise {
        Some(addr) => Ok(addr.to_string()),
        None if bound.ip().is_unspecified() => {
            bail!("listening on {bound} needs an advertise address reachable by peers")
        }
        None => Ok(bound.to_string()),
    }
}

fn load_routing(path: &Path, me: &Contact) -> RoutingTable {
    if !path.exists() {
        return RoutingTable::new(me.clone());
    }
    match RoutingTable::load(path) {
        Ok(mut table) => {
            table.set_self_node(me.clone());
            debug!(path = %path.display(), contacts = table.len(), "loaded routing table");
            table
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable routing table");
            RoutingTable::new(me.clone())
        }
    }
}
