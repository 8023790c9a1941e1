//! Protocol trait definitions for the overlay's networking layer.
//!
//! The sync engine and the node-lookup walk never talk to sockets directly.
//! They go through two seams defined here:
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`PeerRpc`] | [`RpcClient`](crate::rpc::RpcClient), test stubs | Remote calls against one peer |
//! | [`ConnectionFactory`] | [`TcpConnector`](crate::transport::TcpConnector) | Open a byte stream to an address |
//!
//! Keeping the traits apart from their implementations lets the sync engine
//! be tested against in-memory stubs, and lets an anonymizing proxy slot in
//! behind [`ConnectionFactory`] without the RPC layer noticing.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::identity::{Contact, Identity};
use crate::store::{ContentHash, Metadata, SearchResult, SyncStatus};

/// Remote operations a node can invoke on a peer.
///
/// Errors are returned as `anyhow::Error`; transports that can report the
/// bootstrapping sentinel wrap an [`RpcError`](crate::rpc::RpcError) so that
/// callers can `downcast_ref` it.
#[async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    /// Announce `from` to the peer and learn its identity.
    async fn ping(&self, to: &Contact, from: &Contact) -> Result<Identity>;

    /// Fetch the peer's results and metadata watermarks.
    async fn get_status(&self, to: &Contact) -> Result<SyncStatus>;

    /// Fetch the peer's own K closest nodes.
    async fn get_peers(&self, to: &Contact) -> Result<Vec<Contact>>;

    async fn get_results_since(
        &self,
        to: &Contact,
        since: u64,
        max_count: usize,
    ) -> Result<Vec<SearchResult>>;

    async fn get_metadata_since(
        &self,
        to: &Contact,
        since: u64,
        max_count: usize,
    ) -> Result<Vec<Metadata>>;

    async fn get_metadata_of(&self, to: &Contact, hash: ContentHash) -> Result<Option<Metadata>>;
}

/// A bidirectional byte stream returned by a [`ConnectionFactory`].
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Opens connections to peer addresses.
///
/// Implementations may pick a route from the address shape (for example a
/// proxy for hidden-service hostnames); callers only see a stream.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn open(&self, addr: &str) -> Result<Box<dyn PeerStream>>;
}
