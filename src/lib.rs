//! # meshseek - Decentralized Search Overlay
//!
//! meshseek peers self-organize into a structured overlay and exchange
//! search-result records without a central index:
//!
//! - **Routing**: a Kademlia-style table of 160 k-buckets over SHA-1 derived
//!   identities, with replacement caches and staleness-based eviction
//! - **RPC**: function-coded request/response envelopes, bincode encoded and
//!   snappy compressed, one exchange per connection
//! - **Gossip sync**: a timer-driven pull loop over the closest peers, with a
//!   first-sync bootstrap mode
//!
//! ## Architecture
//!
//! Mutable node state sits behind one actor ([`LocalNode`]): the routing
//! table, the search store handle and the first-sync flag. The sync loop and
//! the RPC workers are its only clients, so a routing decision and the store
//! update tied to it always apply together.
//!
//! Logging goes through `tracing`. Components take a [`tracing::Span`] when
//! they are built and run their tasks inside it; filtering is left to the
//! subscriber installed by the binary.
//!
//! ## Trust Model
//!
//! Any address reachable on the chosen transport is treated as a legitimate
//! peer. There is no peer authentication and no Sybil resistance.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `config` | Node configuration and defaults |
//! | `identity` | 160-bit identities, XOR distance, node records |
//! | `dht` | K-buckets, routing table, persisted binary layout |
//! | `local` | Actor owning routing table, store and first-sync flag |
//! | `store` | Search store contract and in-memory implementation |
//! | `sync` | Gossip pull-sync engine |
//! | `protocols` | `PeerRpc` and `ConnectionFactory` seams |
//! | `rpc` | RPC client and worker-pool server |
//! | `transport` | Plain TCP connection factory |
//! | `messages` | Wire envelopes, function codes, framing |

mod config;
mod dht;
mod identity;
mod local;
mod messages;
mod node;
mod protocols;
mod rpc;
mod store;
mod sync;
mod transport;

pub use config::NodeConfig;
pub use dht::{K, KBucket, NUM_BUCKETS, PushOutcome, RoutingCodecError, RoutingTable, STALE_THRESHOLD};
pub use identity::{Contact, ID_BITS, ID_BYTES, Identity, now_ms};
pub use local::{LocalNode, PingReply, routing_file_name};
pub use messages::{
    ErrorCode, FunctionCode, MAX_SYNC_BATCH, RpcCall, RpcRequest, RpcResponse, decode_frame,
    encode_frame,
};
pub use node::Node;
pub use protocols::{ConnectionFactory, PeerRpc, PeerStream};
pub use rpc::{RpcClient, RpcError, RpcServer, is_bootstrapping, serve_connection};
pub use store::{ContentHash, MemoryStore, Metadata, SearchResult, SearchStore, SyncStatus};
pub use sync::{FIRST_SYNC_MARKER, PeerOutcome, SyncEngine, SyncStage};
pub use transport::{TcpConnector, bind_listener};
