//! # RPC Layer
//!
//! One connection carries exactly one request and one response:
//!
//! ```text
//! client                         server
//!   │── open (ConnectionFactory) ──►│  acceptor enqueues the stream
//!   │── frame(RpcRequest), EOF ────►│  a worker pops it, decodes, dispatches
//!   │◄──── frame(RpcResponse), EOF ─│
//! ```
//!
//! ## Server
//!
//! [`RpcServer`] runs one acceptor task that only accepts and enqueues, plus
//! a fixed pool of workers that share the queue. Workers answer from the
//! [`LocalNode`]; the sync engine is never involved on the serving path.
//!
//! Unknown function codes produce [`ErrorCode::NoSuchFunction`], arguments of
//! the wrong shape produce [`ErrorCode::ArgumentMismatch`], and an envelope
//! that cannot be decoded at all produces [`ErrorCode::UnmarshalFailure`]
//! with correlation id 0.
//!
//! ## Client
//!
//! [`RpcClient`] implements [`PeerRpc`] on top of an injected
//! [`ConnectionFactory`]. Every call gets a fresh random correlation id and
//! a response that echoes a different id is rejected. Nothing is retried here;
//! retry and eviction policy belongs to the caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::identity::{Contact, Identity};
use crate::local::{LocalNode, PingReply};
use crate::messages::{
    self, ErrorCode, FrameError, FunctionCode, MAX_MESSAGE_SIZE, MAX_SYNC_BATCH, MetadataOfArgs,
    PingArgs, RpcCall, RpcRequest, RpcResponse, SinceArgs, decode_frame, encode_frame,
};
use crate::protocols::{ConnectionFactory, PeerRpc};
use crate::store::{ContentHash, Metadata, SearchResult, SyncStatus};

// ============================================================================
// Limits
// ============================================================================

/// Largest compressed frame accepted from the wire (snappy worst case for a
/// [`MAX_MESSAGE_SIZE`] payload).
const MAX_FRAME_SIZE: usize = 32 + MAX_MESSAGE_SIZE + MAX_MESSAGE_SIZE / 6;

/// Time a worker waits for a client to finish sending its request.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a whole client call (connect, send, receive).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of server workers.
pub const DEFAULT_WORKERS: usize = 1;

/// Default capacity of the accepted-connection queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("correlation id mismatch: sent {sent}, received {received}")]
    CorrelationMismatch { sent: u64, received: u64 },
    #[error("remote error: {0}")]
    Remote(ErrorCode),
    #[error("unknown remote error code {0}")]
    UnknownErrorCode(u8),
    #[error("reply value does not decode: {0}")]
    UnexpectedReply(#[source] bincode::Error),
}

impl RpcError {
    /// The peer answered but is itself still in first-sync.
    pub fn is_bootstrapping(&self) -> bool {
        matches!(self, RpcError::Remote(ErrorCode::Bootstrapping))
    }
}

/// True when `err` carries the bootstrapping sentinel.
pub fn is_bootstrapping(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RpcError>()
        .is_some_and(RpcError::is_bootstrapping)
}

// ============================================================================
// Framing over a stream
// ============================================================================

/// Read one frame: everything up to end-of-stream.
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, RpcError> {
    let mut buf = Vec::new();
    let limit = (MAX_FRAME_SIZE + 1) as u64;
    (&mut *stream).take(limit).read_to_end(&mut buf).await?;
    if buf.len() > MAX_FRAME_SIZE {
        return Err(RpcError::TooLarge(buf.len()));
    }
    Ok(buf)
}

/// Write one frame and close our write half to mark its end.
async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &[u8]) -> Result<(), RpcError> {
    stream.write_all(frame).await?;
    stream.shutdown().await?;
    Ok(())
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct RpcClient {
    factory: Arc<dyn ConnectionFactory>,
    call_timeout: Duration,
}

impl RpcClient {
    pub fn new(factory: Arc<dyn ConnectionFactory>, call_timeout: Duration) -> Self {
        Self {
            factory,
            call_timeout,
        }
    }

    /// Perform one remote call and return the raw reply value.
    pub async fn call_remote_function(&self, to: &Contact, call: RpcCall) -> Result<Vec<u8>, RpcError> {
        let correlation_id: u64 = rand::random();
        let function = call.function();
        let request = call
            .into_request(correlation_id)
            .map_err(|e| RpcError::Malformed(FrameError::Codec(e)))?;
        let frame = encode_frame(&request)?;

        let exchange = async {
            let mut stream = self
                .factory
                .open(&to.addr)
                .await
                .map_err(|e| RpcError::Unreachable(format!("{e:#}")))?;
            write_frame(&mut stream, &frame).await?;
            read_frame(&mut stream).await
        };
        let reply = tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout(self.call_timeout))??;

        let response: RpcResponse = decode_frame(&reply)?;
        if response.correlation_id != correlation_id {
            warn!(
                peer = %to.addr,
                ?function,
                sent = correlation_id,
                received = response.correlation_id,
                "rejecting response with mismatched correlation id"
            );
            return Err(RpcError::CorrelationMismatch {
                sent: correlation_id,
                received: response.correlation_id,
            });
        }

        match ErrorCode::try_from(response.error) {
            Ok(ErrorCode::None) => {
                trace!(peer = %to.addr, ?function, bytes = response.value.len(), "rpc ok");
                Ok(response.value)
            }
            Ok(code) => {
                debug!(peer = %to.addr, ?function, error = %code, "remote returned error");
                Err(RpcError::Remote(code))
            }
            Err(code) => Err(RpcError::UnknownErrorCode(code)),
        }
    }

    async fn call<T: DeserializeOwned>(&self, to: &Contact, call: RpcCall) -> Result<T, RpcError> {
        let value = self.call_remote_function(to, call).await?;
        messages::deserialize_bounded(&value).map_err(RpcError::UnexpectedReply)
    }
}

fn batch_limit(max_count: usize) -> u32 {
    max_count.min(MAX_SYNC_BATCH) as u32
}

#[async_trait]
impl PeerRpc for RpcClient {
    async fn ping(&self, to: &Contact, from: &Contact) -> Result<Identity> {
        let call = RpcCall::Ping(PingArgs { from: from.clone() });
        Ok(self.call(to, call).await?)
    }

    async fn get_status(&self, to: &Contact) -> Result<SyncStatus> {
        Ok(self.call(to, RpcCall::GetStatus).await?)
    }

    async fn get_peers(&self, to: &Contact) -> Result<Vec<Contact>> {
        Ok(self.call(to, RpcCall::GetPeers).await?)
    }

    async fn get_results_since(
        &self,
        to: &Contact,
        since: u64,
        max_count: usize,
    ) -> Result<Vec<SearchResult>> {
        let max_count = batch_limit(max_count);
        let mut records: Vec<SearchResult> = self
            .call(to, RpcCall::GetResultsSince(SinceArgs { since, max_count }))
            .await?;
        if records.len() > max_count as usize {
            warn!(
                peer = %to.addr,
                count = records.len(),
                max = max_count,
                "peer returned too many results, truncating"
            );
            records.truncate(max_count as usize);
        }
        Ok(records)
    }

    async fn get_metadata_since(
        &self,
        to: &Contact,
        since: u64,
        max_count: usize,
    ) -> Result<Vec<Metadata>> {
        let max_count = batch_limit(max_count);
        let mut metadata: Vec<Metadata> = self
            .call(to, RpcCall::GetMetadataSince(SinceArgs { since, max_count }))
            .await?;
        if metadata.len() > max_count as usize {
            warn!(
                peer = %to.addr,
                count = metadata.len(),
                max = max_count,
                "peer returned too much metadata, truncating"
            );
            metadata.truncate(max_count as usize);
        }
        Ok(metadata)
    }

    async fn get_metadata_of(&self, to: &Contact, hash: ContentHash) -> Result<Option<Metadata>> {
        Ok(self
            .call(to, RpcCall::GetMetadataOf(MetadataOfArgs { hash }))
            .await?)
    }
}

// ============================================================================
// Server
// ============================================================================

pub struct RpcServer {
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcServer {
    /// Start the acceptor and `workers` worker tasks on an already-bound listener.
    pub fn spawn(
        listener: TcpListener,
        local: LocalNode,
        workers: usize,
        queue_capacity: usize,
        span: Span,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let (queue_tx, queue_rx) = mpsc::channel::<(TcpStream, SocketAddr)>(queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut tasks = Vec::with_capacity(workers.max(1) + 1);
        tasks.push(tokio::spawn(
            accept_loop(listener, queue_tx).instrument(span.clone()),
        ));
        for worker in 0..workers.max(1) {
            tasks.push(tokio::spawn(
                worker_loop(worker, queue_rx.clone(), local.clone()).instrument(span.clone()),
            ));
        }

        debug!(addr = %local_addr, workers = workers.max(1), "rpc server started");
        Ok(Self { local_addr, tasks })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and abort the workers.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, queue: mpsc::Sender<(TcpStream, SocketAddr)>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                trace!(remote = %remote, "accepted connection");
                if queue.send((stream, remote)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<(TcpStream, SocketAddr)>>>,
    local: LocalNode,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some((stream, remote)) = next else {
            break;
        };
        if let Err(e) = serve_connection(stream, &local).await {
            debug!(worker, remote = %remote, error = %e, "rpc connection failed");
        }
    }
}

/// Serve one request/response exchange on `stream`.
pub async fn serve_connection<S>(mut stream: S, local: &LocalNode) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| RpcError::Timeout(REQUEST_READ_TIMEOUT))??;

    let response = match decode_frame::<RpcRequest>(&frame) {
        Ok(request) => handle_request(request, local).await,
        Err(e) => {
            debug!(error = %e, "undecodable request");
            RpcResponse::error(0, ErrorCode::UnmarshalFailure)
        }
    };

    let out = encode_frame(&response)?;
    write_frame(&mut stream, &out).await
}

async fn handle_request(request: RpcRequest, local: &LocalNode) -> RpcResponse {
    let id = request.correlation_id;
    let Ok(function) = FunctionCode::try_from(request.function) else {
        debug!(code = request.function, "no such function");
        return RpcResponse::error(id, ErrorCode::NoSuchFunction);
    };
    let call = match RpcCall::decode(function, &request.arguments) {
        Ok(call) => call,
        Err(e) => {
            debug!(?function, error = %e, "argument mismatch");
            return RpcResponse::error(id, ErrorCode::ArgumentMismatch);
        }
    };
    match handle_call(call, local).await {
        Ok(value) => RpcResponse::ok(id, value),
        Err(code) => RpcResponse::error(id, code),
    }
}

/// Dispatch a decoded call against the local node.
pub async fn handle_call(call: RpcCall, local: &LocalNode) -> Result<Vec<u8>, ErrorCode> {
    let encoded = match call {
        RpcCall::Ping(PingArgs { from }) => match local.handle_ping(from).await {
            PingReply::Pong(identity) => messages::serialize(&identity),
            PingReply::Bootstrapping => return Err(ErrorCode::Bootstrapping),
        },
        RpcCall::GetStatus => messages::serialize(&local.status().await),
        RpcCall::GetResultsSince(args) => {
            let max = (args.max_count as usize).min(MAX_SYNC_BATCH);
            messages::serialize(&local.results_since(args.since, max).await)
        }
        RpcCall::GetPeers => messages::serialize(&local.k_closest().await),
        RpcCall::GetMetadataSince(args) => {
            let max = (args.max_count as usize).min(MAX_SYNC_BATCH);
            messages::serialize(&local.metadata_since(args.since, max).await)
        }
        RpcCall::GetMetadataOf(args) => messages::serialize(&local.metadata_of(args.hash).await),
    };
    encoded.map_err(|e| {
        warn!(error = %e, "failed to encode reply");
        ErrorCode::UnmarshalFailure
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::RoutingTable;
    use crate::store::{MemoryStore, SearchStore};
    use crate::transport::{TcpConnector, bind_listener};

    fn local_with(records: usize, bootstrapping: bool) -> LocalNode {
        let mut store = MemoryStore::new();
        for n in 0..records {
            store
                .insert(SearchResult::new(format!("http://r{n}.onion/"), "t", "s", 100 + n as u64))
                .expect("insert");
        }
        LocalNode::new(
            RoutingTable::new(Contact::from_addr("127.0.0.1:7100")),
            Box::new(store),
            None,
            bootstrapping,
            Span::none(),
        )
    }

    /// Push raw bytes through `serve_connection` over an in-memory pipe.
    async fn exchange(local: &LocalNode, frame: Vec<u8>) -> RpcResponse {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let client_side = async move {
            write_frame(&mut client, &frame).await.expect("write");
            read_frame(&mut client).await.expect("read")
        };
        let (served, reply) = tokio::join!(serve_connection(server, local), client_side);
        served.expect("serve");
        decode_frame(&reply).expect("decode")
    }

    #[tokio::test]
    async fn unknown_function_gets_no_such_function() {
        let local = local_with(0, false);
        let request = RpcRequest {
            function: 42,
            correlation_id: 7,
            arguments: Vec::new(),
        };
        let response = exchange(&local, encode_frame(&request).expect("frame")).await;
        assert_eq!(response.correlation_id, 7);
        assert_eq!(response.error, ErrorCode::NoSuchFunction as u8);
    }

    #[tokio::test]
    async fn wrong_arguments_get_argument_mismatch() {
        let local = local_with(0, false);
        let request = RpcRequest {
            function: FunctionCode::GetMetadataOf as u8,
            correlation_id: 8,
            arguments: vec![1, 2, 3],
        };
        let response = exchange(&local, encode_frame(&request).expect("frame")).await;
        assert_eq!(response.correlation_id, 8);
        assert_eq!(response.error, ErrorCode::ArgumentMismatch as u8);
    }

    #[tokio::test]
    async fn garbage_gets_unmarshal_failure() {
        let local = local_with(0, false);
        let response = exchange(&local, b"definitely not snappy".to_vec()).await;
        assert_eq!(response.correlation_id, 0);
        assert_eq!(response.error, ErrorCode::UnmarshalFailure as u8);
    }

    #[tokio::test]
    async fn results_since_honours_max_count() {
        let local = local_with(3, false);
        let request = RpcCall::GetResultsSince(SinceArgs { since: 0, max_count: 2 })
            .into_request(9)
            .expect("request");
        let response = exchange(&local, encode_frame(&request).expect("frame")).await;
        let records: Vec<SearchResult> = messages::deserialize_bounded(&response.value).expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, 100);
    }

    #[tokio::test]
    async fn client_and_server_over_tcp() {
        let local = local_with(5, false);
        let listener = bind_listener("127.0.0.1:0").await.expect("bind");
        let server = RpcServer::spawn(listener, local.clone(), 2, 8, Span::none()).expect("spawn");
        let remote = Contact::from_addr(server.local_addr().to_string());

        let client = RpcClient::new(Arc::new(TcpConnector::default()), DEFAULT_CALL_TIMEOUT);
        let me = Contact::from_addr("127.0.0.1:7200");

        let their_id = client.ping(&remote, &me).await.expect("ping");
        assert_eq!(their_id, Identity::from_seed(b"127.0.0.1:7100"));

        let status = client.get_status(&remote).await.expect("status");
        assert_eq!(status.results_timestamp, 104);

        let records = client.get_results_since(&remote, 102, 10).await.expect("results");
        assert_eq!(records.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![103, 104]);

        let peers = client.get_peers(&remote).await.expect("peers");
        assert_eq!(peers, vec![me.clone()]);

        assert!(client.get_metadata_since(&remote, 0, 10).await.expect("metadata").is_empty());
        assert!(client.get_metadata_of(&remote, [0; 32]).await.expect("metadata").is_none());

        server.shutdown();
    }

    #[tokio::test]
    async fn bootstrapping_peer_is_reported_distinctly() {
        let local = local_with(0, true);
        let listener = bind_listener("127.0.0.1:0").await.expect("bind");
        let server = RpcServer::spawn(listener, local, 1, 8, Span::none()).expect("spawn");
        let remote = Contact::from_addr(server.local_addr().to_string());

        let client = RpcClient::new(Arc::new(TcpConnector::default()), DEFAULT_CALL_TIMEOUT);
        let err = client
            .ping(&remote, &Contact::from_addr("127.0.0.1:7201"))
            .await
            .expect_err("sentinel");
        assert!(is_bootstrapping(&err));
        server.shutdown();
    }

    #[tokio::test]
    async fn mismatched_correlation_id_is_rejected() {
        let listener = bind_listener("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let _ = read_frame(&mut socket).await.expect("read");
            let reply = encode_frame(&RpcResponse::ok(1, messages::serialize(&Identity::ZERO).expect("encode")))
                .expect("frame");
            write_frame(&mut socket, &reply).await.expect("write");
        });

        let client = RpcClient::new(Arc::new(TcpConnector::default()), DEFAULT_CALL_TIMEOUT);
        let err = client
            .call_remote_function(&Contact::from_addr(addr), RpcCall::GetStatus)
            .await
            .expect_err("mismatch");
        assert!(matches!(err, RpcError::CorrelationMismatch { received: 1, .. }));
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_transport_error() {
        let listener = bind_listener("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let client = RpcClient::new(Arc::new(TcpConnector::default()), DEFAULT_CALL_TIMEOUT);
        let err = client
            .call_remote_function(&Contact::from_addr(addr), RpcCall::GetPeers)
            .await
            .expect_err("unreachable");
        assert!(matches!(err, RpcError::Unreachable(_)));
        assert!(!err.is_bootstrapping());
    }
}
