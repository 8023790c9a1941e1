//! Node configuration.
//!
//! There is no configuration file; the daemon fills [`NodeConfig`] from its
//! command line and library users start from [`NodeConfig::default`].

use std::path::PathBuf;
use std::time::Duration;

use crate::rpc::{DEFAULT_CALL_TIMEOUT, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use crate::sync::{FAST_SYNC_INTERVAL, FLUSH_EVERY_CYCLES, SLOW_SYNC_INTERVAL};
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Socket address the RPC server binds.
    pub listen_addr: String,
    /// Address peers should use to reach us; also seeds our identity.
    /// Defaults to the bound listen address, and must be set when that
    /// address is a wildcard.
    pub advertise_addr: Option<String>,
    /// Directory holding the routing table, store snapshot and first-sync marker.
    pub data_dir: PathBuf,
    pub rpc_workers: usize,
    pub rpc_queue_capacity: usize,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    /// Delay between sync cycles while in first-sync.
    pub first_sync_interval: Duration,
    /// Delay between sync cycles once caught up.
    pub sync_interval: Duration,
    /// Persist the store and routing table every this many cycles.
    pub flush_every_cycles: u64,
    /// Seed peers contacted at start-up.
    pub bootstrap: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7000".to_string(),
            advertise_addr: None,
            data_dir: PathBuf::from("meshseek-data"),
            rpc_workers: DEFAULT_WORKERS,
            rpc_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            first_sync_interval: FAST_SYNC_INTERVAL,
            sync_interval: SLOW_SYNC_INTERVAL,
            flush_every_cycles: FLUSH_EVERY_CYCLES,
            bootstrap: Vec::new(),
        }
    }
}
