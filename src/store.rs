//! # Search Store Contract
//!
//! The search-result store is an external collaborator: the routing and sync
//! layers only ever talk to it through [`SearchStore`]. Records are
//! content-addressed by `blake3(url)` so two peers that crawl the same page
//! converge on one entry.
//!
//! [`MemoryStore`] is the reference implementation used by the daemon and the
//! tests. It keeps everything in memory and, when opened with a path, writes a
//! bincode snapshot on [`SearchStore::flush`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake3::hash;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Content hash keying both records and their metadata.
pub type ContentHash = [u8; 32];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub hash: ContentHash,
    pub url: String,
    pub title: String,
    pub snippet: String,
    /// Milliseconds since Unix epoch when the result was produced.
    pub timestamp: u64,
}

impl SearchResult {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        snippet: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let url = url.into();
        Self {
            hash: *hash(url.as_bytes()).as_bytes(),
            url,
            title: title.into(),
            snippet: snippet.into(),
            timestamp,
        }
    }

    fn matches(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle)
            || self.snippet.to_lowercase().contains(needle)
            || self.url.to_lowercase().contains(needle)
    }
}

/// Peer-contributed quality signal for one result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub hash: ContentHash,
    pub score: f32,
    pub votes: u32,
    pub timestamp: u64,
}

/// Watermarks exchanged by the status call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub results_timestamp: u64,
    pub metadata_timestamp: u64,
}

/// Operations the overlay needs from the search-result store.
///
/// Both watermarks are monotonically non-decreasing.
pub trait SearchStore: Send + 'static {
    fn insert(&mut self, record: SearchResult) -> Result<()>;

    fn search_by_text(&self, query: &str) -> Vec<SearchResult>;

    /// Records strictly newer than `since`, oldest first, at most `max_count`.
    fn records_since(&self, since: u64, max_count: usize) -> Vec<SearchResult>;

    /// Metadata strictly newer than `since`, oldest first, at most `max_count`.
    fn metadata_since(&self, since: u64, max_count: usize) -> Vec<Metadata>;

    fn metadata_by_hash(&self, hash: &ContentHash) -> Option<Metadata>;

    /// Idempotent upsert keyed by content hash, keeping the newer record.
    /// Returns how many records changed.
    fn merge_records(&mut self, records: Vec<SearchResult>) -> usize;

    /// Idempotent upsert that averages scores of known hashes. An entry
    /// that is neither newer nor better voted than the stored one is ignored.
    /// Returns how many entries changed.
    fn merge_metadata(&mut self, metadata: Vec<Metadata>) -> usize;

    fn flush(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn last_results_timestamp(&self) -> u64;

    fn last_metadata_timestamp(&self) -> u64;

    fn is_empty(&self) -> bool;

    fn status(&self) -> SyncStatus {
        SyncStatus {
            results_timestamp: self.last_results_timestamp(),
            metadata_timestamp: self.last_metadata_timestamp(),
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    records: Vec<SearchResult>,
    metadata: Vec<Metadata>,
}

#[derive(Default)]
pub struct MemoryStore {
    records: HashMap<ContentHash, SearchResult>,
    metadata: HashMap<ContentHash, Metadata>,
    last_results_ts: u64,
    last_metadata_ts: u64,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a snapshot file, loading it when present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            snapshot_path: Some(path.clone()),
            ..Self::default()
        };
        if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let snapshot: Snapshot = bincode::deserialize(&bytes)
                .with_context(|| format!("malformed store snapshot {}", path.display()))?;
            store.merge_records(snapshot.records);
            store.merge_metadata(snapshot.metadata);
            debug!(
                path = %path.display(),
                records = store.records.len(),
                metadata = store.metadata.len(),
                "loaded store snapshot"
            );
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn bump_results(&mut self, ts: u64) {
        self.last_results_ts = self.last_results_ts.max(ts);
    }

    fn bump_metadata(&mut self, ts: u64) {
        self.last_metadata_ts = self.last_metadata_ts.max(ts);
    }
}

impl SearchStore for MemoryStore {
    fn insert(&mut self, record: SearchResult) -> Result<()> {
        self.bump_results(record.timestamp);
        self.records.insert(record.hash, record);
        Ok(())
    }

    fn search_by_text(&self, query: &str) -> Vec<SearchResult> {
        let needle = query.to_lowercase();
        let mut hits: Vec<SearchResult> = self
            .records
            .values()
            .filter(|r| r.matches(&needle))
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        hits
    }

    fn records_since(&self, since: u64, max_count: usize) -> Vec<SearchResult> {
        let mut newer: Vec<&SearchResult> =
            self.records.values().filter(|r| r.timestamp > since).collect();
        newer.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.hash.cmp(&b.hash)));
        newer.into_iter().take(max_count).cloned().collect()
    }

    fn metadata_since(&self, since: u64, max_count: usize) -> Vec<Metadata> {
        let mut newer: Vec<&Metadata> =
            self.metadata.values().filter(|m| m.timestamp > since).collect();
        newer.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.hash.cmp(&b.hash)));
        newer.into_iter().take(max_count).cloned().collect()
    }

    fn metadata_by_hash(&self, hash: &ContentHash) -> Option<Metadata> {
        self.metadata.get(hash).cloned()
    }

    fn merge_records(&mut self, records: Vec<SearchResult>) -> usize {
        let mut changed = 0;
        for record in records {
            if let Some(existing) = self.records.get(&record.hash)
                && existing.timestamp >= record.timestamp
            {
                continue;
            }
            self.bump_results(record.timestamp);
            self.records.insert(record.hash, record);
            changed += 1;
        }
        changed
    }

    fn merge_metadata(&mut self, metadata: Vec<Metadata>) -> usize {
        let mut changed = 0;
        for incoming in metadata {
            let merged = match self.metadata.get(&incoming.hash) {
                Some(existing)
                    if existing.timestamp >= incoming.timestamp
                        && existing.votes >= incoming.votes =>
                {
                    continue;
                }
                Some(existing) => Metadata {
                    hash: incoming.hash,
                    score: (existing.score + incoming.score) / 2.0,
                    votes: existing.votes.max(incoming.votes),
                    timestamp: existing.timestamp.max(incoming.timestamp),
                },
                None => incoming,
            };
            self.bump_metadata(merged.timestamp);
            self.metadata.insert(merged.hash, merged);
            changed += 1;
        }
        changed
    }

    fn flush(&mut self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            records: self.records.values().cloned().collect(),
            metadata: self.metadata.values().cloned().collect(),
        };
        let bytes = bincode::serialize(&snapshot).context("failed to encode store snapshot")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move snapshot into {}", path.display()))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    fn last_results_timestamp(&self) -> u64 {
        self.last_results_ts
    }

    fn last_metadata_timestamp(&self) -> u64 {
        self.last_metadata_ts
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty() && self.metadata.is_empty()
    }
}
