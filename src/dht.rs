//! # Kademlia-style Routing Table
//!
//! This module implements the overlay's distance routing table:
//!
//! - **K-Buckets**: bounded per-height contact lists with a replacement cache
//! - **Soft failures**: removal degrades to a stale counter unless a
//!   replacement is ready, so transient unreachability never shrinks a bucket
//! - **Self rebinding**: changing the local identity rehomes every contact
//! - **Binary persistence**: a fixed, byte-exact file layout
//!
//! ## Bucket Organization
//!
//! There are 160 buckets, one per height. A contact `c` lives in bucket
//! `height(c.identity XOR self.identity)`:
//!
//! ```text
//!   Bucket 159: distance has its top bit set (furthest, half of keyspace)
//!   Bucket 158: next quarter
//!   ...
//!   Bucket 0:   distance 0 or 1 (closest)
//! ```
//!
//! ## Persisted Layout
//!
//! ```text
//! self:    id[20] addr_len[1] addr[addr_len]
//! 160 x    height[1] entry_count[1]
//!          entry_count x  is_replacement[1] id[20] last_seen[8, LE]
//!                         stale_count[1] addr_len[1] addr[addr_len]
//! ```
//!
//! Decoding rejects rows whose identity does not belong to the bucket they
//! are stored under, and buckets holding more than K active or K replacement
//! rows. Duplicate identities keep their first row.
//!
//! Addresses are limited to 255 bytes by their one-byte length prefix.
//! Longer addresses are rejected at insertion and at encoding time; they are
//! never truncated.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, trace};

use crate::identity::{Contact, ID_BITS, ID_BYTES, Identity};

/// Bucket capacity (active list and replacement list each).
pub const K: usize = 20;

/// One bucket per possible height.
pub const NUM_BUCKETS: usize = ID_BITS;

/// Stale count at which an active contact may be evicted by a newcomer.
pub const STALE_THRESHOLD: u8 = 5;

/// Longest address representable in the persisted layout.
pub const MAX_ADDR_LEN: usize = u8::MAX as usize;

/// Result of offering a contact to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Already active; timestamp refreshed and moved to the front.
    Refreshed,
    /// Appended to the active list.
    Inserted,
    /// Took the slot of the stalest active contact, which was dropped.
    ReplacedStale(Box<Contact>),
    /// Bucket full with no stale entry; kept as a replacement candidate.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct KBucket {
    height: u8,
    active: Vec<Contact>,
    replacements: Vec<Contact>,
}

impl KBucket {
    pub fn new(height: u8) -> Self {
        Self {
            height,
            active: Vec::with_capacity(K),
            replacements: Vec::new(),
        }
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn push_node(&mut self, contact: Contact) -> PushOutcome {
        if let Some(pos) = self.active.iter().position(|c| c.identity == contact.identity) {
            let mut existing = self.active.remove(pos);
            existing.addr = contact.addr;
            existing.touch();
            self.active.insert(0, existing);
            return PushOutcome::Refreshed;
        }

        if self.active.len() < K {
            self.replacements.retain(|c| c.identity != contact.identity);
            self.active.push(contact);
            return PushOutcome::Inserted;
        }

        if let Some(idx) = self.stalest_evictable() {
            let evicted = std::mem::replace(&mut self.active[idx], contact);
            return PushOutcome::ReplacedStale(Box::new(evicted));
        }

        self.push_replacement(contact);
        PushOutcome::Deferred
    }

    /// First active entry with the highest stale count at or above the threshold.
    fn stalest_evictable(&self) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (idx, contact) in self.active.iter().enumerate() {
            if contact.stale_count < STALE_THRESHOLD {
                continue;
            }
            match best {
                Some((_, count)) if count >= contact.stale_count => {}
                _ => best = Some((idx, contact.stale_count)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn push_replacement(&mut self, contact: Contact) {
        if let Some(existing) = self
            .replacements
            .iter_mut()
            .find(|c| c.identity == contact.identity)
        {
            existing.addr = contact.addr;
            existing.touch();
        } else {
            self.replacements.push(contact);
            if self.replacements.len() > K
                && let Some(oldest) = self
                    .replacements
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.last_seen)
                    .map(|(idx, _)| idx)
            {
                self.replacements.remove(oldest);
            }
        }
        self.sort_replacements();
    }

    fn sort_replacements(&mut self) {
        self.replacements.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    }

    /// Returns whether `identity` was an active contact.
    ///
    /// With a replacement available the most recent one takes the slot;
    /// otherwise the contact stays and its stale count grows by one.
    pub fn remove_node(&mut self, identity: &Identity) -> bool {
        let Some(pos) = self.active.iter().position(|c| &c.identity == identity) else {
            return false;
        };

        if self.replacements.is_empty() {
            let contact = &mut self.active[pos];
            contact.stale_count = contact.stale_count.saturating_add(1);
        } else {
            let promoted = self.replacements.remove(0);
            self.active[pos] = promoted;
            self.sort_replacements();
        }
        true
    }

    /// Drop `identity` outright. An active slot is refilled from the most
    /// recent replacement when one exists. Returns whether it was held.
    pub fn evict_node(&mut self, identity: &Identity) -> bool {
        if let Some(pos) = self.active.iter().position(|c| &c.identity == identity) {
            if self.replacements.is_empty() {
                self.active.remove(pos);
            } else {
                self.active[pos] = self.replacements.remove(0);
            }
            return true;
        }
        if let Some(pos) = self.replacements.iter().position(|c| &c.identity == identity) {
            self.replacements.remove(pos);
            return true;
        }
        false
    }

    pub fn nodes(&self) -> &[Contact] {
        &self.active
    }

    pub fn replacement_nodes(&self) -> &[Contact] {
        &self.replacements
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.active.len() == K
    }

    fn drain(&mut self) -> Vec<Contact> {
        let mut held = std::mem::take(&mut self.active);
        held.append(&mut self.replacements);
        held
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingCodecError {
    #[error("routing table data truncated at byte {0}")]
    Truncated(usize),
    #[error("address of {0} bytes exceeds the 255-byte limit")]
    AddressTooLong(usize),
    #[error("address is not valid UTF-8")]
    InvalidAddress,
    #[error("bucket height {0} out of range")]
    InvalidHeight(u8),
    #[error("bucket holds {0} entries, more than a one-byte count allows")]
    TooManyEntries(usize),
    #[error("entry at height {actual} stored in bucket {bucket}")]
    MisplacedEntry { bucket: u8, actual: usize },
    #[error("bucket {0} holds more than K active or replacement entries")]
    BucketOverflow(u8),
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    self_node: Contact,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(self_node: Contact) -> Self {
        Self {
            self_node,
            buckets: empty_buckets(),
        }
    }

    pub fn self_node(&self) -> &Contact {
        &self.self_node
    }

    pub fn identity(&self) -> Identity {
        self.self_node.identity
    }

    /// Rebind the local identity, rehoming every held contact.
    pub fn set_self_node(&mut self, node: Contact) {
        if node.identity == self.self_node.identity {
            self.self_node.addr = node.addr;
            return;
        }

        let held: Vec<Contact> = self.buckets.iter_mut().flat_map(|b| b.drain()).collect();
        debug!(
            old = %hex::encode(&self.self_node.identity.to_bytes()[..8]),
            new = %hex::encode(&node.identity.to_bytes()[..8]),
            rehomed = held.len(),
            "rebinding routing table identity"
        );
        self.self_node = node;
        self.buckets = empty_buckets();
        for contact in held {
            self.push_node(contact);
        }
    }

    fn bucket_index(&self, identity: &Identity) -> usize {
        identity.xor(&self.self_node.identity).eval_height()
    }

    /// Offer a contact to its bucket. Returns `None` when rejected (self, or an
    /// address that cannot be persisted).
    pub fn push_node(&mut self, contact: Contact) -> Option<PushOutcome> {
        if contact.identity == self.self_node.identity {
            return None;
        }
        if contact.addr.len() > MAX_ADDR_LEN {
            debug!(
                peer = %contact.short_id(),
                addr_len = contact.addr.len(),
                "rejecting contact: address too long"
            );
            return None;
        }
        let idx = self.bucket_index(&contact.identity);
        let outcome = self.buckets[idx].push_node(contact);
        trace!(bucket = idx, ?outcome, "pushed contact");
        Some(outcome)
    }

    pub fn remove_node(&mut self, identity: &Identity) -> bool {
        if *identity == self.self_node.identity {
            return false;
        }
        let idx = self.bucket_index(identity);
        self.buckets[idx].remove_node(identity)
    }

    /// Hard removal used when a peer fails a sync exchange.
    pub fn evict_node(&mut self, identity: &Identity) -> bool {
        if *identity == self.self_node.identity {
            return false;
        }
        let idx = self.bucket_index(identity);
        let evicted = self.buckets[idx].evict_node(identity);
        if evicted {
            trace!(bucket = idx, peer = %hex::encode(&identity.to_bytes()[..8]), "evicted contact");
        }
        evicted
    }

    /// Up to `n` active contacts ordered by XOR distance to `target`.
    ///
    /// The local node takes part unless `target` is its own identity.
    pub fn get_n_closest_to(&self, target: &Identity, n: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes().iter().cloned())
            .collect();
        if *target != self.self_node.identity {
            all.push(self.self_node.clone());
        }
        all.sort_by(|a, b| a.identity.xor(target).cmp(&b.identity.xor(target)));
        all.truncate(n);
        all
    }

    pub fn get_k_closest(&self) -> Vec<Contact> {
        self.get_n_closest_to(&self.self_node.identity, K)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        if *identity == self.self_node.identity {
            return false;
        }
        let idx = self.bucket_index(identity);
        self.buckets[idx].nodes().iter().any(|c| &c.identity == identity)
    }

    pub fn bucket(&self, height: usize) -> Option<&KBucket> {
        self.buckets.get(height)
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    pub fn is_full(&self) -> bool {
        self.buckets.iter().any(KBucket::is_full)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RoutingCodecError> {
        let mut out = Vec::with_capacity(ID_BYTES + 1 + NUM_BUCKETS * 2);
        out.extend_from_slice(&self.self_node.identity.to_bytes());
        put_addr(&mut out, &self.self_node.addr)?;

        for bucket in &self.buckets {
            let count = bucket.active.len() + bucket.replacements.len();
            let count = u8::try_from(count).map_err(|_| RoutingCodecError::TooManyEntries(count))?;
            out.push(bucket.height);
            out.push(count);
            let rows = bucket
                .active
                .iter()
                .map(|c| (false, c))
                .chain(bucket.replacements.iter().map(|c| (true, c)));
            for (is_replacement, contact) in rows {
                out.push(u8::from(is_replacement));
                out.extend_from_slice(&contact.identity.to_bytes());
                out.extend_from_slice(&contact.last_seen.to_le_bytes());
                out.push(contact.stale_count);
                put_addr(&mut out, &contact.addr)?;
            }
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RoutingCodecError> {
        let mut reader = Reader::new(bytes);
        let self_id = reader.identity()?;
        let self_addr = reader.addr()?;
        let mut table = RoutingTable::new(Contact::new(self_id, self_addr));
        let mut seen = HashSet::new();

        for _ in 0..NUM_BUCKETS {
            let height = reader.u8()?;
            if height as usize >= NUM_BUCKETS {
                return Err(RoutingCodecError::InvalidHeight(height));
            }
            let count = reader.u8()?;
            for _ in 0..count {
                let is_replacement = reader.u8()? != 0;
                let identity = reader.identity()?;
                let last_seen = reader.u64_le()?;
                let stale_count = reader.u8()?;
                let addr = reader.addr()?;
                if identity == self_id || !seen.insert(identity) {
                    continue;
                }
                let actual = table.bucket_index(&identity);
                if actual != height as usize {
                    return Err(RoutingCodecError::MisplacedEntry { bucket: height, actual });
                }
                let contact = Contact {
                    identity,
                    addr,
                    last_seen,
                    stale_count,
                };
                let bucket = &mut table.buckets[height as usize];
                let list = if is_replacement {
                    &mut bucket.replacements
                } else {
                    &mut bucket.active
                };
                if list.len() >= K {
                    return Err(RoutingCodecError::BucketOverflow(height));
                }
                list.push(contact);
            }
        }

        for bucket in &mut table.buckets {
            bucket.sort_replacements();
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes().context("failed to encode routing table")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move routing table into {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let table = Self::from_bytes(&bytes)
            .with_context(|| format!("malformed routing table {}", path.display()))?;
        Ok(table)
    }
}

fn empty_buckets() -> Vec<KBucket> {
    (0..NUM_BUCKETS).map(|h| KBucket::new(h as u8)).collect()
}

fn put_addr(out: &mut Vec<u8>, addr: &str) -> Result<(), RoutingCodecError> {
    let len = u8::try_from(addr.len()).map_err(|_| RoutingCodecError::AddressTooLong(addr.len()))?;
    out.push(len);
    out.extend_from_slice(addr.as_bytes());
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RoutingCodecError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(RoutingCodecError::Truncated(self.pos));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, RoutingCodecError> {
        Ok(self.take(1)?[0])
    }

    fn u64_le(&mut self) -> Result<u64, RoutingCodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn identity(&mut self) -> Result<Identity, RoutingCodecError> {
        let mut raw = [0u8; ID_BYTES];
        raw.copy_from_slice(self.take(ID_BYTES)?);
        Ok(Identity::from_bytes(raw))
    }

    fn addr(&mut self) -> Result<String, RoutingCodecError> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| RoutingCodecError::InvalidAddress)
    }
}
