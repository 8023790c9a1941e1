//! # Overlay Identifiers and Node Records
//!
//! This module defines the two leaf types every other component builds on:
//!
//! - [`Identity`]: a 160-bit overlay identifier stored as five 32-bit words
//!   (word 0 is the most significant)
//! - [`Contact`]: the node record kept by the routing table
//!
//! ## Identity Model
//!
//! An identity is either derived from a peer's network address
//! (`SHA-1(address)`, see [`Identity::from_seed`]) or drawn from the OS
//! CSPRNG ([`Identity::random`]). The overlay trusts any reachable address,
//! so no key material is attached to an identity.
//!
//! ## Distance
//!
//! Distance between two identities is their bitwise XOR, itself an
//! [`Identity`]. The **height** of a distance is the index of its highest set
//! bit (0..=159); a zero distance has height 0. Height selects the k-bucket an
//! observation belongs to.
//!
//! ## Invariants
//!
//! - `a.xor(&a).eval_height() == 0`
//! - `a.xor(&b).xor(&b) == a`
//! - `Ord` compares words from the most significant down, which is the order
//!   used to compare distances; it carries no other meaning.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Width of an identity in bits.
pub const ID_BITS: usize = 160;

/// Width of an identity in bytes (the persisted and hashed form).
pub const ID_BYTES: usize = 20;

/// Number of 32-bit words in an identity.
const ID_WORDS: usize = 5;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Identity([u32; ID_WORDS]);

impl Identity {
    /// The all-zero identity (distance of a node to itself).
    pub const ZERO: Identity = Identity([0; ID_WORDS]);

    #[inline]
    pub const fn from_words(words: [u32; ID_WORDS]) -> Self {
        Self(words)
    }

    #[inline]
    pub fn words(&self) -> &[u32; ID_WORDS] {
        &self.0
    }

    /// Build an identity from its 20-byte big-endian form.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        let mut words = [0u32; ID_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            let start = i * 4;
            *word = u32::from_be_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ]);
        }
        Self(words)
    }

    /// The 20-byte big-endian form, most significant word first.
    pub fn to_bytes(&self) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    /// Derive an identity from arbitrary seed bytes (usually a network address).
    pub fn from_seed(seed: &[u8]) -> Self {
        let digest = Sha1::digest(seed);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest);
        Self::from_bytes(bytes)
    }

    /// Draw a fresh identity from the OS random source.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    #[inline]
    pub fn xor(&self, other: &Identity) -> Identity {
        let mut out = [0u32; ID_WORDS];
        for (i, word) in out.iter_mut().enumerate() {
            *word = self.0[i] ^ other.0[i];
        }
        Identity(out)
    }

    /// Word-wise comparison from the most significant word down.
    #[inline]
    pub fn less_than(&self, other: &Identity) -> bool {
        for i in 0..ID_WORDS {
            if self.0[i] != other.0[i] {
                return self.0[i] < other.0[i];
            }
        }
        false
    }

    /// Index of the highest set bit, treating this identity as a distance.
    ///
    /// The zero distance maps to height 0, the same bucket as a distance of 1.
    pub fn eval_height(&self) -> usize {
        for (i, word) in self.0.iter().enumerate() {
            if *word != 0 {
                let word_base = (ID_WORDS - 1 - i) * 32;
                return word_base + (31 - word.leading_zeros() as usize);
            }
        }
        0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self::from_bytes(arr))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ID_BYTES]> for Identity {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        Self::from_bytes(bytes)
    }
}

/// A node as seen by the routing table.
///
/// `last_seen` is refreshed on every fresh observation; `stale_count` counts
/// unconfirmed removals and resets to zero on a fresh observation. A contact
/// is owned by exactly one k-bucket at a time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addr: String,
    /// Milliseconds since Unix epoch of the last fresh observation.
    pub last_seen: u64,
    pub stale_count: u8,
}

impl Contact {
    /// A freshly observed contact.
    pub fn new(identity: Identity, addr: impl Into<String>) -> Self {
        Self {
            identity,
            addr: addr.into(),
            last_seen: now_ms(),
            stale_count: 0,
        }
    }

    /// A freshly observed contact whose identity is derived from its address.
    pub fn from_addr(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self::new(Identity::from_seed(addr.as_bytes()), addr)
    }

    /// Record a fresh observation.
    pub fn touch(&mut self) {
        self.last_seen = now_ms();
        self.stale_count = 0;
    }

    /// Short hex prefix for log fields.
    pub fn short_id(&self) -> String {
        hex::encode(&self.identity.to_bytes()[..8])
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}
