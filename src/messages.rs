//! # Wire Protocol Messages
//!
//! Every RPC is a single request/response exchange over a fresh connection.
//! Each direction carries exactly one frame:
//!
//! ```text
//! frame = snappy_raw(bincode(envelope))
//! ```
//!
//! There is no length prefix; the sender shuts down its write half after the
//! frame and the reader consumes to end-of-stream.
//!
//! ## Envelopes
//!
//! | Direction | Type | Fields |
//! |-----------|------|--------|
//! | Request | [`RpcRequest`] | `function`, `correlation_id`, `arguments` |
//! | Response | [`RpcResponse`] | `error`, `correlation_id`, `value` |
//!
//! `arguments` and `value` hold the bincode encoding of the per-function
//! argument and return types. On the serving side the pair
//! `(function, arguments)` is decoded into the closed [`RpcCall`] union, so
//! dispatch is a `match` rather than a runtime type check.
//!
//! ## Function Codes
//!
//! | Code | Call | Arguments | Returns |
//! |------|------|-----------|---------|
//! | 0 | Ping | [`PingArgs`] | [`Identity`] |
//! | 1 | GetStatus | `()` | [`SyncStatus`] |
//! | 2 | GetResultsSince | [`SinceArgs`] | `Vec<SearchResult>` |
//! | 3 | GetPeers | `()` | `Vec<Contact>` |
//! | 4 | GetMetadataSince | [`SinceArgs`] | `Vec<Metadata>` |
//! | 5 | GetMetadataOf | [`MetadataOfArgs`] | `Option<Metadata>` |
//!
//! ## Limits
//!
//! Decompressed frames are capped at [`MAX_MESSAGE_SIZE`] and every decode
//! goes through [`deserialize_bounded`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snap::raw::{decompress_len, Decoder, Encoder};
use thiserror::Error;

use crate::identity::Contact;
use crate::store::ContentHash;

/// Byte budget for one pull-sync batch.
pub const SYNC_BYTE_BUDGET: usize = 4 * 1024 * 1024;

/// Fixed per-record size assumed when sizing a batch.
pub const RECORD_WIRE_SIZE: usize = 2 * 1024;

/// Maximum number of records or metadata entries moved by one pull.
pub const MAX_SYNC_BATCH: usize = SYNC_BYTE_BUDGET / RECORD_WIRE_SIZE;

/// Maximum decompressed frame size (twice the sync budget leaves room for
/// records that exceed the nominal wire size).
pub const MAX_MESSAGE_SIZE: usize = 2 * SYNC_BYTE_BUDGET;

const MAX_DESERIALIZE_SIZE: u64 = MAX_MESSAGE_SIZE as u64;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. Trailing bytes are rejected.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// Codes
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    Ping = 0,
    GetStatus = 1,
    GetResultsSince = 2,
    GetPeers = 3,
    GetMetadataSince = 4,
    GetMetadataOf = 5,
}

impl TryFrom<u8> for FunctionCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        Ok(match code {
            0 => FunctionCode::Ping,
            1 => FunctionCode::GetStatus,
            2 => FunctionCode::GetResultsSince,
            3 => FunctionCode::GetPeers,
            4 => FunctionCode::GetMetadataSince,
            5 => FunctionCode::GetMetadataOf,
            other => return Err(other),
        })
    }
}

/// Error code carried by a response. `None` means `value` holds the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    UnmarshalFailure = 1,
    NoSuchFunction = 2,
    ArgumentMismatch = 3,
    /// The serving peer is itself in first-sync and has nothing to offer yet.
    Bootstrapping = 4,
}

impl TryFrom<u8> for ErrorCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        Ok(match code {
            0 => ErrorCode::None,
            1 => ErrorCode::UnmarshalFailure,
            2 => ErrorCode::NoSuchFunction,
            3 => ErrorCode::ArgumentMismatch,
            4 => ErrorCode::Bootstrapping,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::None => "none",
            ErrorCode::UnmarshalFailure => "unmarshal failure",
            ErrorCode::NoSuchFunction => "no such function",
            ErrorCode::ArgumentMismatch => "argument mismatch",
            ErrorCode::Bootstrapping => "peer is bootstrapping",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub function: u8,
    pub correlation_id: u64,
    pub arguments: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub error: u8,
    pub correlation_id: u64,
    pub value: Vec<u8>,
}

impl RpcResponse {
    pub fn ok(correlation_id: u64, value: Vec<u8>) -> Self {
        Self {
            error: ErrorCode::None as u8,
            correlation_id,
            value,
        }
    }

    pub fn error(correlation_id: u64, code: ErrorCode) -> Self {
        Self {
            error: code as u8,
            correlation_id,
            value: Vec::new(),
        }
    }
}

// ============================================================================
// Typed calls
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {
    /// The caller's own node record, pushed into the callee's routing table.
    pub from: Contact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinceArgs {
    pub since: u64,
    pub max_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataOfArgs {
    pub hash: ContentHash,
}

/// A decoded request: one variant per function code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcCall {
    Ping(PingArgs),
    GetStatus,
    GetResultsSince(SinceArgs),
    GetPeers,
    GetMetadataSince(SinceArgs),
    GetMetadataOf(MetadataOfArgs),
}

impl RpcCall {
    pub fn function(&self) -> FunctionCode {
        match self {
            RpcCall::Ping(_) => FunctionCode::Ping,
            RpcCall::GetStatus => FunctionCode::GetStatus,
            RpcCall::GetResultsSince(_) => FunctionCode::GetResultsSince,
            RpcCall::GetPeers => FunctionCode::GetPeers,
            RpcCall::GetMetadataSince(_) => FunctionCode::GetMetadataSince,
            RpcCall::GetMetadataOf(_) => FunctionCode::GetMetadataOf,
        }
    }

    pub fn encode_arguments(&self) -> Result<Vec<u8>, bincode::Error> {
        match self {
            RpcCall::Ping(args) => serialize(args),
            RpcCall::GetStatus | RpcCall::GetPeers => serialize(&()),
            RpcCall::GetResultsSince(args) | RpcCall::GetMetadataSince(args) => serialize(args),
            RpcCall::GetMetadataOf(args) => serialize(args),
        }
    }

    /// Decode the argument bytes for an already-validated function code.
    /// Fails when the bytes do not match that function's argument type.
    pub fn decode(function: FunctionCode, arguments: &[u8]) -> Result<Self, bincode::Error> {
        Ok(match function {
            FunctionCode::Ping => RpcCall::Ping(deserialize_bounded(arguments)?),
            FunctionCode::GetStatus => {
                deserialize_bounded::<()>(arguments)?;
                RpcCall::GetStatus
            }
            FunctionCode::GetResultsSince => RpcCall::GetResultsSince(deserialize_bounded(arguments)?),
            FunctionCode::GetPeers => {
                deserialize_bounded::<()>(arguments)?;
                RpcCall::GetPeers
            }
            FunctionCode::GetMetadataSince => {
                RpcCall::GetMetadataSince(deserialize_bounded(arguments)?)
            }
            FunctionCode::GetMetadataOf => RpcCall::GetMetadataOf(deserialize_bounded(arguments)?),
        })
    }

    pub fn into_request(self, correlation_id: u64) -> Result<RpcRequest, bincode::Error> {
        Ok(RpcRequest {
            function: self.function() as u8,
            correlation_id,
            arguments: self.encode_arguments()?,
        })
    }
}

// ============================================================================
// Framing
// ============================================================================

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("snappy: {0}")]
    Compression(#[from] snap::Error),
    #[error("bincode: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the message size limit")]
    TooLarge(usize),
}

/// Serialize and compress one envelope into a frame.
pub fn encode_frame<T: Serialize>(envelope: &T) -> Result<Vec<u8>, FrameError> {
    let raw = serialize(envelope)?;
    if raw.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(raw.len()));
    }
    Ok(Encoder::new().compress_vec(&raw)?)
}

/// Decompress and deserialize one frame. The decompressed size is checked
/// against [`MAX_MESSAGE_SIZE`] before any allocation.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, FrameError> {
    let len = decompress_len(frame)?;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let raw = Decoder::new().decompress_vec(frame)?;
    Ok(deserialize_bounded(&raw)?)
}
