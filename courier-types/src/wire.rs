//! RPC wire frames.
//!
//! One persistent connection carries a stream of [`Frame`]s, each encoded
//! as MessagePack behind a 4-byte big-endian length prefix. Calls correlate
//! request and response by `seq`; notifications carry no `seq` and are
//! never answered.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::CodecError;

/// Maximum size of a single encoded frame (16 MiB).
///
/// Enforced on both read and write so a corrupt length prefix cannot
/// trigger an unbounded allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A single unit on the RPC wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// A correlated call expecting exactly one Reply or Error.
    Call {
        /// Correlation number, unique per connection.
        seq: u64,
        /// Dotted method name, e.g. `chat.queue`.
        method: String,
        /// MessagePack-encoded argument.
        arg: Vec<u8>,
        /// Correlation tags extracted from the caller's context.
        tags: BTreeMap<String, String>,
    },
    /// Successful response to a Call.
    Reply {
        /// Correlation number of the originating Call.
        seq: u64,
        /// MessagePack-encoded result.
        result: Vec<u8>,
    },
    /// Failed response to a Call.
    Error {
        /// Correlation number of the originating Call.
        seq: u64,
        /// Generic wire-level error representation.
        error: WireError,
    },
    /// Fire-and-forget notification; no response is ever sent.
    Notify {
        /// Dotted method name.
        method: String,
        /// MessagePack-encoded argument.
        arg: Vec<u8>,
    },
}

impl Frame {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec(self).map_err(CodecError::Encode)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        rmp_serde::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// The generic wire representation of a remote error.
///
/// A pluggable unwrapper on the client side may translate this into a
/// richer typed error; without one, callers see it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable numeric code (see [`crate::codes`]).
    pub code: u32,
    /// Short machine-readable name, e.g. `AUTH_REJECTED`.
    pub name: String,
    /// Human-readable description.
    pub desc: String,
}

impl WireError {
    /// Create a wire error.
    pub fn new(code: u32, name: &str, desc: impl Into<String>) -> Self {
        Self {
            code,
            name: name.to_string(),
            desc: desc.into(),
        }
    }

    /// Wire error for an unknown method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            crate::codes::METHOD_NOT_FOUND,
            "METHOD_NOT_FOUND",
            format!("no handler for method {method}"),
        )
    }

    /// Wire error for a malformed argument.
    pub fn invalid_argument(desc: impl Into<String>) -> Self {
        Self::new(crate::codes::INVALID_ARGUMENT, "INVALID_ARGUMENT", desc)
    }

    /// Wire error for an unclassified server failure.
    pub fn internal(desc: impl Into<String>) -> Self {
        Self::new(crate::codes::INTERNAL, "INTERNAL", desc)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.code, self.desc)
    }
}

impl std::error::Error for WireError {}

/// Encode a call argument or result as MessagePack.
pub fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec(value).map_err(CodecError::Encode)
}

/// Decode a call argument or result from MessagePack.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(CodecError::Decode)
}
