//! Crate-wide types, constants, and the error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Identity string every provider answers to the transport's identity probe.
/// Handles reject any other reply during the handshake.
pub const PROVIDER_IDENTITY: &str = "flock";

/// Maximum gossip events piggybacked on a single probe or announce.
pub const MAX_PIGGYBACK: usize = 8;

/// Maximum number of backend factories the process-wide registry accepts.
pub const MAX_REGISTERED_BACKENDS: usize = 64;

// =============================================================================
// HANDLE MODE FLAGS
// =============================================================================

/// Refresh the cached view immediately after the identity handshake.
pub const MODE_INIT_UPDATE: u32 = 0x1;

/// Reserved for subscription bootstrap. Accepted and ignored.
pub const MODE_SUBSCRIBE: u32 = 0x2;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Identity handshake deadline in milliseconds.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 1000;

/// View refresh RPC deadline in milliseconds.
/// Large groups serialize to sizeable payloads; keep this generous.
pub const GET_VIEW_TIMEOUT_MS: u64 = 5000;

/// Opaque credentials integer carried through handles and group files.
/// The library never interprets it.
pub type Credentials = i64;

/// Identity of one participating endpoint: the transport address string
/// plus the provider id multiplexed on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId {
    pub address: String,
    pub provider_id: u16,
}

impl MemberId {
    pub fn new(address: impl Into<String>, provider_id: u16) -> Self {
        Self { address: address.into(), provider_id }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.provider_id)
    }
}

/// Kind of membership change delivered to registered callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    /// A member was added to the view.
    Joined,
    /// A member announced departure and was removed.
    Left,
    /// A member was declared dead by the failure detector and removed.
    Died,
}

#[derive(Error, Debug)]
pub enum FlockError {
    #[error("invalid argument: {0}")]
    InvalidArgs(String),

    #[error("invalid provider identity: {0}")]
    InvalidProvider(String),

    #[error("invalid group")]
    InvalidGroup,

    #[error("unknown backend {0:?}")]
    InvalidBackend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("task failure: {0}")]
    Tasking(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("operation forbidden")]
    Forbidden,

    #[error("no such member")]
    NoMember,

    #[error("no such metadata key")]
    NoMetadata,

    #[error("caller is not a member of the group")]
    NotAMember,

    #[error("rank {0} already in use")]
    RankUsed(u64),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl FlockError {
    /// Whether this error is a refusal rather than a failure. Callers may
    /// retry the operation against a different backend.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, FlockError::Unsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_display() {
        let id = MemberId::new("mem://a", 7);
        assert_eq!(id.to_string(), "mem://a#7");
    }

    #[test]
    fn test_unsupported_classification() {
        assert!(FlockError::Unsupported("add_member").is_unsupported());
        assert!(!FlockError::NoMember.is_unsupported());
    }
}
