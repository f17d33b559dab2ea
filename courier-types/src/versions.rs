//! Server-declared cache generation numbers.

use serde::{Deserialize, Serialize};

/// Cache generation numbers the server declares authoritative.
///
/// Both values are monotonically non-decreasing. They are compared, never
/// merged: any mismatch means the local cache is untrusted and must be
/// resynced. The zero value stands for "no record yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCacheVers {
    /// Generation of the inbox (conversation list) cache.
    pub inbox_vers: u64,
    /// Generation of the message-bodies cache.
    pub bodies_vers: u64,
}

impl ServerCacheVers {
    /// Create a new version pair.
    pub fn new(inbox_vers: u64, bodies_vers: u64) -> Self {
        Self {
            inbox_vers,
            bodies_vers,
        }
    }
}
