//! Server cache version tracking.
//!
//! The server declares generation numbers for the inbox and message-body
//! caches. A caller holding cached data compares its generation against
//! the authoritative one here; any mismatch means the local cache is
//! untrusted and must be resynced. Versions are compared, never merged.

use courier_rpc::Context;
use courier_types::{decode_value, encode_value, CodecError, ServerCacheVers};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{KvStore, StoreError};

const TABLE: &str = "chat_blocks";
const KEY: &str = "server_versions";

/// Version cache errors.
#[derive(Debug, Error)]
pub enum VersionError {
    /// A caller-held generation number does not match the authoritative
    /// one; the caller must invalidate and resync.
    #[error("version mismatch: expected {expected}, server has {actual}")]
    Mismatch {
        /// The generation the caller holds.
        expected: u64,
        /// The authoritative generation.
        actual: u64,
    },

    /// The persisted record could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The persisted record could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Tracks the server-declared cache generation numbers.
///
/// One instance per local store. Every fetch/match/sync sequence runs
/// under a single exclusive lock so a mismatch is never computed against
/// a half-updated value.
pub struct ServerVersions {
    store: Arc<dyn KvStore>,
    cached: Mutex<Option<ServerCacheVers>>,
}

impl ServerVersions {
    /// Create a version cache over the given store.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// The authoritative versions: memory first, then the store, else the
    /// zero value. A missing record is not an error.
    pub async fn fetch(&self, _ctx: &Context) -> Result<ServerCacheVers, VersionError> {
        let mut cached = self.cached.lock().await;
        self.fetch_locked(&mut cached).await
    }

    /// Compare a caller-held inbox generation against the authoritative
    /// one.
    pub async fn match_inbox(&self, _ctx: &Context, expected: u64) -> Result<(), VersionError> {
        let mut cached = self.cached.lock().await;
        let vers = self.fetch_locked(&mut cached).await?;
        Self::check(expected, vers.inbox_vers)
    }

    /// Compare a caller-held bodies generation against the authoritative
    /// one.
    pub async fn match_bodies(&self, _ctx: &Context, expected: u64) -> Result<(), VersionError> {
        let mut cached = self.cached.lock().await;
        let vers = self.fetch_locked(&mut cached).await?;
        Self::check(expected, vers.bodies_vers)
    }

    /// Replace the authoritative versions in memory and in the store.
    /// Subsequent fetches observe the new value immediately.
    pub async fn sync(&self, _ctx: &Context, vers: ServerCacheVers) -> Result<(), VersionError> {
        let mut cached = self.cached.lock().await;
        *cached = Some(vers);
        let encoded = encode_value(&vers)?;
        self.store.put(TABLE, KEY, &encoded).await?;
        Ok(())
    }

    async fn fetch_locked(
        &self,
        cached: &mut Option<ServerCacheVers>,
    ) -> Result<ServerCacheVers, VersionError> {
        if let Some(vers) = *cached {
            return Ok(vers);
        }

        let vers = match self.store.get(TABLE, KEY).await? {
            Some(raw) => decode_value(&raw)?,
            None => {
                tracing::debug!("no server versions on record, using defaults");
                ServerCacheVers::default()
            }
        };
        *cached = Some(vers);
        Ok(vers)
    }

    fn check(expected: u64, actual: u64) -> Result<(), VersionError> {
        if expected != actual {
            return Err(VersionError::Mismatch { expected, actual });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn versions() -> (ServerVersions, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ServerVersions::new(store.clone()), store)
    }

    #[tokio::test]
    async fn fetch_with_no_record_is_zero() {
        let (vers, _) = versions();
        let got = vers.fetch(&Context::background()).await.unwrap();
        assert_eq!(got, ServerCacheVers::default());
    }

    #[tokio::test]
    async fn sync_then_fetch_then_match() {
        let (vers, _) = versions();
        let ctx = Context::background();

        vers.sync(&ctx, ServerCacheVers::new(5, 5)).await.unwrap();

        let got = vers.fetch(&ctx).await.unwrap();
        assert_eq!(got, ServerCacheVers::new(5, 5));

        vers.match_bodies(&ctx, 5).await.unwrap();
        match vers.match_bodies(&ctx, 6).await.unwrap_err() {
            VersionError::Mismatch { expected, actual } => {
                assert_eq!(expected, 6);
                assert_eq!(actual, 5);
            }
            other => panic!("expected Mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn match_inbox_and_bodies_are_independent() {
        let (vers, _) = versions();
        let ctx = Context::background();
        vers.sync(&ctx, ServerCacheVers::new(3, 8)).await.unwrap();

        vers.match_inbox(&ctx, 3).await.unwrap();
        vers.match_bodies(&ctx, 8).await.unwrap();
        assert!(vers.match_inbox(&ctx, 8).await.is_err());
    }

    #[tokio::test]
    async fn synced_value_survives_a_new_instance() {
        let (vers, store) = versions();
        let ctx = Context::background();
        vers.sync(&ctx, ServerCacheVers::new(12, 7)).await.unwrap();

        // A fresh instance over the same store loads the persisted record.
        let fresh = ServerVersions::new(store);
        let got = fresh.fetch(&ctx).await.unwrap();
        assert_eq!(got, ServerCacheVers::new(12, 7));
    }

    #[tokio::test]
    async fn mismatch_is_surfaced_not_absorbed() {
        let (vers, _) = versions();
        let ctx = Context::background();
        vers.sync(&ctx, ServerCacheVers::new(2, 2)).await.unwrap();

        // Repeated mismatched checks keep failing; nothing silently heals.
        for _ in 0..3 {
            assert!(vers.match_inbox(&ctx, 1).await.is_err());
        }
        vers.match_inbox(&ctx, 2).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.put(TABLE, KEY, b"not msgpack").await.unwrap();
        let vers = ServerVersions::new(store);
        assert!(matches!(
            vers.fetch(&Context::background()).await,
            Err(VersionError::Codec(_))
        ));
    }
}
