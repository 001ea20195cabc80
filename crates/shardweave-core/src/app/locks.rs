//! ResourceLocks - metadata を書き換える前に取るロック
//!
//! ロック順（常にこの順で取る）:
//! 1. node registry（shared）: fan-out 中にノード集合が変わらないように
//! 2. shard distribution metadata（exclusive）
//! 3. shard resource（exclusive）
//!
//! tokio の `RwLock` は writer 優先なので、順序が崩れると
//! shared 同士でもデッドロックし得る。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::domain::ShardId;

type LockTable = Mutex<HashMap<ShardId, Arc<RwLock<()>>>>;

#[derive(Default)]
pub struct ResourceLocks {
    node_registry: Arc<RwLock<()>>,
    shard_metadata: LockTable,
    shard_resource: LockTable,
}

/// Both per-shard locks, held for a whole metadata rewrite.
pub struct ShardRewriteGuard {
    // dropped in declaration order: resource first, then metadata
    _resource: OwnedRwLockWriteGuard<()>,
    _metadata: OwnedRwLockWriteGuard<()>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn node_registry_shared(&self) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.node_registry).read_owned().await
    }

    async fn entry(table: &LockTable, shard_id: ShardId) -> Arc<RwLock<()>> {
        let mut map = table.lock().await;
        Arc::clone(map.entry(shard_id).or_default())
    }

    pub async fn shard_metadata_exclusive(&self, shard_id: ShardId) -> OwnedRwLockWriteGuard<()> {
        Self::entry(&self.shard_metadata, shard_id)
            .await
            .write_owned()
            .await
    }

    pub async fn shard_resource_exclusive(&self, shard_id: ShardId) -> OwnedRwLockWriteGuard<()> {
        Self::entry(&self.shard_resource, shard_id)
            .await
            .write_owned()
            .await
    }

    /// Metadata lock, then resource lock.
    pub async fn lock_shard_for_rewrite(&self, shard_id: ShardId) -> ShardRewriteGuard {
        let metadata = self.shard_metadata_exclusive(shard_id).await;
        let resource = self.shard_resource_exclusive(shard_id).await;
        ShardRewriteGuard {
            _resource: resource,
            _metadata: metadata,
        }
    }
}
