//! InMemoryMetadataStore - 開発・テスト用の metadata store
//!
//! # 実装詳細
//! - 全テーブルを 1 つの `CatalogState` にまとめ、tokio Mutex で排他制御
//! - `apply` は state を複製して適用し、全 op 成功時だけ差し替える
//! - `fail_next_apply` で書き換え失敗（crash 相当）を注入できる

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    ColocationGroup, ColocationId, MetadataError, NodeAddr, PartitionRow, PlacementId, Shard,
    ShardId, ShardPlacement, ShardState, TableDefinition, TableId, WorkerNode,
};
use crate::ports::{MetadataBatch, MetadataOp, MetadataStore};

#[derive(Debug, Clone, Default)]
struct CatalogState {
    tables: HashMap<TableId, TableDefinition>,
    partitions: HashMap<TableId, PartitionRow>,
    shards: BTreeMap<ShardId, Shard>,
    placements: BTreeMap<PlacementId, ShardPlacement>,
    colocations: BTreeMap<ColocationId, ColocationGroup>,
    workers: Vec<WorkerNode>,

    next_placement_id: u64,
    next_colocation_id: u64,
}

impl CatalogState {
    fn new() -> Self {
        Self {
            next_placement_id: 1,
            next_colocation_id: 1,
            ..Self::default()
        }
    }

    fn allocate_placement_id(&mut self) -> PlacementId {
        let id = PlacementId::new(self.next_placement_id);
        self.next_placement_id += 1;
        id
    }

    fn allocate_colocation_id(&mut self) -> ColocationId {
        let id = ColocationId::new(self.next_colocation_id);
        self.next_colocation_id += 1;
        id
    }

    fn apply_op(&mut self, op: MetadataOp) -> Result<(), MetadataError> {
        match op {
            MetadataOp::DeletePartitionRow(table_id) => {
                self.partitions
                    .remove(&table_id)
                    .ok_or_else(|| MetadataError::not_found("partition row", table_id))?;
            }
            MetadataOp::DeleteColocationGroupIfEmpty(colocation_id) => {
                let in_use = self
                    .partitions
                    .values()
                    .any(|p| p.colocation_id == Some(colocation_id));
                if !in_use {
                    self.colocations.remove(&colocation_id);
                }
            }
            MetadataOp::DeleteShardRow(shard_id) => {
                self.shards
                    .remove(&shard_id)
                    .ok_or_else(|| MetadataError::not_found("shard", shard_id))?;
            }
            MetadataOp::DeletePlacementRow(placement_id) => {
                self.placements
                    .remove(&placement_id)
                    .ok_or_else(|| MetadataError::not_found("placement", placement_id))?;
            }
            MetadataOp::InsertColocationGroup(group) => {
                if self.colocations.contains_key(&group.colocation_id) {
                    return Err(MetadataError::conflict("colocation group", group.colocation_id));
                }
                self.colocations.insert(group.colocation_id, group);
            }
            MetadataOp::InsertPartitionRow(row) => {
                if self.partitions.contains_key(&row.table_id) {
                    return Err(MetadataError::conflict("partition row", row.table_id));
                }
                if let Some(colocation_id) = row.colocation_id
                    && !self.colocations.contains_key(&colocation_id)
                {
                    return Err(MetadataError::not_found("colocation group", colocation_id));
                }
                self.partitions.insert(row.table_id, row);
            }
            MetadataOp::InsertShardRow(shard) => {
                if self.shards.contains_key(&shard.shard_id) {
                    return Err(MetadataError::conflict("shard", shard.shard_id));
                }
                self.shards.insert(shard.shard_id, shard);
            }
        }
        Ok(())
    }
}

/// In-memory metadata store.
///
/// Setup helpers (`register_table`, `add_worker`, ...) stand in for the DDL
/// and node-management layers.
#[derive(Clone)]
pub struct InMemoryMetadataStore {
    state: Arc<Mutex<CatalogState>>,
    injected_failure: Arc<Mutex<Option<MetadataError>>>,
    replication_factor_updates: Arc<Mutex<Vec<(ColocationId, u32)>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CatalogState::new())),
            injected_failure: Arc::new(Mutex::new(None)),
            replication_factor_updates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn add_worker(&self, node: WorkerNode) {
        self.state.lock().await.workers.push(node);
    }

    pub async fn set_worker_active(&self, node: &NodeAddr, is_active: bool) {
        let mut state = self.state.lock().await;
        if let Some(worker) = state.workers.iter_mut().find(|w| &w.addr == node) {
            worker.is_active = is_active;
        }
    }

    pub async fn register_table(&self, definition: TableDefinition) {
        let mut state = self.state.lock().await;
        state.tables.insert(definition.table_id, definition);
    }

    /// Insert a colocation group with a freshly allocated id.
    pub async fn create_colocation_group(
        &self,
        shard_count: u32,
        replication_factor: u32,
        distribution_column_type: Option<String>,
    ) -> ColocationId {
        let mut state = self.state.lock().await;
        let colocation_id = state.allocate_colocation_id();
        state.colocations.insert(
            colocation_id,
            ColocationGroup {
                colocation_id,
                shard_count,
                replication_factor,
                distribution_column_type,
            },
        );
        colocation_id
    }

    pub async fn insert_partition_row(&self, row: PartitionRow) {
        self.state.lock().await.partitions.insert(row.table_id, row);
    }

    pub async fn insert_shard(&self, shard: Shard) {
        self.state.lock().await.shards.insert(shard.shard_id, shard);
    }

    /// Make the next `apply` fail without changing anything.
    pub async fn fail_next_apply(&self, error: MetadataError) {
        *self.injected_failure.lock().await = Some(error);
    }

    /// Every replication factor update, in call order.
    pub async fn replication_factor_updates(&self) -> Vec<(ColocationId, u32)> {
        self.replication_factor_updates.lock().await.clone()
    }

    pub async fn all_placements(&self) -> Vec<ShardPlacement> {
        self.state.lock().await.placements.values().cloned().collect()
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn partition_row(&self, table_id: TableId) -> Result<Option<PartitionRow>, MetadataError> {
        Ok(self.state.lock().await.partitions.get(&table_id).cloned())
    }

    async fn table_definition(&self, table_id: TableId) -> Result<TableDefinition, MetadataError> {
        self.state
            .lock()
            .await
            .tables
            .get(&table_id)
            .cloned()
            .ok_or_else(|| MetadataError::not_found("table", table_id))
    }

    async fn referencing_tables(&self, table_id: TableId) -> Result<Vec<TableId>, MetadataError> {
        let state = self.state.lock().await;
        let mut tables: Vec<TableId> = state
            .tables
            .values()
            .filter(|t| t.table_id != table_id)
            .filter(|t| t.foreign_keys.iter().any(|fk| fk.referenced_table == table_id))
            .map(|t| t.table_id)
            .collect();
        tables.sort();
        Ok(tables)
    }

    async fn reference_tables(&self) -> Result<Vec<TableId>, MetadataError> {
        let state = self.state.lock().await;
        let mut tables: Vec<TableId> = state
            .partitions
            .values()
            .filter(|p| p.method.is_reference())
            .map(|p| p.table_id)
            .collect();
        tables.sort();
        Ok(tables)
    }

    async fn shards(&self, table_id: TableId) -> Result<Vec<Shard>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state
            .shards
            .values()
            .filter(|s| s.table_id == table_id)
            .cloned()
            .collect())
    }

    async fn shard(&self, shard_id: ShardId) -> Result<Option<Shard>, MetadataError> {
        Ok(self.state.lock().await.shards.get(&shard_id).cloned())
    }

    async fn placements(&self, shard_id: ShardId) -> Result<Vec<ShardPlacement>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state
            .placements
            .values()
            .filter(|p| p.shard_id == shard_id)
            .cloned()
            .collect())
    }

    async fn insert_placement(
        &self,
        shard_id: ShardId,
        node: &NodeAddr,
        state: ShardState,
    ) -> Result<PlacementId, MetadataError> {
        let mut catalog = self.state.lock().await;
        if catalog
            .placements
            .values()
            .any(|p| p.shard_id == shard_id && &p.node == node)
        {
            return Err(MetadataError::conflict(
                "placement",
                format!("{shard_id}@{node}"),
            ));
        }
        let placement_id = catalog.allocate_placement_id();
        catalog.placements.insert(
            placement_id,
            ShardPlacement {
                placement_id,
                shard_id,
                node: node.clone(),
                state,
                shard_length: 0,
            },
        );
        Ok(placement_id)
    }

    async fn update_placement_state(
        &self,
        placement_id: PlacementId,
        state: ShardState,
    ) -> Result<(), MetadataError> {
        let mut catalog = self.state.lock().await;
        let placement = catalog
            .placements
            .get_mut(&placement_id)
            .ok_or_else(|| MetadataError::not_found("placement", placement_id))?;
        placement.state = state;
        Ok(())
    }

    async fn worker_nodes(&self) -> Result<Vec<WorkerNode>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state.workers.iter().filter(|w| w.is_active).cloned().collect())
    }

    async fn colocation_group(
        &self,
        colocation_id: ColocationId,
    ) -> Result<Option<ColocationGroup>, MetadataError> {
        Ok(self.state.lock().await.colocations.get(&colocation_id).cloned())
    }

    async fn find_colocation_group(
        &self,
        shard_count: u32,
        replication_factor: u32,
        distribution_column_type: Option<&str>,
    ) -> Result<Option<ColocationGroup>, MetadataError> {
        let state = self.state.lock().await;
        Ok(state
            .colocations
            .values()
            .find(|g| {
                g.shard_count == shard_count
                    && g.replication_factor == replication_factor
                    && g.distribution_column_type.as_deref() == distribution_column_type
            })
            .cloned())
    }

    async fn next_colocation_id(&self) -> Result<ColocationId, MetadataError> {
        Ok(self.state.lock().await.allocate_colocation_id())
    }

    async fn update_colocation_replication_factor(
        &self,
        colocation_id: ColocationId,
        replication_factor: u32,
    ) -> Result<(), MetadataError> {
        {
            let mut state = self.state.lock().await;
            let group = state
                .colocations
                .get_mut(&colocation_id)
                .ok_or_else(|| MetadataError::not_found("colocation group", colocation_id))?;
            group.replication_factor = replication_factor;
        }
        self.replication_factor_updates
            .lock()
            .await
            .push((colocation_id, replication_factor));
        Ok(())
    }

    async fn apply(&self, batch: MetadataBatch) -> Result<(), MetadataError> {
        if let Some(err) = self.injected_failure.lock().await.take() {
            return Err(err);
        }
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        for op in batch.into_ops() {
            staged.apply_op(op)?;
        }
        *state = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PartitionMethod, ReplicationModel, ShardStorage};

    fn partition(table: u64, colocation_id: Option<ColocationId>) -> PartitionRow {
        PartitionRow {
            table_id: TableId::new(table),
            method: PartitionMethod::Hash,
            distribution_column: Some("id".into()),
            colocation_id,
            replication_model: ReplicationModel::Coordinator,
        }
    }

    #[tokio::test]
    async fn failed_batch_changes_nothing() {
        let store = InMemoryMetadataStore::new();
        store.insert_partition_row(partition(1, None)).await;

        let mut batch = MetadataBatch::new();
        batch
            .push(MetadataOp::DeletePartitionRow(TableId::new(1)))
            // shard 99 does not exist: the whole batch must roll back
            .push(MetadataOp::DeleteShardRow(ShardId::new(99)));

        let err = store.apply(batch).await.unwrap_err();
        assert!(matches!(err, MetadataError::NotFound { .. }));
        assert!(store.partition_row(TableId::new(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn colocation_group_survives_while_in_use() {
        let store = InMemoryMetadataStore::new();
        let group = store.create_colocation_group(4, 2, Some("int4".into())).await;
        store.insert_partition_row(partition(1, Some(group))).await;
        store.insert_partition_row(partition(2, Some(group))).await;

        let mut batch = MetadataBatch::new();
        batch
            .push(MetadataOp::DeletePartitionRow(TableId::new(1)))
            .push(MetadataOp::DeleteColocationGroupIfEmpty(group));
        store.apply(batch).await.unwrap();
        assert!(store.colocation_group(group).await.unwrap().is_some());

        let mut batch = MetadataBatch::new();
        batch
            .push(MetadataOp::DeletePartitionRow(TableId::new(2)))
            .push(MetadataOp::DeleteColocationGroupIfEmpty(group));
        store.apply(batch).await.unwrap();
        assert!(store.colocation_group(group).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let store = InMemoryMetadataStore::new();
        store
            .fail_next_apply(MetadataError::Storage("disk full".into()))
            .await;

        let mut batch = MetadataBatch::new();
        batch.push(MetadataOp::InsertShardRow(Shard::unbounded(
            ShardId::new(1),
            TableId::new(1),
            ShardStorage::Table,
        )));
        assert!(store.apply(batch.clone()).await.is_err());
        store.apply(batch).await.unwrap();
        assert!(store.shard(ShardId::new(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_placement_is_a_conflict() {
        let store = InMemoryMetadataStore::new();
        let node = NodeAddr::new("w1", 5432);
        store
            .insert_placement(ShardId::new(1), &node, ShardState::Finalized)
            .await
            .unwrap();
        let err = store
            .insert_placement(ShardId::new(1), &node, ShardState::Finalized)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Conflict { .. }));
    }

    #[tokio::test]
    async fn inactive_workers_are_not_listed() {
        let store = InMemoryMetadataStore::new();
        store.add_worker(WorkerNode::new("w1", 5432)).await;
        store.add_worker(WorkerNode::new("w2", 5432)).await;
        store
            .set_worker_active(&NodeAddr::new("w2", 5432), false)
            .await;

        let workers = store.worker_nodes().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].addr, NodeAddr::new("w1", 5432));
    }
}
