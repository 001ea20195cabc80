//! MetadataStore port - placement metadata の正本（source of truth）
//!
//! MetadataStore は以下を管理します：
//! - partition rows（table の分散方式と colocation group）
//! - shard rows / placement rows
//! - colocation groups
//! - worker node 一覧（読み取りのみ）
//!
//! # 設計原則
//! - 複数行にまたがる書き換えは `MetadataBatch` にまとめて `apply` する
//! - `apply` は全件成功か全件失敗（トランザクション）
//! - 単一行の placement 更新だけは個別メソッドで行う

use async_trait::async_trait;

use crate::domain::{
    ColocationGroup, ColocationId, MetadataError, NodeAddr, PartitionRow, PlacementId, Shard,
    ShardId, ShardPlacement, ShardState, TableDefinition, TableId, WorkerNode,
};

/// A single row mutation inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataOp {
    DeletePartitionRow(TableId),
    /// No-op when some table still belongs to the group.
    DeleteColocationGroupIfEmpty(ColocationId),
    DeleteShardRow(ShardId),
    DeletePlacementRow(PlacementId),
    InsertColocationGroup(ColocationGroup),
    InsertPartitionRow(PartitionRow),
    InsertShardRow(Shard),
}

/// Row mutations applied as one transaction, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataBatch {
    ops: Vec<MetadataOp>,
}

impl MetadataBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: MetadataOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn ops(&self) -> &[MetadataOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<MetadataOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// `None` when the table is not distributed.
    async fn partition_row(&self, table_id: TableId) -> Result<Option<PartitionRow>, MetadataError>;

    async fn table_definition(&self, table_id: TableId) -> Result<TableDefinition, MetadataError>;

    /// Tables whose foreign keys reference `table_id`.
    async fn referencing_tables(&self, table_id: TableId) -> Result<Vec<TableId>, MetadataError>;

    /// Every table distributed with `PartitionMethod::None`.
    async fn reference_tables(&self) -> Result<Vec<TableId>, MetadataError>;

    /// Shards of a table, ordered by shard id.
    async fn shards(&self, table_id: TableId) -> Result<Vec<Shard>, MetadataError>;

    async fn shard(&self, shard_id: ShardId) -> Result<Option<Shard>, MetadataError>;

    async fn placements(&self, shard_id: ShardId) -> Result<Vec<ShardPlacement>, MetadataError>;

    async fn insert_placement(
        &self,
        shard_id: ShardId,
        node: &NodeAddr,
        state: ShardState,
    ) -> Result<PlacementId, MetadataError>;

    async fn update_placement_state(
        &self,
        placement_id: PlacementId,
        state: ShardState,
    ) -> Result<(), MetadataError>;

    /// Active worker nodes, in no particular order.
    async fn worker_nodes(&self) -> Result<Vec<WorkerNode>, MetadataError>;

    async fn colocation_group(
        &self,
        colocation_id: ColocationId,
    ) -> Result<Option<ColocationGroup>, MetadataError>;

    async fn find_colocation_group(
        &self,
        shard_count: u32,
        replication_factor: u32,
        distribution_column_type: Option<&str>,
    ) -> Result<Option<ColocationGroup>, MetadataError>;

    /// Reserve a fresh colocation id (the row is inserted through a batch).
    async fn next_colocation_id(&self) -> Result<ColocationId, MetadataError>;

    async fn update_colocation_replication_factor(
        &self,
        colocation_id: ColocationId,
        replication_factor: u32,
    ) -> Result<(), MetadataError>;

    /// Apply every op or none.
    async fn apply(&self, batch: MetadataBatch) -> Result<(), MetadataError>;
}
