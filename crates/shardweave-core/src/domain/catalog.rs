//! Catalog rows: the logical layout of the placement metadata store.
//!
//! - placement rows keyed by (shard, node name, node port)
//! - shard rows keyed by shard id
//! - colocation rows keyed by colocation id
//! - partition rows keyed by table id

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{ColocationId, PlacementId, ShardId, TableId};

/// Address of a worker node.
///
/// Ordering is (name, port), which is the dispatch order used everywhere
/// a fan-out must be reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub name: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl PartialOrd for NodeAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// A registered execution target. Read-only for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub addr: NodeAddr,
    pub is_active: bool,
}

impl WorkerNode {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            addr: NodeAddr::new(name, port),
            is_active: true,
        }
    }
}

/// Health state of a shard placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    /// Healthy and queryable.
    Finalized,

    /// Placement row exists but the copy has not committed yet.
    BeingCreated,

    /// Replica missed writes and must be repaired before use.
    Inactive,

    /// Scheduled for removal.
    ToDelete,
}

impl ShardState {
    pub fn is_healthy(self) -> bool {
        self == ShardState::Finalized
    }
}

/// A physical copy of a shard on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub placement_id: PlacementId,
    pub shard_id: ShardId,
    pub node: NodeAddr,
    pub state: ShardState,
    pub shard_length: u64,
}

impl ShardPlacement {
    pub fn finalized(placement_id: PlacementId, shard_id: ShardId, node: NodeAddr) -> Self {
        Self {
            placement_id,
            shard_id,
            node,
            state: ShardState::Finalized,
            shard_length: 0,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }
}

/// How a table's rows are spread over shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMethod {
    Append,
    Range,
    Hash,
    /// Not partitioned: one shard replicated to every worker (reference table).
    None,
}

impl PartitionMethod {
    pub fn is_reference(self) -> bool {
        self == PartitionMethod::None
    }
}

/// Replication model recorded on a partition row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationModel {
    /// Statement-based replication to every placement.
    Coordinator,
    /// Writes to every placement committed with two-phase commit.
    TwoPhaseCommit,
}

/// Partition row: the distribution of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRow {
    pub table_id: TableId,
    pub method: PartitionMethod,
    /// `None` for reference tables.
    pub distribution_column: Option<String>,
    pub colocation_id: Option<ColocationId>,
    pub replication_model: ReplicationModel,
}

/// Storage type of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStorage {
    Table,
    Foreign,
    Columnar,
}

/// Shard row: a horizontal partition of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: ShardId,
    pub table_id: TableId,
    pub storage: ShardStorage,
    /// Only meaningful for range/hash-partitioned tables.
    pub min_value: Option<String>,
    pub max_value: Option<String>,
}

impl Shard {
    /// A shard without partition bounds, as reference tables use.
    pub fn unbounded(shard_id: ShardId, table_id: TableId, storage: ShardStorage) -> Self {
        Self {
            shard_id,
            table_id,
            storage,
            min_value: None,
            max_value: None,
        }
    }

    /// Name of the physical shard relation on a worker: `<table>_<shard id>`.
    pub fn relation_name(&self, table_name: &str) -> String {
        format!("{}_{}", table_name, self.shard_id.get())
    }
}

/// Colocation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColocationGroup {
    pub colocation_id: ColocationId,
    pub shard_count: u32,
    pub replication_factor: u32,
    /// `None` when the group has no distribution column (reference tables).
    pub distribution_column_type: Option<String>,
}

/// Static description of a table, owned by the DDL layer.
///
/// `ddl` holds the commands that create one shard relation; `{shard}` is
/// replaced with the shard relation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    pub table_id: TableId,
    pub name: String,
    pub owner: String,
    pub ddl: Vec<String>,
    /// Foreign keys declared on this table.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

/// A foreign key constraint between two distributed tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub referenced_table: TableId,
}
