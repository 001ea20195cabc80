//! Replication reports.
//!
//! Per-worker copy failures are isolated: they end up here instead of
//! aborting copies that already committed on other workers.

use serde::{Deserialize, Serialize};

use super::catalog::NodeAddr;
use super::ids::{ShardId, TableId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCopyFailure {
    pub node: NodeAddr,
    pub error: String,
}

/// Outcome of replicating one shard to the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationReport {
    pub shard_id: ShardId,
    pub source: NodeAddr,

    /// Workers that received a copy and now hold a finalized placement.
    pub copied: Vec<NodeAddr>,

    /// Workers that already held a finalized placement.
    pub skipped: Vec<NodeAddr>,

    pub failed: Vec<WorkerCopyFailure>,
}

impl ReplicationReport {
    pub fn new(shard_id: ShardId, source: NodeAddr) -> Self {
        Self {
            shard_id,
            source,
            copied: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of workers a copy was attempted on.
    pub fn attempted(&self) -> usize {
        self.copied.len() + self.failed.len()
    }
}

/// Outcome of replicating every reference table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSyncReport {
    pub tables: Vec<(TableId, ReplicationReport)>,

    /// Replication factor written to the reference colocation group, if any.
    pub replication_factor: Option<u32>,
}

impl FleetSyncReport {
    pub fn copies(&self) -> usize {
        self.tables.iter().map(|(_, r)| r.copied.len()).sum()
    }

    pub fn failures(&self) -> usize {
        self.tables.iter().map(|(_, r)| r.failed.len()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failures() == 0
    }
}
