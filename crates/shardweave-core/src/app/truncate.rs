//! TruncatePropagator - 分散テーブルの TRUNCATE を shard に伝播
//!
//! - DDL 伝播が無効なら何もしない
//! - append 分散: 全 shard を drop し、shard / placement 行を消す
//! - それ以外（hash, range, reference）: 全 FINALIZED placement に
//!   `TRUNCATE TABLE <shard> CASCADE`

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::locks::ResourceLocks;
use super::scope::ExecutionScope;
use crate::domain::{
    CoordinatorError, PartitionMethod, PreconditionRule, ShardState, TableDefinition, TableId,
    WorkerCopyFailure,
};
use crate::ports::{MetadataBatch, MetadataOp, MetadataStore, WorkerClient};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TruncateOutcome {
    /// DDL propagation is disabled; nothing was sent.
    Skipped,

    /// Append-distributed table: its shards were dropped.
    ShardsDropped {
        shards: usize,
        /// Placements that could not be dropped; left marked `ToDelete`.
        failed: Vec<WorkerCopyFailure>,
    },

    /// Every finalized placement was truncated.
    Truncated {
        placements: usize,
        failed: Vec<WorkerCopyFailure>,
    },
}

pub struct TruncatePropagator {
    workers: Arc<dyn WorkerClient>,
    metadata: Arc<dyn MetadataStore>,
    locks: Arc<ResourceLocks>,
    enable_propagation: bool,
}

impl TruncatePropagator {
    pub fn new(
        workers: Arc<dyn WorkerClient>,
        metadata: Arc<dyn MetadataStore>,
        locks: Arc<ResourceLocks>,
        enable_propagation: bool,
    ) -> Self {
        Self {
            workers,
            metadata,
            locks,
            enable_propagation,
        }
    }

    pub async fn truncate(
        &self,
        scope: &ExecutionScope,
        table_id: TableId,
    ) -> Result<TruncateOutcome, CoordinatorError> {
        scope.check_cancelled()?;
        let definition = self.metadata.table_definition(table_id).await?;
        let Some(partition) = self.metadata.partition_row(table_id).await? else {
            return Err(CoordinatorError::precondition(
                "truncate",
                definition.name,
                PreconditionRule::NotDistributed,
            ));
        };
        if !self.enable_propagation {
            tracing::debug!(table = %definition.name, "ddl propagation disabled, truncate not sent");
            return Ok(TruncateOutcome::Skipped);
        }

        let outcome = if partition.method == PartitionMethod::Append {
            self.drop_all_shards(scope, &definition).await?
        } else {
            self.truncate_shards(scope, &definition).await?
        };
        tracing::info!(table = %definition.name, ?outcome, "truncate propagated");
        Ok(outcome)
    }

    async fn drop_all_shards(
        &self,
        scope: &ExecutionScope,
        definition: &TableDefinition,
    ) -> Result<TruncateOutcome, CoordinatorError> {
        let shards = self.metadata.shards(definition.table_id).await?;
        let mut failed = Vec::new();

        for shard in &shards {
            scope.check_cancelled()?;
            let _lock = self.locks.lock_shard_for_rewrite(shard.shard_id).await;
            let command = format!(
                "DROP TABLE IF EXISTS {} CASCADE",
                shard.relation_name(&definition.name)
            );

            let mut batch = MetadataBatch::new();
            let mut all_dropped = true;
            for placement in self.metadata.placements(shard.shard_id).await? {
                match self
                    .workers
                    .run_command(&placement.node, &definition.owner, &command)
                    .await
                {
                    Ok(()) => {
                        batch.push(MetadataOp::DeletePlacementRow(placement.placement_id));
                    }
                    Err(e) => {
                        tracing::warn!(node = %placement.node, error = %e, "could not drop shard placement");
                        all_dropped = false;
                        self.metadata
                            .update_placement_state(placement.placement_id, ShardState::ToDelete)
                            .await?;
                        failed.push(WorkerCopyFailure {
                            node: placement.node,
                            error: e.to_string(),
                        });
                    }
                }
            }
            if all_dropped {
                batch.push(MetadataOp::DeleteShardRow(shard.shard_id));
            }
            if !batch.is_empty() {
                self.metadata.apply(batch).await?;
            }
        }

        Ok(TruncateOutcome::ShardsDropped {
            shards: shards.len(),
            failed,
        })
    }

    async fn truncate_shards(
        &self,
        scope: &ExecutionScope,
        definition: &TableDefinition,
    ) -> Result<TruncateOutcome, CoordinatorError> {
        let mut placements = 0;
        let mut failed = Vec::new();

        for shard in self.metadata.shards(definition.table_id).await? {
            scope.check_cancelled()?;
            let _resource = self.locks.shard_resource_exclusive(shard.shard_id).await;
            let command = format!(
                "TRUNCATE TABLE {} CASCADE",
                shard.relation_name(&definition.name)
            );

            for placement in self.metadata.placements(shard.shard_id).await? {
                if !placement.is_healthy() {
                    continue;
                }
                match self
                    .workers
                    .run_command(&placement.node, &definition.owner, &command)
                    .await
                {
                    Ok(()) => placements += 1,
                    Err(e) => failed.push(WorkerCopyFailure {
                        node: placement.node,
                        error: e.to_string(),
                    }),
                }
            }
        }

        Ok(TruncateOutcome::Truncated { placements, failed })
    }
}
