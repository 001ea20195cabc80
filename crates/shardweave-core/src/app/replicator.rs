//! ReferenceTableReplicator - reference table の全 worker への複製
//!
//! # 操作
//! - `promote_to_reference`: 1 shard の分散テーブルを reference table に格上げ
//! - `replicate_all_reference_tables`: ノード追加後などに全 reference table を同期
//! - `replicate_shard_to_all_workers`: 1 shard を healthy な placement がない worker へ
//!
//! # 複製の流れ（shard 単位）
//! ```text
//! healthy な source を選ぶ ─> コピー用コマンド列を 1 回だけ作る
//!   └─ worker を (name, port) 順に:
//!        FINALIZED あり -> skip
//!        なし           -> worker ローカルのトランザクションでコピー
//!                          成功したら placement を FINALIZED に
//! ```
//!
//! worker ごとのトランザクションは独立。1 台の失敗で他の worker の commit は
//! 巻き戻らず、`ReplicationReport.failed` に記録されます。
//!
//! 内部のコピー処理はロックを取りません。ロックは公開操作が `ResourceLocks`
//! の順序どおりに取ります。

use std::sync::Arc;

use super::locks::ResourceLocks;
use super::scope::ExecutionScope;
use crate::domain::{
    ColocationGroup, ColocationId, CoordinatorError, FleetSyncReport, MetadataError, NodeAddr,
    PartitionMethod, PartitionRow, PreconditionRule, ReplicationModel, ReplicationReport, Shard,
    ShardId, ShardState, TableDefinition, TableId, WorkerCopyFailure,
};
use crate::ports::{MetadataBatch, MetadataOp, MetadataStore, WorkerClient};

const PROMOTE: &str = "upgrade to reference table";

pub struct ReferenceTableReplicator {
    workers: Arc<dyn WorkerClient>,
    metadata: Arc<dyn MetadataStore>,
    locks: Arc<ResourceLocks>,
}

impl ReferenceTableReplicator {
    pub fn new(
        workers: Arc<dyn WorkerClient>,
        metadata: Arc<dyn MetadataStore>,
        locks: Arc<ResourceLocks>,
    ) -> Self {
        Self {
            workers,
            metadata,
            locks,
        }
    }

    /// Turn a single-shard distributed table into a reference table.
    ///
    /// Fails before any change if a precondition does not hold. Copies that
    /// committed before a later failure stay in place; re-running skips them.
    pub async fn promote_to_reference(
        &self,
        scope: &ExecutionScope,
        table_id: TableId,
    ) -> Result<ReplicationReport, CoordinatorError> {
        scope.check_cancelled()?;
        let definition = self.metadata.table_definition(table_id).await?;
        let candidate = self.check_promotable(&definition).await?;

        let _nodes = self.locks.node_registry_shared().await;
        let _shard_lock = self.locks.lock_shard_for_rewrite(candidate.shard_id).await;
        // another promotion may have committed while we waited for the locks
        let shard = self.check_promotable(&definition).await?;

        let report = self.replicate_shard(scope, &definition, &shard).await?;
        if !report.is_complete() {
            return Err(CoordinatorError::ReplicationIncomplete {
                shard_id: shard.shard_id,
                attempted: report.attempted(),
                failed: report.failed.len(),
            });
        }
        scope.check_cancelled()?;

        self.convert_to_reference_metadata(&definition, &shard)
            .await
            .map_err(|source| CoordinatorError::MetadataInconsistent { table_id, source })?;

        tracing::info!(table = %definition.name, shard_id = %shard.shard_id, "upgraded to reference table");
        Ok(report)
    }

    /// Copy every reference table to the workers missing it, then set the
    /// reference colocation group's replication factor to the worker count.
    pub async fn replicate_all_reference_tables(
        &self,
        scope: &ExecutionScope,
    ) -> Result<FleetSyncReport, CoordinatorError> {
        scope.check_cancelled()?;
        let _nodes = self.locks.node_registry_shared().await;

        let worker_count = self.metadata.worker_nodes().await?.len() as u32;
        let mut report = FleetSyncReport::default();
        let mut colocation_id = None;

        for table_id in self.metadata.reference_tables().await? {
            scope.check_cancelled()?;
            let definition = self.metadata.table_definition(table_id).await?;
            let shards = self.metadata.shards(table_id).await?;
            let Some(shard) = shards.first() else {
                tracing::warn!(table = %definition.name, "reference table has no shard");
                continue;
            };

            let _metadata_lock = self.locks.shard_metadata_exclusive(shard.shard_id).await;
            let shard_report = self.replicate_shard(scope, &definition, shard).await?;
            report.tables.push((table_id, shard_report));

            if colocation_id.is_none() {
                colocation_id = self
                    .metadata
                    .partition_row(table_id)
                    .await?
                    .and_then(|row| row.colocation_id);
            }
        }

        match colocation_id {
            Some(colocation_id) if report.is_complete() => {
                self.metadata
                    .update_colocation_replication_factor(colocation_id, worker_count)
                    .await?;
                report.replication_factor = Some(worker_count);
            }
            Some(_) => tracing::warn!(
                failures = report.failures(),
                "replication factor left unchanged after failed copies"
            ),
            None => {}
        }

        tracing::info!(
            tables = report.tables.len(),
            copies = report.copies(),
            failures = report.failures(),
            "reference tables synced"
        );
        Ok(report)
    }

    /// Copy one shard to every active worker lacking a finalized placement.
    pub async fn replicate_shard_to_all_workers(
        &self,
        scope: &ExecutionScope,
        shard_id: ShardId,
    ) -> Result<ReplicationReport, CoordinatorError> {
        scope.check_cancelled()?;
        let shard = self
            .metadata
            .shard(shard_id)
            .await?
            .ok_or_else(|| MetadataError::not_found("shard", shard_id))?;
        let definition = self.metadata.table_definition(shard.table_id).await?;

        let _nodes = self.locks.node_registry_shared().await;
        let _shard_lock = self.locks.lock_shard_for_rewrite(shard_id).await;
        self.replicate_shard(scope, &definition, &shard).await
    }

    /// Id of the single reference colocation group, created when missing.
    pub async fn reference_colocation_id(&self) -> Result<ColocationId, CoordinatorError> {
        let _nodes = self.locks.node_registry_shared().await;
        let mut batch = MetadataBatch::new();
        let colocation_id = self.plan_reference_colocation(&mut batch).await?;
        if !batch.is_empty() {
            self.metadata.apply(batch).await?;
        }
        Ok(colocation_id)
    }

    async fn check_promotable(
        &self,
        definition: &TableDefinition,
    ) -> Result<Shard, CoordinatorError> {
        let relation = definition.name.as_str();
        let Some(partition) = self.metadata.partition_row(definition.table_id).await? else {
            return Err(CoordinatorError::PreconditionFailed {
                operation: PROMOTE,
                relation: relation.to_string(),
                rule: PreconditionRule::NotDistributed,
                hint: Some(format!("use create_reference_table('{relation}')")),
            });
        };
        if partition.method.is_reference() {
            return Err(CoordinatorError::precondition(
                PROMOTE,
                relation,
                PreconditionRule::AlreadyReference,
            ));
        }

        let mut shards = self.metadata.shards(definition.table_id).await?;
        if shards.len() != 1 {
            return Err(CoordinatorError::precondition(
                PROMOTE,
                relation,
                PreconditionRule::ShardCountNotOne {
                    count: shards.len(),
                },
            ));
        }

        if !definition.foreign_keys.is_empty() {
            return Err(CoordinatorError::precondition(
                PROMOTE,
                relation,
                PreconditionRule::PartOfForeignKey,
            ));
        }
        if !self
            .metadata
            .referencing_tables(definition.table_id)
            .await?
            .is_empty()
        {
            return Err(CoordinatorError::precondition(
                PROMOTE,
                relation,
                PreconditionRule::ReferencedByForeignKey,
            ));
        }

        Ok(shards.remove(0))
    }

    /// Per-worker copy loop. Callers hold the locks.
    async fn replicate_shard(
        &self,
        scope: &ExecutionScope,
        definition: &TableDefinition,
        shard: &Shard,
    ) -> Result<ReplicationReport, CoordinatorError> {
        let placements = self.metadata.placements(shard.shard_id).await?;
        let source = placements
            .iter()
            .filter(|p| p.is_healthy())
            .map(|p| p.node.clone())
            .min()
            .ok_or(CoordinatorError::NoHealthySource {
                shard_id: shard.shard_id,
            })?;
        let commands = copy_shard_commands(definition, shard, &source);

        let mut workers: Vec<NodeAddr> = self
            .metadata
            .worker_nodes()
            .await?
            .into_iter()
            .map(|w| w.addr)
            .collect();
        workers.sort();

        let mut report = ReplicationReport::new(shard.shard_id, source);
        for node in workers {
            let existing = placements.iter().find(|p| p.node == node);
            if existing.is_some_and(|p| p.state == ShardState::Finalized) {
                report.skipped.push(node);
                continue;
            }
            scope.check_cancelled()?;

            tracing::info!(
                "Replicating reference table \"{}\" to worker {}...",
                definition.name,
                node
            );
            if let Err(e) = self
                .workers
                .run_commands_in_transaction(&node, &definition.owner, &commands)
                .await
            {
                tracing::warn!(%node, shard_id = %shard.shard_id, error = %e, "shard copy failed");
                report.failed.push(WorkerCopyFailure {
                    node,
                    error: e.to_string(),
                });
                continue;
            }

            // the worker committed; only now may the placement become finalized
            match existing {
                Some(placement) => {
                    self.metadata
                        .update_placement_state(placement.placement_id, ShardState::Finalized)
                        .await?
                }
                None => {
                    self.metadata
                        .insert_placement(shard.shard_id, &node, ShardState::Finalized)
                        .await?;
                }
            }
            report.copied.push(node);
        }
        Ok(report)
    }

    /// One batch: old partition/colocation/shard rows out, reference rows in.
    async fn convert_to_reference_metadata(
        &self,
        definition: &TableDefinition,
        shard: &Shard,
    ) -> Result<(), MetadataError> {
        let table_id = definition.table_id;
        let old_colocation = self
            .metadata
            .partition_row(table_id)
            .await?
            .and_then(|row| row.colocation_id);

        let mut batch = MetadataBatch::new();
        let reference_colocation = self.plan_reference_colocation(&mut batch).await?;

        let mut rewrite = MetadataBatch::new();
        rewrite.push(MetadataOp::DeletePartitionRow(table_id));
        if let Some(old) = old_colocation.filter(|old| *old != reference_colocation) {
            rewrite.push(MetadataOp::DeleteColocationGroupIfEmpty(old));
        }
        rewrite.push(MetadataOp::DeleteShardRow(shard.shard_id));
        for op in batch.into_ops() {
            rewrite.push(op);
        }
        rewrite
            .push(MetadataOp::InsertPartitionRow(PartitionRow {
                table_id,
                method: PartitionMethod::None,
                distribution_column: None,
                colocation_id: Some(reference_colocation),
                replication_model: ReplicationModel::TwoPhaseCommit,
            }))
            .push(MetadataOp::InsertShardRow(Shard::unbounded(
                shard.shard_id,
                table_id,
                shard.storage,
            )));

        self.metadata.apply(rewrite).await
    }

    /// Find the reference colocation group, or queue its creation in `batch`.
    async fn plan_reference_colocation(
        &self,
        batch: &mut MetadataBatch,
    ) -> Result<ColocationId, MetadataError> {
        let replication_factor = self.metadata.worker_nodes().await?.len() as u32;
        if let Some(group) = self
            .metadata
            .find_colocation_group(1, replication_factor, None)
            .await?
        {
            return Ok(group.colocation_id);
        }

        let colocation_id = self.metadata.next_colocation_id().await?;
        batch.push(MetadataOp::InsertColocationGroup(ColocationGroup {
            colocation_id,
            shard_count: 1,
            replication_factor,
            distribution_column_type: None,
        }));
        Ok(colocation_id)
    }
}

/// Commands that rebuild `shard` on a worker from `source`.
fn copy_shard_commands(definition: &TableDefinition, shard: &Shard, source: &NodeAddr) -> Vec<String> {
    let shard_name = shard.relation_name(&definition.name);
    let mut commands: Vec<String> = definition
        .ddl
        .iter()
        .map(|ddl| ddl.replace("{shard}", &shard_name))
        .collect();
    commands.push(format!(
        "SELECT worker_append_table_to_shard('{shard_name}', '{shard_name}', '{}', {})",
        source.name, source.port
    ));
    commands
}
