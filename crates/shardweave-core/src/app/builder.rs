//! CoordinatorBuilder - コンポーネントの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）: 必須のコラボレータが欠けていれば
//!   `build()` が `BuildError` を返す

use std::sync::Arc;

use super::executor::DistributedExecutor;
use super::locks::ResourceLocks;
use super::replicator::ReferenceTableReplicator;
use super::scope::ExecutionScope;
use super::truncate::{TruncateOutcome, TruncatePropagator};
use crate::config::CoordinatorConfig;
use crate::domain::{
    CoordinatorError, DefaultDecider, FleetSyncReport, Job, ReplicationReport, ShardId, TableId,
};
use crate::impls::BoundedTaskScheduler;
use crate::merge::RowStream;
use crate::ports::{MetadataStore, TaskScheduler, WorkerClient};

/// CoordinatorBuilder は Coordinator を構築
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new(config)
///     .worker_client(Arc::new(fleet))
///     .metadata_store(Arc::new(store))
///     .build()?;
/// ```
///
/// scheduler を渡さなければ config から `BoundedTaskScheduler` を作ります。
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    workers: Option<Arc<dyn WorkerClient>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing collaborator: {0}. It must be provided before build().")]
    MissingCollaborator(&'static str),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            workers: None,
            metadata: None,
            scheduler: None,
        }
    }

    pub fn worker_client(mut self, workers: Arc<dyn WorkerClient>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn metadata_store(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<Coordinator, BuildError> {
        self.config.validate()?;
        let workers = self
            .workers
            .ok_or(BuildError::MissingCollaborator("worker client"))?;
        let metadata = self
            .metadata
            .ok_or(BuildError::MissingCollaborator("metadata store"))?;
        let scheduler = self.scheduler.unwrap_or_else(|| {
            let executor = &self.config.executor;
            Arc::new(BoundedTaskScheduler::new(
                executor.max_concurrent_tasks,
                Arc::new(DefaultDecider::new(executor.task_retry.policy())),
            ))
        });
        let locks = Arc::new(ResourceLocks::new());

        Ok(Coordinator {
            executor: DistributedExecutor::new(
                Arc::clone(&workers),
                Arc::clone(&metadata),
                scheduler,
            ),
            replicator: ReferenceTableReplicator::new(
                Arc::clone(&workers),
                Arc::clone(&metadata),
                Arc::clone(&locks),
            ),
            truncate: TruncatePropagator::new(
                workers,
                metadata,
                locks,
                self.config.ddl.enable_propagation,
            ),
            config: self.config,
        })
    }
}

/// Entry points exposed to the SQL execution layer.
pub struct Coordinator {
    config: CoordinatorConfig,
    executor: DistributedExecutor,
    replicator: ReferenceTableReplicator,
    truncate: TruncatePropagator,
}

impl Coordinator {
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// A fresh scope whose job directories live under the configured spool dir.
    pub fn scope(&self) -> ExecutionScope {
        ExecutionScope::new(&self.config.spool.dir)
    }

    pub async fn execute_job(
        &self,
        scope: &ExecutionScope,
        job: Job,
    ) -> Result<RowStream, CoordinatorError> {
        self.executor.execute_job(scope, job).await
    }

    pub async fn promote_to_reference_table(
        &self,
        scope: &ExecutionScope,
        table_id: TableId,
    ) -> Result<ReplicationReport, CoordinatorError> {
        self.replicator.promote_to_reference(scope, table_id).await
    }

    pub async fn replicate_all_reference_tables(
        &self,
        scope: &ExecutionScope,
    ) -> Result<FleetSyncReport, CoordinatorError> {
        self.replicator.replicate_all_reference_tables(scope).await
    }

    pub async fn replicate_shard_to_all_workers(
        &self,
        scope: &ExecutionScope,
        shard_id: ShardId,
    ) -> Result<ReplicationReport, CoordinatorError> {
        self.replicator
            .replicate_shard_to_all_workers(scope, shard_id)
            .await
    }

    pub async fn truncate(
        &self,
        scope: &ExecutionScope,
        table_id: TableId,
    ) -> Result<TruncateOutcome, CoordinatorError> {
        self.truncate.truncate(scope, table_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{InMemoryFleet, InMemoryMetadataStore};

    #[test]
    fn build_success() {
        let coordinator = CoordinatorBuilder::new(CoordinatorConfig::default())
            .worker_client(Arc::new(InMemoryFleet::new()))
            .metadata_store(Arc::new(InMemoryMetadataStore::new()))
            .build();
        assert!(coordinator.is_ok());
    }

    #[test]
    fn build_missing_worker_client() {
        let coordinator = CoordinatorBuilder::new(CoordinatorConfig::default())
            .metadata_store(Arc::new(InMemoryMetadataStore::new()))
            .build();
        assert!(matches!(
            coordinator,
            Err(BuildError::MissingCollaborator("worker client"))
        ));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = CoordinatorConfig::default();
        config.executor.max_concurrent_tasks = 0;
        let coordinator = CoordinatorBuilder::new(config)
            .worker_client(Arc::new(InMemoryFleet::new()))
            .metadata_store(Arc::new(InMemoryMetadataStore::new()))
            .build();
        assert!(matches!(coordinator, Err(BuildError::Config(_))));
    }
}
