//! DistributedExecutor - Job を実行して 1 本の RowStream にまとめる
//!
//! # 実行フロー
//! ```text
//! validate ─> open job spool ─> strategy で分岐
//!   ExplainOnly : 何もしない（空のストリーム）
//!   Router      : 唯一のタスクを呼び出し元でそのまま実行
//!   Immediate   : 全タスクを同時に起動、最初の成功で返る
//!   Managed     : TaskScheduler に渡す（並列度制限 + リトライ）
//! ```
//!
//! # 候補 placement の扱い
//! - (name, port) 順に試し、最初に成功したものを採用
//! - 試行の前に spool ファイルを作り直す（途中で切れた行を残さない）
//! - 全候補が失敗したら `TaskExecutionFailed`

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::scope::{ExecutionScope, JobRecords};
use crate::domain::{
    AttemptLog, CandidateAttempt, CoordinatorError, ExecutorStrategy, Job, JobId, NodeAddr, Task,
    TaskId, TaskState, WorkerError,
};
use crate::merge::{ResultMerger, RowStream, TaskCompletion};
use crate::ports::{MetadataStore, RoundError, TaskRunner, TaskScheduler, WorkerClient};

pub struct DistributedExecutor {
    workers: Arc<dyn WorkerClient>,
    metadata: Arc<dyn MetadataStore>,
    scheduler: Arc<dyn TaskScheduler>,
}

impl DistributedExecutor {
    pub fn new(
        workers: Arc<dyn WorkerClient>,
        metadata: Arc<dyn MetadataStore>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            workers,
            metadata,
            scheduler,
        }
    }

    /// Run a job and return its merged rows.
    ///
    /// The job's spool and progress record are registered with `scope`; they
    /// outlive a failed job until `scope.discard(job_id)` or the scope ends.
    pub async fn execute_job(
        &self,
        scope: &ExecutionScope,
        job: Job,
    ) -> Result<RowStream, CoordinatorError> {
        scope.check_cancelled()?;
        self.validate(&job).await?;

        let spool = scope.open_job(job.job_id).await?;
        let merger = ResultMerger::new(spool);
        scope.track(&job).await;

        tracing::info!(
            job_id = %job.job_id,
            strategy = ?job.strategy,
            tasks = job.tasks.len(),
            "executing job"
        );

        let attempts = Arc::new(CandidateRunner {
            workers: Arc::clone(&self.workers),
            merger: merger.clone(),
            cancel: scope.subscribe(),
            records: scope.job_records(),
        });

        let result = match job.strategy {
            ExecutorStrategy::ExplainOnly => Ok(merger.drain(Vec::new())),
            ExecutorStrategy::Router => self.run_router(&job, &attempts, &merger).await,
            ExecutorStrategy::Immediate => self.run_immediate(&job, attempts, &merger).await,
            ExecutorStrategy::Managed => self.run_managed(scope, &job, attempts, &merger).await,
        };

        match &result {
            Ok(_) => tracing::info!(job_id = %job.job_id, "job ready"),
            Err(CoordinatorError::Cancelled) => {
                if let Some(record) = scope.job_records().lock().await.get_mut(&job.job_id) {
                    record.mark_cancelled();
                }
                tracing::info!(job_id = %job.job_id, "job cancelled");
            }
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, kind = ?e.kind(), error = %e, "job failed")
            }
        }
        result
    }

    async fn validate(&self, job: &Job) -> Result<(), CoordinatorError> {
        let invalid = |reason: String| CoordinatorError::PlanInvalid {
            job_id: job.job_id,
            reason,
        };

        if let Some(reason) = &job.planning_error {
            return Err(invalid(reason.clone()));
        }
        if job.strategy == ExecutorStrategy::Router && job.tasks.len() != 1 {
            return Err(invalid(format!(
                "router execution needs exactly one task, got {}",
                job.tasks.len()
            )));
        }
        for task in &job.tasks {
            if task.candidates.is_empty() {
                return Err(invalid(format!("{} has no candidate placement", task.task_id)));
            }
            if let Some(shard_id) = task.shard_id {
                if self.metadata.shard(shard_id).await?.is_none() {
                    return Err(invalid(format!(
                        "{} reads {shard_id}, which no longer exists",
                        task.task_id
                    )));
                }
            }
        }
        Ok(())
    }

    async fn run_router(
        &self,
        job: &Job,
        attempts: &CandidateRunner,
        merger: &ResultMerger,
    ) -> Result<RowStream, CoordinatorError> {
        // validated: exactly one task
        let task = &job.tasks[0];
        attempts
            .run_to_completion(task)
            .await
            .map(|task_id| merger.drain(vec![task_id]))
    }

    async fn run_immediate(
        &self,
        job: &Job,
        attempts: Arc<CandidateRunner>,
        merger: &ResultMerger,
    ) -> Result<RowStream, CoordinatorError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskCompletion>();
        for task in job.tasks.iter().cloned() {
            let attempts = Arc::clone(&attempts);
            let tx = tx.clone();
            tokio::spawn(async move {
                let completion = attempts.run_to_completion(&task).await;
                // the receiver is gone once the caller dropped the stream
                let _ = tx.send(completion);
            });
        }
        drop(tx);

        match rx.recv().await {
            Some(Ok(task_id)) => Ok(merger.drain_incremental(vec![task_id], rx)),
            Some(Err(e)) => Err(e),
            None => Ok(merger.drain(Vec::new())),
        }
    }

    async fn run_managed(
        &self,
        scope: &ExecutionScope,
        job: &Job,
        attempts: Arc<CandidateRunner>,
        merger: &ResultMerger,
    ) -> Result<RowStream, CoordinatorError> {
        let reports = self
            .scheduler
            .run_all(job.tasks.clone(), Arc::clone(&attempts) as Arc<dyn TaskRunner>)
            .await;

        let mut first_error = None;
        for report in reports {
            let err = match report.result {
                Ok(()) => continue,
                Err(RoundError::Exhausted(log)) => CoordinatorError::TaskExecutionFailed {
                    job_id: job.job_id,
                    task_id: report.task_id,
                    attempts: log,
                },
                Err(RoundError::Aborted(e)) => e,
            };
            attempts.set_state(job.job_id, report.task_id, TaskState::Failed).await;
            let is_cancel = matches!(err, CoordinatorError::Cancelled);
            if first_error.is_none() || is_cancel {
                first_error = Some(err);
            }
        }

        scope.check_cancelled()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(merger.drain(job.tasks.iter().map(|t| t.task_id).collect())),
        }
    }
}

/// Failure of one candidate attempt.
enum AttemptError {
    /// The worker failed; the next candidate is tried.
    Worker(WorkerError),
    /// Cancellation or a local spool failure; the task stops.
    Local(CoordinatorError),
}

/// Tries a task's candidates in order, spooling the first successful answer.
struct CandidateRunner {
    workers: Arc<dyn WorkerClient>,
    merger: ResultMerger,
    cancel: watch::Receiver<bool>,
    records: JobRecords,
}

impl CandidateRunner {
    async fn set_state(&self, job_id: JobId, task_id: TaskId, state: TaskState) {
        if let Some(record) = self.records.lock().await.get_mut(&job_id) {
            record.set_task_state(task_id, state);
        }
    }

    /// One round, without the scheduler: router and immediate strategies.
    async fn run_to_completion(&self, task: &Task) -> TaskCompletion {
        match self.run_round(task, 1).await {
            Ok(()) => Ok(task.task_id),
            Err(RoundError::Exhausted(attempts)) => {
                self.set_state(task.job_id, task.task_id, TaskState::Failed)
                    .await;
                Err(CoordinatorError::TaskExecutionFailed {
                    job_id: task.job_id,
                    task_id: task.task_id,
                    attempts,
                })
            }
            Err(RoundError::Aborted(e)) => {
                self.set_state(task.job_id, task.task_id, TaskState::Failed)
                    .await;
                Err(e)
            }
        }
    }

    async fn stream_from(&self, node: &NodeAddr, task: &Task) -> Result<usize, AttemptError> {
        let mut cancel = self.cancel.clone();
        let mut source = tokio::select! {
            _ = cancelled(&mut cancel) => {
                return Err(AttemptError::Local(CoordinatorError::Cancelled));
            }
            source = self.workers.run_command_streaming_rows(node, &task.query) => {
                source.map_err(AttemptError::Worker)?
            }
        };

        let mut rows = 0;
        loop {
            let batch = tokio::select! {
                _ = cancelled(&mut cancel) => {
                    return Err(AttemptError::Local(CoordinatorError::Cancelled));
                }
                batch = source.next_batch() => batch.map_err(AttemptError::Worker)?,
            };
            let Some(batch) = batch else {
                return Ok(rows);
            };
            rows += batch.len();
            self.merger
                .spool(task.task_id, &batch)
                .await
                .map_err(AttemptError::Local)?;
        }
    }
}

#[async_trait]
impl TaskRunner for CandidateRunner {
    async fn run_round(&self, task: &Task, round: u32) -> Result<(), RoundError> {
        self.set_state(task.job_id, task.task_id, TaskState::Running)
            .await;

        let mut log = AttemptLog::new();
        for node in task.ordered_candidates() {
            if *self.cancel.borrow() {
                return Err(RoundError::Aborted(CoordinatorError::Cancelled));
            }
            self.merger
                .begin(task.task_id)
                .await
                .map_err(RoundError::Aborted)?;

            match self.stream_from(&node, task).await {
                Ok(rows) => {
                    tracing::debug!(task_id = %task.task_id, %node, rows, round, "task succeeded");
                    self.set_state(task.job_id, task.task_id, TaskState::Succeeded)
                        .await;
                    return Ok(());
                }
                Err(AttemptError::Worker(e)) => {
                    tracing::warn!(task_id = %task.task_id, %node, error = %e, "candidate failed");
                    log.push(CandidateAttempt::failed(node, round, &e));
                }
                Err(AttemptError::Local(e)) => return Err(RoundError::Aborted(e)),
            }
        }
        Err(RoundError::Exhausted(log))
    }
}

/// Resolves once the scope is cancelled or gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use ulid::Ulid;

    use crate::domain::{DefaultDecider, RetryPolicy, Row, ShardId};
    use crate::impls::{BoundedTaskScheduler, InMemoryFleet, InMemoryMetadataStore};

    struct Fixture {
        fleet: InMemoryFleet,
        executor: DistributedExecutor,
        scope: ExecutionScope,
        _root: TempDir,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let fleet = InMemoryFleet::new();
        let metadata = InMemoryMetadataStore::new();
        let scheduler = BoundedTaskScheduler::new(
            4,
            Arc::new(DefaultDecider::new(RetryPolicy::no_retry())),
        );
        let executor = DistributedExecutor::new(
            Arc::new(fleet.clone()),
            Arc::new(metadata),
            Arc::new(scheduler),
        );
        Fixture {
            fleet,
            executor,
            scope: ExecutionScope::new(root.path()),
            _root: root,
        }
    }

    fn node(name: &str) -> NodeAddr {
        NodeAddr::new(name, 5432)
    }

    fn job(strategy: ExecutorStrategy, queries: &[(&str, &[&str])]) -> Job {
        let job_id = JobId::from(Ulid::new());
        queries.iter().fold(Job::new(job_id, strategy), |job, (query, nodes)| {
            let task = nodes.iter().fold(
                Task::new(TaskId::from(Ulid::new()), job_id, *query),
                |task, n| task.with_candidate(node(n)),
            );
            job.with_task(task)
        })
    }

    #[tokio::test]
    async fn router_runs_single_task_in_place() {
        let f = fixture();
        f.fleet
            .respond("SELECT 1", vec![vec![Row::from_texts(["1"])]])
            .await;
        let job = job(ExecutorStrategy::Router, &[("SELECT 1", &["w1"])]);
        let job_id = job.job_id;

        let mut stream = f.executor.execute_job(&f.scope, job).await.unwrap();
        assert_eq!(stream.collect_rows().await.unwrap().len(), 1);

        let record = f.scope.job_record(job_id).await.unwrap();
        assert_eq!(record.state, crate::domain::JobState::Completed);
    }

    #[tokio::test]
    async fn router_with_two_tasks_is_rejected() {
        let f = fixture();
        let job = job(
            ExecutorStrategy::Router,
            &[("SELECT 1", &["w1"]), ("SELECT 2", &["w1"])],
        );
        let err = f.executor.execute_job(&f.scope, job).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::PlanInvalid { .. }));
        assert!(f.fleet.calls().await.is_empty());
    }

    #[tokio::test]
    async fn task_without_candidates_is_rejected() {
        let f = fixture();
        let job = job(ExecutorStrategy::Managed, &[("SELECT 1", &[])]);
        let err = f.executor.execute_job(&f.scope, job).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::PlanInvalid { .. }));
    }

    #[tokio::test]
    async fn dropped_shard_is_rejected() {
        let f = fixture();
        let mut job = job(ExecutorStrategy::Managed, &[("SELECT 1", &["w1"])]);
        job.tasks[0] = job.tasks[0].clone().with_shard(ShardId::new(404));

        let err = f.executor.execute_job(&f.scope, job).await.unwrap_err();
        assert!(err.to_string().contains("no longer exists"));
    }

    #[tokio::test]
    async fn mid_stream_failure_leaves_no_partial_rows() {
        let f = fixture();
        f.fleet
            .respond(
                "SELECT v",
                vec![vec![Row::from_texts(["a"])], vec![Row::from_texts(["b"])]],
            )
            .await;
        f.fleet.fail_mid_stream(&node("w1"), "SELECT v").await;
        let job = job(ExecutorStrategy::Router, &[("SELECT v", &["w1", "w2"])]);

        let mut stream = f.executor.execute_job(&f.scope, job).await.unwrap();
        // w1 streamed both batches before dropping; only w2's copy survives
        assert_eq!(stream.collect_rows().await.unwrap().len(), 2);
        assert_eq!(f.fleet.calls_to(&node("w2")).await.len(), 1);
    }

    #[tokio::test]
    async fn immediate_returns_before_slow_tasks_finish() {
        let f = fixture();
        f.fleet
            .respond("fast", vec![vec![Row::from_texts(["fast"])]])
            .await;
        f.fleet
            .respond("slow", vec![vec![Row::from_texts(["slow"])]])
            .await;
        f.fleet.delay("slow", Duration::from_millis(100)).await;
        let job = job(
            ExecutorStrategy::Immediate,
            &[("slow", &["w1"]), ("fast", &["w1"])],
        );

        let mut stream = f.executor.execute_job(&f.scope, job).await.unwrap();
        let first = stream.next_row().await.unwrap().unwrap();
        assert_eq!(first, Row::from_texts(["fast"]));
        let second = stream.next_row().await.unwrap().unwrap();
        assert_eq!(second, Row::from_texts(["slow"]));
        assert!(stream.next_row().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn immediate_surfaces_later_failures_from_stream() {
        let f = fixture();
        f.fleet
            .respond("ok", vec![vec![Row::from_texts(["ok"])]])
            .await;
        f.fleet.delay("missing", Duration::from_millis(50)).await;
        let job = job(
            ExecutorStrategy::Immediate,
            &[("ok", &["w1"]), ("missing", &["w1"])],
        );

        let mut stream = f.executor.execute_job(&f.scope, job).await.unwrap();
        assert!(stream.next_row().await.unwrap().is_some());
        assert!(matches!(
            stream.next_row().await,
            Err(CoordinatorError::TaskExecutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_scope_refuses_new_jobs() {
        let f = fixture();
        f.scope.cancel();
        let job = job(ExecutorStrategy::Managed, &[("SELECT 1", &["w1"])]);
        assert!(matches!(
            f.executor.execute_job(&f.scope, job).await,
            Err(CoordinatorError::Cancelled)
        ));
        assert!(f.fleet.calls().await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_task_marks_job_cancelled() {
        let f = fixture();
        f.fleet
            .respond("slow", vec![vec![Row::from_texts(["x"])]])
            .await;
        f.fleet.delay("slow", Duration::from_secs(5)).await;
        let job = job(ExecutorStrategy::Managed, &[("slow", &["w1"])]);
        let job_id = job.job_id;

        let (result, _) = tokio::join!(f.executor.execute_job(&f.scope, job), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.scope.cancel();
        });

        assert!(matches!(result, Err(CoordinatorError::Cancelled)));
        let record = f.scope.job_record(job_id).await.unwrap();
        assert_eq!(record.state, crate::domain::JobState::Cancelled);
    }

    #[tokio::test]
    async fn failed_job_can_run_again_in_the_same_scope() {
        let f = fixture();
        let job = job(ExecutorStrategy::Managed, &[("SELECT late", &["w1"])]);
        let job_id = job.job_id;

        let err = f
            .executor
            .execute_job(&f.scope, job.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::TaskExecutionFailed { .. }));

        f.fleet
            .respond("SELECT late", vec![vec![Row::from_texts(["now"])]])
            .await;
        let mut stream = f.executor.execute_job(&f.scope, job).await.unwrap();
        assert_eq!(
            stream.collect_rows().await.unwrap(),
            vec![Row::from_texts(["now"])]
        );
        let record = f.scope.job_record(job_id).await.unwrap();
        assert_eq!(record.state, crate::domain::JobState::Completed);
    }
}
