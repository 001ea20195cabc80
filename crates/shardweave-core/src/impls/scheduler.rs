//! BoundedTaskScheduler - managed 実行用の scheduler
//!
//! - `Semaphore` で同時に走るタスク数を制限
//! - ラウンドが `Exhausted` で終わったら `Decider` に次の行動を聞く
//! - `Aborted`（キャンセル、spool 書き込み失敗）はリトライしない

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::domain::{AttemptLog, CoordinatorError, Decider, Decision, JobId, Task, TaskId};
use crate::ports::{RoundError, TaskReport, TaskRunner, TaskScheduler};

pub struct BoundedTaskScheduler {
    permits: Arc<Semaphore>,
    decider: Arc<dyn Decider>,
}

impl BoundedTaskScheduler {
    pub fn new(max_concurrent_tasks: usize, decider: Arc<dyn Decider>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            decider,
        }
    }
}

#[async_trait]
impl TaskScheduler for BoundedTaskScheduler {
    async fn run_all(&self, tasks: Vec<Task>, runner: Arc<dyn TaskRunner>) -> Vec<TaskReport> {
        let mut set = JoinSet::new();
        let ids: Vec<(JobId, TaskId)> = tasks.iter().map(|t| (t.job_id, t.task_id)).collect();

        for (index, task) in tasks.into_iter().enumerate() {
            let permits = Arc::clone(&self.permits);
            let decider = Arc::clone(&self.decider);
            let runner = Arc::clone(&runner);
            set.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                (index, run_task(&task, runner.as_ref(), decider.as_ref()).await)
            });
        }

        let mut slots: Vec<Option<TaskReport>> = ids.iter().map(|_| None).collect();
        let mut join_failure = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => {
                    tracing::error!(error = %e, "managed task panicked");
                    join_failure = Some(e.to_string());
                }
            }
        }

        // every task gets a report; one that never produced its own fails the job
        slots
            .into_iter()
            .zip(ids)
            .map(|(slot, (job_id, task_id))| {
                slot.unwrap_or_else(|| TaskReport {
                    task_id,
                    rounds: 0,
                    result: Err(RoundError::Aborted(CoordinatorError::TaskAborted {
                        job_id,
                        task_id,
                        reason: join_failure
                            .clone()
                            .unwrap_or_else(|| "task ended without a report".to_string()),
                    })),
                })
            })
            .collect()
    }
}

async fn run_task(task: &Task, runner: &dyn TaskRunner, decider: &dyn Decider) -> TaskReport {
    let mut history = AttemptLog::new();
    let mut round = 1;

    loop {
        match runner.run_round(task, round).await {
            Ok(()) => {
                return TaskReport {
                    task_id: task.task_id,
                    rounds: round,
                    result: Ok(()),
                };
            }
            Err(RoundError::Aborted(e)) => {
                return TaskReport {
                    task_id: task.task_id,
                    rounds: round,
                    result: Err(RoundError::Aborted(e)),
                };
            }
            Err(RoundError::Exhausted(log)) => {
                let decision = decider.decide(round, &log);
                history.extend(log);
                match decision {
                    Decision::Retry { delay, reason } => {
                        tracing::warn!(task_id = %task.task_id, %reason, "retrying task");
                        tokio::time::sleep(delay).await;
                        round += 1;
                    }
                    Decision::GiveUp { reason } => {
                        tracing::warn!(task_id = %task.task_id, %reason, "giving up on task");
                        return TaskReport {
                            task_id: task.task_id,
                            rounds: round,
                            result: Err(RoundError::Exhausted(history)),
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::domain::{CandidateAttempt, DefaultDecider, NodeAddr, RetryPolicy, WorkerError};
    use ulid::Ulid;

    fn task() -> Task {
        Task::new(
            TaskId::from(Ulid::new()),
            JobId::from(Ulid::new()),
            "SELECT 1",
        )
    }

    fn exhausted(error: WorkerError) -> RoundError {
        let mut log = AttemptLog::new();
        log.push(CandidateAttempt::failed(NodeAddr::new("w1", 5432), 1, &error));
        RoundError::Exhausted(log)
    }

    /// Fails with a connection error until `succeed_on` is reached.
    struct FlakyRunner {
        succeed_on: u32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for FlakyRunner {
        async fn run_round(&self, _task: &Task, round: u32) -> Result<(), RoundError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if round >= self.succeed_on {
                Ok(())
            } else {
                Err(exhausted(WorkerError::Connection {
                    node: "w1:5432".into(),
                    reason: "refused".into(),
                }))
            }
        }
    }

    struct BrokenRunner;

    #[async_trait]
    impl TaskRunner for BrokenRunner {
        async fn run_round(&self, _task: &Task, _round: u32) -> Result<(), RoundError> {
            Err(exhausted(WorkerError::Command {
                node: "w1:5432".into(),
                reason: "syntax error".into(),
            }))
        }
    }

    struct AbortingRunner;

    #[async_trait]
    impl TaskRunner for AbortingRunner {
        async fn run_round(&self, _task: &Task, _round: u32) -> Result<(), RoundError> {
            Err(RoundError::Aborted(CoordinatorError::Cancelled))
        }
    }

    /// Panics on the task whose query is "boom".
    struct PanickingRunner;

    #[async_trait]
    impl TaskRunner for PanickingRunner {
        async fn run_round(&self, task: &Task, _round: u32) -> Result<(), RoundError> {
            if task.query == "boom" {
                panic!("runner bug");
            }
            Ok(())
        }
    }

    fn scheduler(max_attempts: u32) -> BoundedTaskScheduler {
        let policy = RetryPolicy::new(max_attempts, Duration::from_millis(1), 1.0);
        BoundedTaskScheduler::new(2, Arc::new(DefaultDecider::new(policy)))
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let runner = Arc::new(FlakyRunner {
            succeed_on: 3,
            calls: AtomicUsize::new(0),
        });
        let reports = scheduler(3).run_all(vec![task()], runner.clone()).await;

        assert!(reports[0].succeeded());
        assert_eq!(reports[0].rounds, 3);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_rounds_keep_every_attempt() {
        let runner = Arc::new(FlakyRunner {
            succeed_on: 10,
            calls: AtomicUsize::new(0),
        });
        let reports = scheduler(2).run_all(vec![task()], runner).await;

        match &reports[0].result {
            Err(RoundError::Exhausted(log)) => assert_eq!(log.len(), 2),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let reports = scheduler(5).run_all(vec![task()], Arc::new(BrokenRunner)).await;
        assert_eq!(reports[0].rounds, 1);
        assert!(!reports[0].succeeded());
    }

    #[tokio::test]
    async fn aborted_rounds_stop_immediately() {
        let reports = scheduler(5)
            .run_all(vec![task()], Arc::new(AbortingRunner))
            .await;
        assert_eq!(reports[0].rounds, 1);
        assert!(matches!(
            reports[0].result,
            Err(RoundError::Aborted(CoordinatorError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn reports_follow_task_order() {
        let tasks = vec![task(), task(), task(), task()];
        let ids: Vec<_> = tasks.iter().map(|t| t.task_id).collect();
        let runner = Arc::new(FlakyRunner {
            succeed_on: 1,
            calls: AtomicUsize::new(0),
        });

        let reports = scheduler(1).run_all(tasks, runner).await;
        let reported: Vec<_> = reports.iter().map(|r| r.task_id).collect();
        assert_eq!(reported, ids);
    }

    #[tokio::test]
    async fn panicked_task_is_reported_as_aborted() {
        let job_id = JobId::from(Ulid::new());
        let tasks = vec![
            Task::new(TaskId::from(Ulid::new()), job_id, "SELECT 1"),
            Task::new(TaskId::from(Ulid::new()), job_id, "boom"),
        ];
        let broken = tasks[1].task_id;

        let reports = scheduler(1).run_all(tasks, Arc::new(PanickingRunner)).await;

        assert_eq!(reports.len(), 2);
        assert!(reports[0].succeeded());
        assert_eq!(reports[1].task_id, broken);
        match &reports[1].result {
            Err(RoundError::Aborted(CoordinatorError::TaskAborted { task_id, .. })) => {
                assert_eq!(*task_id, broken)
            }
            other => panic!("expected an aborted report, got {other:?}"),
        }
    }
}
