//! TaskScheduler port - managed 実行のスケジューリング層
//!
//! 並列度の制限とラウンド単位のリトライは scheduler の責務。
//! 1 ラウンド（候補 placement を順に試す）の中身は executor が `TaskRunner`
//! として渡します。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{AttemptLog, CoordinatorError, Task, TaskId};

/// Why a round did not succeed.
#[derive(Debug)]
pub enum RoundError {
    /// Every candidate failed; the scheduler may run another round.
    Exhausted(AttemptLog),

    /// Cancellation or a local failure; never retried.
    Aborted(CoordinatorError),
}

/// Runs one round of a task: every candidate in order until one succeeds.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_round(&self, task: &Task, round: u32) -> Result<(), RoundError>;
}

/// Final result of a task after the scheduler is done with it.
#[derive(Debug)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub rounds: u32,
    /// On exhaustion, the log holds the failures of every round.
    pub result: Result<(), RoundError>,
}

impl TaskReport {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Run every task to a final result. Reports come back in task order.
    async fn run_all(&self, tasks: Vec<Task>, runner: Arc<dyn TaskRunner>) -> Vec<TaskReport>;
}
