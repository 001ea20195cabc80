//! Job / Task model and per-job progress tracking.
//!
//! A `Job` arrives fully planned: the planner decides the task list, each
//! task's candidate placements and the executor strategy. The executor only
//! tracks progress on top of it.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::catalog::NodeAddr;
use super::ids::{JobId, ShardId, TaskId};

/// Which executor runs the job. Chosen by the planner, once per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStrategy {
    /// Skip remote execution entirely (EXPLAIN without ANALYZE).
    ExplainOnly,

    /// Single-task job executed directly in the calling context.
    Router,

    /// All tasks started eagerly; results become readable as tasks finish.
    Immediate,

    /// Tasks handed to the scheduling layer (concurrency limits, retries).
    Managed,
}

/// One unit of per-shard work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub job_id: JobId,

    /// Shard this task reads, if any. Used by the validity check.
    pub shard_id: Option<ShardId>,

    /// Command text sent to the worker.
    pub query: String,

    /// Placements that can answer this task, tried in (name, port) order.
    pub candidates: Vec<NodeAddr>,
}

impl Task {
    pub fn new(task_id: TaskId, job_id: JobId, query: impl Into<String>) -> Self {
        Self {
            task_id,
            job_id,
            shard_id: None,
            query: query.into(),
            candidates: Vec::new(),
        }
    }

    pub fn with_shard(mut self, shard_id: ShardId) -> Self {
        self.shard_id = Some(shard_id);
        self
    }

    pub fn with_candidate(mut self, node: NodeAddr) -> Self {
        self.candidates.push(node);
        self
    }

    /// Candidates in deterministic dispatch order, duplicates removed.
    pub fn ordered_candidates(&self) -> Vec<NodeAddr> {
        let mut nodes = self.candidates.clone();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

/// A unit of distributed work produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub strategy: ExecutorStrategy,
    pub tasks: Vec<Task>,

    /// Set by the planner when the plan is known to be unexecutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planning_error: Option<String>,
}

impl Job {
    pub fn new(job_id: JobId, strategy: ExecutorStrategy) -> Self {
        Self {
            job_id,
            strategy,
            tasks: Vec::new(),
            planning_error: None,
        }
    }

    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }
}

/// Task state within a running job.
///
/// State transitions:
/// - Pending -> Running -> Succeeded
/// - Pending -> Running -> Failed (every candidate failed)
/// - Pending -> Running -> Pending (managed scheduler retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// Job state (aggregated from tasks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// At least one task is pending or running.
    Running,

    /// All tasks succeeded.
    Completed,

    /// Every task is terminal and at least one failed.
    Failed,

    /// The owning scope was aborted.
    Cancelled,
}

/// Progress record of one job.
///
/// Single source of truth for task states while the executor owns the job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub strategy: ExecutorStrategy,
    pub state: JobState,
    pub task_states: HashMap<TaskId, TaskState>,
    pub created_at: Instant,
    pub updated_at: Instant,
}

impl JobRecord {
    pub fn new(job: &Job) -> Self {
        let now = Instant::now();
        let task_states = job
            .tasks
            .iter()
            .map(|task| (task.task_id, TaskState::Pending))
            .collect();
        let mut record = Self {
            job_id: job.job_id,
            strategy: job.strategy,
            state: JobState::Running,
            task_states,
            created_at: now,
            updated_at: now,
        };
        record.refresh_state();
        record
    }

    pub fn set_task_state(&mut self, task_id: TaskId, state: TaskState) {
        self.task_states.insert(task_id, state);
        self.refresh_state();
    }

    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.task_states.get(&task_id).copied()
    }

    pub fn mark_cancelled(&mut self) {
        self.state = JobState::Cancelled;
        self.updated_at = Instant::now();
    }

    fn refresh_state(&mut self) {
        if self.state == JobState::Cancelled {
            return;
        }
        let states = self.task_states.values();
        self.state = if states.clone().all(|s| *s == TaskState::Succeeded) {
            JobState::Completed
        } else if states.clone().any(|s| !s.is_terminal()) {
            JobState::Running
        } else {
            JobState::Failed
        };
        self.updated_at = Instant::now();
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.task_states.values().filter(|s| **s == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    fn job_with_tasks(n: usize) -> Job {
        let job_id = JobId::from_ulid(Ulid::new());
        (0..n).fold(Job::new(job_id, ExecutorStrategy::Managed), |job, i| {
            job.with_task(Task::new(
                TaskId::from_ulid(Ulid::new()),
                job_id,
                format!("SELECT {i}"),
            ))
        })
    }

    #[test]
    fn new_job_record_starts_running() {
        let job = job_with_tasks(2);
        let record = JobRecord::new(&job);
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.count(TaskState::Pending), 2);
    }

    #[test]
    fn job_without_tasks_is_completed() {
        let job = job_with_tasks(0);
        assert_eq!(JobRecord::new(&job).state, JobState::Completed);
    }

    #[test]
    fn all_succeeded_completes_job() {
        let job = job_with_tasks(2);
        let mut record = JobRecord::new(&job);
        for task in &job.tasks {
            record.set_task_state(task.task_id, TaskState::Succeeded);
        }
        assert_eq!(record.state, JobState::Completed);
    }

    #[rstest]
    #[case::pending(TaskState::Pending)]
    #[case::running(TaskState::Running)]
    fn unfinished_task_keeps_job_running(#[case] other: TaskState) {
        let job = job_with_tasks(2);
        let mut record = JobRecord::new(&job);
        record.set_task_state(job.tasks[0].task_id, TaskState::Failed);
        record.set_task_state(job.tasks[1].task_id, other);
        assert_eq!(record.state, JobState::Running);
    }

    #[test]
    fn terminal_with_failure_fails_job() {
        let job = job_with_tasks(2);
        let mut record = JobRecord::new(&job);
        record.set_task_state(job.tasks[0].task_id, TaskState::Succeeded);
        record.set_task_state(job.tasks[1].task_id, TaskState::Failed);
        assert_eq!(record.state, JobState::Failed);
    }

    #[test]
    fn cancelled_is_sticky() {
        let job = job_with_tasks(1);
        let mut record = JobRecord::new(&job);
        record.mark_cancelled();
        record.set_task_state(job.tasks[0].task_id, TaskState::Succeeded);
        assert_eq!(record.state, JobState::Cancelled);
    }

    #[test]
    fn candidates_are_ordered_by_name_then_port() {
        let job_id = JobId::from_ulid(Ulid::new());
        let task = Task::new(TaskId::from_ulid(Ulid::new()), job_id, "SELECT 1")
            .with_candidate(NodeAddr::new("w2", 5432))
            .with_candidate(NodeAddr::new("w1", 9700))
            .with_candidate(NodeAddr::new("w1", 5432))
            .with_candidate(NodeAddr::new("w2", 5432));

        assert_eq!(
            task.ordered_candidates(),
            vec![
                NodeAddr::new("w1", 5432),
                NodeAddr::new("w1", 9700),
                NodeAddr::new("w2", 5432),
            ]
        );
    }
}
