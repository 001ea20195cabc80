//! Domain model (ids, catalog rows, jobs, attempts, errors, reports).

pub mod attempt;
pub mod catalog;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod job;
pub mod report;
pub mod retry;
pub mod row;

pub use attempt::{AttemptLog, CandidateAttempt};
pub use catalog::{
    ColocationGroup, ForeignKey, NodeAddr, PartitionMethod, PartitionRow, ReplicationModel, Shard,
    ShardPlacement, ShardState, ShardStorage, TableDefinition, WorkerNode,
};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{CoordinatorError, ErrorKind, MetadataError, PreconditionRule, WorkerError};
pub use ids::{ColocationId, JobId, PlacementId, ShardId, TableId, TaskId};
pub use job::{ExecutorStrategy, Job, JobRecord, JobState, Task, TaskState};
pub use report::{FleetSyncReport, ReplicationReport, WorkerCopyFailure};
pub use retry::RetryPolicy;
pub use row::{Row, RowBatch};
