//! Errors - エラー型と分類
//!
//! - `WorkerError`: worker ノードとの通信・コマンド実行の失敗
//! - `MetadataError`: placement metadata store の失敗
//! - `CoordinatorError`: 呼び出し側に返すエラー（`ErrorKind` で Transient / Permanent / Infrastructure に分類）

use std::fmt;

use thiserror::Error;

use super::attempt::AttemptLog;
use super::ids::{JobId, ShardId, TableId, TaskId};
use crate::config::ConfigError;

/// ErrorKind は実行エラーの運用分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（metadata store やローカルディスクの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failure reported by the worker client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("could not connect to {node}: {reason}")]
    Connection { node: String, reason: String },

    #[error("command failed on {node}: {reason}")]
    Command { node: String, reason: String },

    #[error("remote call to {node} was cancelled")]
    Cancelled { node: String },
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Connection { .. } => ErrorKind::Transient,
            WorkerError::Command { .. } => ErrorKind::Permanent,
            WorkerError::Cancelled { .. } => ErrorKind::Permanent,
        }
    }
}

/// Failure reported by the metadata store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {key} already exists")]
    Conflict { entity: &'static str, key: String },

    #[error("metadata storage failure: {0}")]
    Storage(String),
}

impl MetadataError {
    pub fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        MetadataError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, key: impl fmt::Display) -> Self {
        MetadataError::Conflict {
            entity,
            key: key.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MetadataError::Storage(_) => ErrorKind::Infrastructure,
            _ => ErrorKind::Permanent,
        }
    }
}

/// The rule a precondition check rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionRule {
    NotDistributed,
    AlreadyReference,
    ShardCountNotOne { count: usize },
    PartOfForeignKey,
    ReferencedByForeignKey,
}

impl fmt::Display for PreconditionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionRule::NotDistributed => write!(f, "relation is not distributed"),
            PreconditionRule::AlreadyReference => write!(f, "relation is already a reference table"),
            PreconditionRule::ShardCountNotOne { count } => write!(
                f,
                "shard count is not one (found {count}); only relations with one shard can be upgraded"
            ),
            PreconditionRule::PartOfForeignKey => write!(
                f,
                "relation is part of a foreign constraint; foreign keys are not allowed from or to reference tables"
            ),
            PreconditionRule::ReferencedByForeignKey => write!(
                f,
                "relation is referenced by a foreign key of another table"
            ),
        }
    }
}

/// Errors returned to callers of the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cannot {operation} \"{relation}\": {rule}{}", hint_suffix(.hint))]
    PreconditionFailed {
        operation: &'static str,
        relation: String,
        rule: PreconditionRule,
        hint: Option<String>,
    },

    #[error("no healthy placement of {shard_id} to copy from")]
    NoHealthySource { shard_id: ShardId },

    #[error("{task_id} of {job_id} failed on every candidate placement: {attempts}")]
    TaskExecutionFailed {
        job_id: JobId,
        task_id: TaskId,
        attempts: AttemptLog,
    },

    #[error("{task_id} of {job_id} stopped without reporting: {reason}")]
    TaskAborted {
        job_id: JobId,
        task_id: TaskId,
        reason: String,
    },

    #[error("plan of {job_id} is not executable: {reason}")]
    PlanInvalid { job_id: JobId, reason: String },

    #[error("metadata rewrite of {table_id} did not commit: {source}")]
    MetadataInconsistent {
        table_id: TableId,
        #[source]
        source: MetadataError,
    },

    #[error("replication of {shard_id} incomplete: {failed} of {attempted} workers failed")]
    ReplicationIncomplete {
        shard_id: ShardId,
        attempted: usize,
        failed: usize,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("result spool error: {0}")]
    Spool(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(hint) => format!(" (hint: {hint})"),
        None => String::new(),
    }
}

impl CoordinatorError {
    pub fn precondition(
        operation: &'static str,
        relation: impl Into<String>,
        rule: PreconditionRule,
    ) -> Self {
        CoordinatorError::PreconditionFailed {
            operation,
            relation: relation.into(),
            rule,
            hint: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Metadata(e) => e.kind(),
            CoordinatorError::MetadataInconsistent { source, .. } => source.kind(),
            CoordinatorError::Spool(_) => ErrorKind::Infrastructure,
            CoordinatorError::TaskExecutionFailed { attempts, .. } if attempts.all_transient() => {
                ErrorKind::Transient
            }
            CoordinatorError::ReplicationIncomplete { .. } => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_message_names_rule_and_relation() {
        let err = CoordinatorError::precondition(
            "upgrade to reference table",
            "orders",
            PreconditionRule::ShardCountNotOne { count: 2 },
        );
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("shard count is not one"));
        assert!(!msg.contains("hint"));
    }

    #[test]
    fn precondition_hint_is_appended() {
        let err = CoordinatorError::PreconditionFailed {
            operation: "upgrade to reference table",
            relation: "events".into(),
            rule: PreconditionRule::NotDistributed,
            hint: Some("use create_reference_table('events')".into()),
        };
        assert!(err.to_string().ends_with("(hint: use create_reference_table('events'))"));
    }

    #[test]
    fn connection_errors_are_transient() {
        let err = WorkerError::Connection {
            node: "w1:5432".into(),
            reason: "refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = WorkerError::Command {
            node: "w1:5432".into(),
            reason: "syntax error".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
