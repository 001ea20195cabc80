//! Attempt records: what the executor tried for a task, and why it moved on.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::catalog::NodeAddr;
use super::errors::{ErrorKind, WorkerError};

/// One try of a task against one candidate placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAttempt {
    pub node: NodeAddr,

    /// 1-based scheduler round this try belongs to.
    pub round: u32,

    /// Error text; every recorded attempt is a failed one.
    pub error: String,

    pub transient: bool,
}

impl CandidateAttempt {
    pub fn failed(node: NodeAddr, round: u32, error: &WorkerError) -> Self {
        Self {
            node,
            round,
            error: error.to_string(),
            transient: error.kind() == ErrorKind::Transient,
        }
    }
}

/// Failed candidate attempts of a task, in the order they were made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLog(Vec<CandidateAttempt>);

impl AttemptLog {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, attempt: CandidateAttempt) {
        self.0.push(attempt);
    }

    pub fn extend(&mut self, other: AttemptLog) {
        self.0.extend(other.0);
    }

    pub fn attempts(&self) -> &[CandidateAttempt] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every failure was transient (worth another round).
    pub fn all_transient(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|a| a.transient)
    }
}

impl fmt::Display for AttemptLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no candidate was tried");
        }
        for (i, attempt) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{}] {}", attempt.node, attempt.error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_display_lists_every_candidate() {
        let mut log = AttemptLog::new();
        let node = NodeAddr::new("w1", 5432);
        log.push(CandidateAttempt::failed(
            node.clone(),
            1,
            &WorkerError::Connection {
                node: node.to_string(),
                reason: "refused".into(),
            },
        ));
        let text = log.to_string();
        assert!(text.starts_with("[w1:5432] could not connect"));
        assert!(log.all_transient());
    }

    #[test]
    fn empty_log_is_not_transient() {
        assert!(!AttemptLog::new().all_transient());
    }
}
