//! InMemoryFleet - 開発・テスト用の worker 群
//!
//! # 学習ポイント
//! - 障害注入（接続断、コマンド失敗、ストリーム途中の切断）
//! - すべての呼び出しを記録し、テストから「どこに何を送ったか」を検証する
//!
//! 実際の SQL は解釈しません。クエリ文字列ごとに登録した行を返すだけです。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{NodeAddr, RowBatch, WorkerError};
use crate::ports::{BufferedRowSource, RowSource, WorkerClient};

/// One recorded call against the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCall {
    Query { node: NodeAddr, query: String },
    Command { node: NodeAddr, command: String },
    Transaction { node: NodeAddr, commands: Vec<String> },
}

impl FleetCall {
    pub fn node(&self) -> &NodeAddr {
        match self {
            FleetCall::Query { node, .. }
            | FleetCall::Command { node, .. }
            | FleetCall::Transaction { node, .. } => node,
        }
    }
}

#[derive(Default)]
struct FleetState {
    /// query text -> batches returned by any healthy node
    responses: HashMap<String, Vec<RowBatch>>,
    delays: HashMap<String, Duration>,
    down: HashSet<NodeAddr>,
    failing_commands: HashSet<NodeAddr>,
    /// (node, query) pairs that drop the connection after streaming their rows
    mid_stream_failures: HashSet<(NodeAddr, String)>,
    /// commands each node has committed, in commit order
    committed: HashMap<NodeAddr, Vec<String>>,
    calls: Vec<FleetCall>,
}

/// In-memory worker fleet implementing `WorkerClient`.
#[derive(Clone, Default)]
pub struct InMemoryFleet {
    state: Arc<Mutex<FleetState>>,
}

impl InMemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned for `query` by every reachable node.
    pub async fn respond(&self, query: impl Into<String>, batches: Vec<RowBatch>) {
        self.state.lock().await.responses.insert(query.into(), batches);
    }

    /// Delay the response to `query`.
    pub async fn delay(&self, query: impl Into<String>, delay: Duration) {
        self.state.lock().await.delays.insert(query.into(), delay);
    }

    pub async fn set_down(&self, node: &NodeAddr) {
        self.state.lock().await.down.insert(node.clone());
    }

    pub async fn set_up(&self, node: &NodeAddr) {
        self.state.lock().await.down.remove(node);
    }

    /// Every command and transaction on `node` fails (the node stays reachable).
    pub async fn fail_commands_on(&self, node: &NodeAddr) {
        self.state.lock().await.failing_commands.insert(node.clone());
    }

    /// `query` on `node` streams its rows, then loses the connection.
    pub async fn fail_mid_stream(&self, node: &NodeAddr, query: impl Into<String>) {
        self.state
            .lock()
            .await
            .mid_stream_failures
            .insert((node.clone(), query.into()));
    }

    pub async fn calls(&self) -> Vec<FleetCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_to(&self, node: &NodeAddr) -> Vec<FleetCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.node() == node)
            .collect()
    }

    /// Number of committed per-worker transactions, across the fleet.
    pub async fn transaction_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| matches!(c, FleetCall::Transaction { .. }))
            .count()
    }

    pub async fn committed(&self, node: &NodeAddr) -> Vec<String> {
        self.state
            .lock()
            .await
            .committed
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    fn unreachable(node: &NodeAddr) -> WorkerError {
        WorkerError::Connection {
            node: node.to_string(),
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl WorkerClient for InMemoryFleet {
    async fn run_command(
        &self,
        node: &NodeAddr,
        _owner: &str,
        command: &str,
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        if state.down.contains(node) {
            return Err(Self::unreachable(node));
        }
        if state.failing_commands.contains(node) {
            return Err(WorkerError::Command {
                node: node.to_string(),
                reason: format!("could not run \"{command}\""),
            });
        }
        state.calls.push(FleetCall::Command {
            node: node.clone(),
            command: command.to_string(),
        });
        state
            .committed
            .entry(node.clone())
            .or_default()
            .push(command.to_string());
        Ok(())
    }

    async fn run_command_streaming_rows(
        &self,
        node: &NodeAddr,
        command: &str,
    ) -> Result<Box<dyn RowSource>, WorkerError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(FleetCall::Query {
                node: node.clone(),
                query: command.to_string(),
            });
            state.delays.get(command).copied()
        };
        // Sleep outside the lock so concurrent tasks are not serialised.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().await;
        if state.down.contains(node) {
            return Err(Self::unreachable(node));
        }
        let Some(batches) = state.responses.get(command).cloned() else {
            return Err(WorkerError::Command {
                node: node.to_string(),
                reason: format!("no response registered for \"{command}\""),
            });
        };
        if state
            .mid_stream_failures
            .contains(&(node.clone(), command.to_string()))
        {
            let err = WorkerError::Connection {
                node: node.to_string(),
                reason: "server closed the connection unexpectedly".to_string(),
            };
            return Ok(Box::new(BufferedRowSource::failing_after(batches, err)));
        }
        Ok(Box::new(BufferedRowSource::new(batches)))
    }

    async fn run_commands_in_transaction(
        &self,
        node: &NodeAddr,
        _owner: &str,
        commands: &[String],
    ) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;
        if state.down.contains(node) {
            return Err(Self::unreachable(node));
        }
        if state.failing_commands.contains(node) {
            // rolled back: nothing committed, nothing recorded as a transaction
            return Err(WorkerError::Command {
                node: node.to_string(),
                reason: "transaction rolled back".to_string(),
            });
        }
        state.calls.push(FleetCall::Transaction {
            node: node.clone(),
            commands: commands.to_vec(),
        });
        state
            .committed
            .entry(node.clone())
            .or_default()
            .extend(commands.iter().cloned());
        Ok(())
    }
}
