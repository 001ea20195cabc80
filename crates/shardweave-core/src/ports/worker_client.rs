//! WorkerClient port - worker ノードへのコマンド実行
//!
//! 接続管理・プロトコルは実装側の責務。coordinator が期待するのは
//! 「SQL を投げて、成功/失敗を受け取るか、行をストリームで受け取る」だけです。

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::domain::{NodeAddr, RowBatch, WorkerError};

/// Rows streamed back by a worker, batch by batch.
#[async_trait]
pub trait RowSource: Send {
    /// Next batch in the order the worker produced it; `None` at end of stream.
    async fn next_batch(&mut self) -> Result<Option<RowBatch>, WorkerError>;
}

/// Connection to the worker fleet.
///
/// # Thread Safety
/// - `Send + Sync`: one client is shared by every task of every job.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Run one command as `owner`.
    async fn run_command(&self, node: &NodeAddr, owner: &str, command: &str)
    -> Result<(), WorkerError>;

    /// Run a query and stream its rows back.
    async fn run_command_streaming_rows(
        &self,
        node: &NodeAddr,
        command: &str,
    ) -> Result<Box<dyn RowSource>, WorkerError>;

    /// Run every command inside one transaction local to `node`.
    ///
    /// Either all commands commit on that worker or none do. No other worker
    /// takes part in the transaction.
    async fn run_commands_in_transaction(
        &self,
        node: &NodeAddr,
        owner: &str,
        commands: &[String],
    ) -> Result<(), WorkerError>;
}

/// A `RowSource` over batches already in memory.
///
/// An optional error is returned after the batches run out, which is how a
/// connection dropping mid-stream looks to the executor.
pub struct BufferedRowSource {
    batches: VecDeque<RowBatch>,
    trailing_error: Option<WorkerError>,
}

impl BufferedRowSource {
    pub fn new(batches: Vec<RowBatch>) -> Self {
        Self {
            batches: batches.into(),
            trailing_error: None,
        }
    }

    pub fn failing_after(batches: Vec<RowBatch>, error: WorkerError) -> Self {
        Self {
            batches: batches.into(),
            trailing_error: Some(error),
        }
    }
}

#[async_trait]
impl RowSource for BufferedRowSource {
    async fn next_batch(&mut self) -> Result<Option<RowBatch>, WorkerError> {
        if let Some(batch) = self.batches.pop_front() {
            return Ok(Some(batch));
        }
        match self.trailing_error.take() {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}
