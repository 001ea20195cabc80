//! ResultMerger / RowStream
//!
//! タスクの出力を `JobSpool` に書き、呼び出し側には 1 本の `RowStream` として
//! 見せます。
//!
//! 読み出し順:
//! - **Fixed**: 全タスク完了後に作る。タスクリスト順（managed, router）
//! - **Incremental**: 完了通知を受け取った順（immediate）。失敗通知が来たら
//!   そこで `Err` を返す
//!
//! `rewind()` は読み出しカーソルを先頭に戻すだけで、タスクは再実行しません。

use std::sync::Arc;

use tokio::sync::mpsc;

use super::spool::{JobSpool, TaskLines, parse_row};
use crate::domain::{CoordinatorError, JobId, Row, TaskId};

/// Completion notice sent by an immediate-strategy task.
pub type TaskCompletion = Result<TaskId, CoordinatorError>;

/// Write side of a job's results.
#[derive(Debug, Clone)]
pub struct ResultMerger {
    spool: Arc<JobSpool>,
}

impl ResultMerger {
    pub fn new(spool: Arc<JobSpool>) -> Self {
        Self { spool }
    }

    pub fn job_id(&self) -> JobId {
        self.spool.job_id()
    }

    /// Forget any rows of a previous attempt of this task.
    pub async fn begin(&self, task_id: TaskId) -> Result<(), CoordinatorError> {
        Ok(self.spool.begin_task(task_id).await?)
    }

    pub async fn spool(&self, task_id: TaskId, batch: &[Row]) -> Result<(), CoordinatorError> {
        Ok(self.spool.append(task_id, batch).await?)
    }

    /// Stream over tasks that have all completed, read in the given order.
    pub fn drain(&self, tasks: Vec<TaskId>) -> RowStream {
        RowStream::new(Arc::clone(&self.spool), tasks, None)
    }

    /// Stream that grows as completion notices arrive.
    ///
    /// `completed` are tasks already known to be finished.
    pub fn drain_incremental(
        &self,
        completed: Vec<TaskId>,
        incoming: mpsc::UnboundedReceiver<TaskCompletion>,
    ) -> RowStream {
        RowStream::new(Arc::clone(&self.spool), completed, Some(incoming))
    }
}

/// Lazy, one-pass sequence of a job's rows. `rewind` starts a new pass.
pub struct RowStream {
    spool: Arc<JobSpool>,
    /// Tasks whose output is readable, in read order.
    tasks: Vec<TaskId>,
    incoming: Option<mpsc::UnboundedReceiver<TaskCompletion>>,
    next_task: usize,
    current: Option<TaskLines>,
}

impl RowStream {
    fn new(
        spool: Arc<JobSpool>,
        tasks: Vec<TaskId>,
        incoming: Option<mpsc::UnboundedReceiver<TaskCompletion>>,
    ) -> Self {
        Self {
            spool,
            tasks,
            incoming,
            next_task: 0,
            current: None,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.spool.job_id()
    }

    /// Next row, or `None` once every task's rows were read.
    ///
    /// Under the immediate strategy this waits for the next task to complete,
    /// and returns the failure of a task that exhausted its candidates.
    pub async fn next_row(&mut self) -> Result<Option<Row>, CoordinatorError> {
        loop {
            if let Some(lines) = self.current.as_mut() {
                match lines.next_line().await? {
                    Some(line) => return Ok(Some(parse_row(&line)?)),
                    None => self.current = None,
                }
            }

            if self.next_task < self.tasks.len() {
                let task_id = self.tasks[self.next_task];
                self.next_task += 1;
                self.current = self.spool.open_task(task_id).await?;
                continue;
            }

            let Some(incoming) = self.incoming.as_mut() else {
                return Ok(None);
            };
            match incoming.recv().await {
                Some(Ok(task_id)) => self.tasks.push(task_id),
                Some(Err(e)) => return Err(e),
                None => self.incoming = None,
            }
        }
    }

    /// Restart from the first row without re-running any task.
    pub fn rewind(&mut self) -> Result<(), CoordinatorError> {
        if self.spool.is_removed() {
            return Err(CoordinatorError::Spool(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("spool of {} was torn down", self.spool.job_id()),
            )));
        }
        self.next_task = 0;
        self.current = None;
        Ok(())
    }

    /// Read the rest of the stream.
    pub async fn collect_rows(&mut self) -> Result<Vec<Row>, CoordinatorError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Release the job's spool. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), CoordinatorError> {
        self.current = None;
        self.incoming = None;
        Ok(self.spool.remove().await?)
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("job_id", &self.spool.job_id())
            .field("tasks", &self.tasks.len())
            .field("next_task", &self.next_task)
            .field("incremental", &self.incoming.is_some())
            .finish()
    }
}
