//! ExecutionScope - 呼び出し側のリソーススコープ
//!
//! - キャンセル信号（`watch` チャネル）
//! - このスコープで作った job spool と JobRecord の登録簿
//!
//! `discard(job)`、`abort()`、scope の drop で job ディレクトリと
//! JobRecord が消えます。失敗した job の spool も discard されるまでは読めます。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, watch};

use crate::domain::{CoordinatorError, Job, JobId, JobRecord, Row, TaskId};
use crate::merge::JobSpool;

/// Progress records of the jobs run under one scope.
pub(crate) type JobRecords = Arc<Mutex<HashMap<JobId, JobRecord>>>;

pub struct ExecutionScope {
    spool_root: PathBuf,
    cancel_tx: watch::Sender<bool>,
    spools: Mutex<HashMap<JobId, Arc<JobSpool>>>,
    records: JobRecords,
}

impl ExecutionScope {
    pub fn new(spool_root: impl Into<PathBuf>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            spool_root: spool_root.into(),
            cancel_tx,
            spools: Mutex::new(HashMap::new()),
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn spool_root(&self) -> &Path {
        &self.spool_root
    }

    /// Abort everything running under this scope.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn check_cancelled(&self) -> Result<(), CoordinatorError> {
        if self.is_cancelled() {
            return Err(CoordinatorError::Cancelled);
        }
        Ok(())
    }

    /// Create the job directory and register it for cleanup.
    ///
    /// A job run again under the same id reuses its registered spool; each
    /// task's file is rewritten when the task begins.
    pub async fn open_job(&self, job_id: JobId) -> Result<Arc<JobSpool>, CoordinatorError> {
        let mut spools = self.spools.lock().await;
        if let Some(spool) = spools.get(&job_id).filter(|s| !s.is_removed()) {
            return Ok(Arc::clone(spool));
        }
        // a replaced spool is already removed, so its drop leaves the new directory alone
        let spool = Arc::new(JobSpool::create(&self.spool_root, job_id).await?);
        spools.insert(job_id, Arc::clone(&spool));
        Ok(spool)
    }

    /// Start tracking a job, replacing the record of an earlier run.
    pub(crate) async fn track(&self, job: &Job) {
        self.records
            .lock()
            .await
            .insert(job.job_id, JobRecord::new(job));
    }

    pub(crate) fn job_records(&self) -> JobRecords {
        Arc::clone(&self.records)
    }

    /// Progress of a job run under this scope, until it is discarded.
    pub async fn job_record(&self, job_id: JobId) -> Option<JobRecord> {
        self.records.lock().await.get(&job_id).cloned()
    }

    /// Rows a task of a registered job spooled, whatever the job's outcome.
    pub async fn spooled_rows(
        &self,
        job_id: JobId,
        task_id: TaskId,
    ) -> Result<Vec<Row>, CoordinatorError> {
        let spool = self.spools.lock().await.get(&job_id).cloned();
        match spool {
            Some(spool) => Ok(spool.read_task(task_id).await?),
            None => Err(CoordinatorError::Spool(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{job_id} has no spool in this scope"),
            ))),
        }
    }

    pub async fn has_job(&self, job_id: JobId) -> bool {
        self.spools.lock().await.contains_key(&job_id)
    }

    /// Remove a job's spool. Unknown or already discarded jobs are a no-op.
    pub async fn discard(&self, job_id: JobId) -> Result<(), CoordinatorError> {
        self.records.lock().await.remove(&job_id);
        let spool = self.spools.lock().await.remove(&job_id);
        if let Some(spool) = spool {
            spool.remove().await?;
        }
        Ok(())
    }

    /// Cancel and release every job spool.
    pub async fn abort(&self) -> Result<(), CoordinatorError> {
        self.cancel();
        self.records.lock().await.clear();
        let spools: Vec<_> = self.spools.lock().await.drain().map(|(_, s)| s).collect();
        for spool in spools {
            spool.remove().await?;
        }
        Ok(())
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        self.cancel();
        // a RowStream may still hold the spool; the directory goes regardless
        for (_, spool) in self.spools.get_mut().drain() {
            spool.remove_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutorStrategy;
    use tempfile::TempDir;
    use ulid::Ulid;

    #[tokio::test]
    async fn discard_removes_job_directory() {
        let root = TempDir::new().unwrap();
        let scope = ExecutionScope::new(root.path());
        let job_id = JobId::from(Ulid::new());

        let spool = scope.open_job(job_id).await.unwrap();
        let dir = spool.dir().to_path_buf();
        assert!(dir.exists());

        scope.discard(job_id).await.unwrap();
        scope.discard(job_id).await.unwrap();
        assert!(!dir.exists());
        assert!(!scope.has_job(job_id).await);
    }

    #[tokio::test]
    async fn dropping_scope_removes_directories_held_elsewhere() {
        let root = TempDir::new().unwrap();
        let scope = ExecutionScope::new(root.path());
        let spool = scope.open_job(JobId::from(Ulid::new())).await.unwrap();
        let dir = spool.dir().to_path_buf();

        drop(scope);
        assert!(!dir.exists());
        assert!(spool.is_removed());
    }

    #[tokio::test]
    async fn reopening_a_job_keeps_its_directory() {
        let root = TempDir::new().unwrap();
        let scope = ExecutionScope::new(root.path());
        let job_id = JobId::from(Ulid::new());

        let first = scope.open_job(job_id).await.unwrap();
        let second = scope.open_job(job_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        drop(second);
        assert!(root.path().join(job_id.to_string()).exists());
    }

    #[tokio::test]
    async fn reopening_after_discard_creates_a_fresh_spool() {
        let root = TempDir::new().unwrap();
        let scope = ExecutionScope::new(root.path());
        let job_id = JobId::from(Ulid::new());

        let old = scope.open_job(job_id).await.unwrap();
        scope.discard(job_id).await.unwrap();
        let fresh = scope.open_job(job_id).await.unwrap();

        drop(old);
        assert!(!fresh.is_removed());
        assert!(fresh.dir().exists());
    }

    #[tokio::test]
    async fn discard_and_abort_forget_job_records() {
        let root = TempDir::new().unwrap();
        let scope = ExecutionScope::new(root.path());
        let job_a = Job::new(JobId::from(Ulid::new()), ExecutorStrategy::Managed);
        let job_b = Job::new(JobId::from(Ulid::new()), ExecutorStrategy::Managed);
        scope.track(&job_a).await;
        scope.track(&job_b).await;
        assert!(scope.job_record(job_a.job_id).await.is_some());

        scope.discard(job_a.job_id).await.unwrap();
        assert!(scope.job_record(job_a.job_id).await.is_none());
        assert!(scope.job_record(job_b.job_id).await.is_some());

        scope.abort().await.unwrap();
        assert!(scope.job_record(job_b.job_id).await.is_none());
        assert!(scope.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_observed_by_subscribers() {
        let scope = ExecutionScope::new(std::env::temp_dir());
        let rx = scope.subscribe();
        assert!(scope.check_cancelled().is_ok());

        scope.cancel();
        assert!(*rx.borrow());
        assert!(matches!(
            scope.check_cancelled(),
            Err(CoordinatorError::Cancelled)
        ));
    }
}
