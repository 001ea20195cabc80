//! JobSpool - job 単位の中間結果置き場
//!
//! ```text
//! {spool_dir}/
//!   job-01HV.../
//!     task-01HV....jsonl   <- 1 行 = 1 Row（JSON）
//!     task-01HW....jsonl
//! ```
//!
//! - タスクごとに 1 ファイル。書き手はそのタスクだけなので行は混ざらない
//! - 試行（candidate）を始めるたびにファイルを作り直す
//! - `remove()` は何度呼んでもよい。drop 時にも掃除する

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};

use crate::domain::{JobId, Row, TaskId};

/// Lines of one task's spool file.
pub type TaskLines = Lines<BufReader<File>>;

#[derive(Debug)]
pub struct JobSpool {
    job_id: JobId,
    dir: PathBuf,
    removed: AtomicBool,
}

impl JobSpool {
    /// Create the job directory below `root`.
    pub async fn create(root: &Path, job_id: JobId) -> io::Result<Self> {
        let dir = root.join(job_id.to_string());
        fs::create_dir_all(&dir).await?;
        tracing::debug!(%job_id, dir = %dir.display(), "created job spool");
        Ok(Self {
            job_id,
            dir,
            removed: AtomicBool::new(false),
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn task_path(&self, task_id: TaskId) -> PathBuf {
        self.dir.join(format!("{task_id}.jsonl"))
    }

    fn ensure_live(&self) -> io::Result<()> {
        if self.is_removed() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("spool of {} was torn down", self.job_id),
            ));
        }
        Ok(())
    }

    /// Start (or restart) a task's output: the file is truncated.
    pub async fn begin_task(&self, task_id: TaskId) -> io::Result<()> {
        self.ensure_live()?;
        File::create(self.task_path(task_id)).await?;
        Ok(())
    }

    /// Append a batch to a task's output, in order.
    pub async fn append(&self, task_id: TaskId, batch: &[Row]) -> io::Result<()> {
        self.ensure_live()?;
        let mut buf = Vec::new();
        for row in batch {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.task_path(task_id))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await
    }

    /// Open a task's output for reading from the first row.
    ///
    /// A task that never spooled anything reads as empty.
    pub async fn open_task(&self, task_id: TaskId) -> io::Result<Option<TaskLines>> {
        self.ensure_live()?;
        match File::open(self.task_path(task_id)).await {
            Ok(file) => Ok(Some(BufReader::new(file).lines())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every row a task spooled.
    pub async fn read_task(&self, task_id: TaskId) -> io::Result<Vec<Row>> {
        let mut rows = Vec::new();
        if let Some(mut lines) = self.open_task(task_id).await? {
            while let Some(line) = lines.next_line().await? {
                rows.push(parse_row(&line)?);
            }
        }
        Ok(rows)
    }

    /// Release the job directory. Idempotent.
    pub async fn remove(&self) -> io::Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                tracing::debug!(job_id = %self.job_id, "removed job spool");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Synchronous teardown for drop paths. Errors are ignored.
    pub(crate) fn remove_now(&self) {
        if !self.removed.swap(true, Ordering::SeqCst) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

impl Drop for JobSpool {
    fn drop(&mut self) {
        self.remove_now();
    }
}

pub(crate) fn parse_row(line: &str) -> io::Result<Row> {
    serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use ulid::Ulid;

    fn ids() -> (JobId, TaskId) {
        (JobId::from(Ulid::new()), TaskId::from(Ulid::new()))
    }

    #[tokio::test]
    async fn rows_read_back_in_spool_order() {
        let root = TempDir::new().unwrap();
        let (job_id, task_id) = ids();
        let spool = JobSpool::create(root.path(), job_id).await.unwrap();

        spool.begin_task(task_id).await.unwrap();
        spool
            .append(task_id, &[Row::from_texts(["a"]), Row::from_texts(["b"])])
            .await
            .unwrap();
        spool
            .append(task_id, &[Row::new(vec![None])])
            .await
            .unwrap();

        let rows = spool.read_task(task_id).await.unwrap();
        assert_eq!(
            rows,
            vec![
                Row::from_texts(["a"]),
                Row::from_texts(["b"]),
                Row::new(vec![None])
            ]
        );
    }

    #[tokio::test]
    async fn begin_task_discards_previous_attempt() {
        let root = TempDir::new().unwrap();
        let (job_id, task_id) = ids();
        let spool = JobSpool::create(root.path(), job_id).await.unwrap();

        spool.begin_task(task_id).await.unwrap();
        spool
            .append(task_id, &[Row::from_texts(["partial"])])
            .await
            .unwrap();
        spool.begin_task(task_id).await.unwrap();

        assert!(spool.read_task(task_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_blocks_reads() {
        let root = TempDir::new().unwrap();
        let (job_id, task_id) = ids();
        let spool = JobSpool::create(root.path(), job_id).await.unwrap();
        let dir = spool.dir().to_path_buf();

        spool.remove().await.unwrap();
        spool.remove().await.unwrap();

        assert!(!dir.exists());
        assert!(spool.read_task(task_id).await.is_err());
    }

    #[tokio::test]
    async fn drop_removes_directory() {
        let root = TempDir::new().unwrap();
        let (job_id, _) = ids();
        let spool = JobSpool::create(root.path(), job_id).await.unwrap();
        let dir = spool.dir().to_path_buf();
        assert!(dir.exists());

        drop(spool);
        assert!(!dir.exists());
    }
}
