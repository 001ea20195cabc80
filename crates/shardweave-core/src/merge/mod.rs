//! Result merging: per-task output spooled on disk, read back as one stream.

pub mod merger;
pub mod spool;

pub use self::merger::{ResultMerger, RowStream, TaskCompletion};
pub use self::spool::JobSpool;
