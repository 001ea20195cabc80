//! Ports - 抽象化レイヤー
//!
//! 外部コラボレータ（worker ノード、metadata store、スケジューリング層）への
//! インターフェースを定義し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - metadata store が source of truth（正本）
//! - worker へのコマンドは worker ごとに独立したトランザクション
//! - coordinator は「どの順で、どこに」だけを決める

pub mod clock;
pub mod id_generator;
pub mod metadata_store;
pub mod scheduler;
pub mod worker_client;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::metadata_store::{MetadataBatch, MetadataOp, MetadataStore};
pub use self::scheduler::{RoundError, TaskReport, TaskRunner, TaskScheduler};
pub use self::worker_client::{BufferedRowSource, RowSource, WorkerClient};
