//! App - アプリケーション層
//!
//! ports を組み合わせて coordinator の操作を実装します。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder / Coordinator**: 構築とワイヤリング、公開 API
//! - **DistributedExecutor**: Job の実行（strategy ごとの分岐、候補 placement の fallback）
//! - **ReferenceTableReplicator**: reference table の複製と metadata の書き換え
//! - **TruncatePropagator**: TRUNCATE の shard への伝播
//! - **ExecutionScope**: キャンセル信号と job spool の寿命
//! - **ResourceLocks**: metadata 書き換え前のロック

pub mod builder;
pub mod executor;
pub mod locks;
pub mod replicator;
pub mod scope;
pub mod truncate;

pub use self::builder::{BuildError, Coordinator, CoordinatorBuilder};
pub use self::executor::DistributedExecutor;
pub use self::locks::ResourceLocks;
pub use self::replicator::ReferenceTableReplicator;
pub use self::scope::ExecutionScope;
pub use self::truncate::{TruncateOutcome, TruncatePropagator};
