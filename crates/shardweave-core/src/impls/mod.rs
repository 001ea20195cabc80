//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryMetadataStore**: テスト・デモ用の metadata store
//! - **InMemoryFleet**: 障害注入できる worker 群
//! - **BoundedTaskScheduler**: managed 戦略の scheduler（並列度制限 + リトライ）
//!
//! 本番用の WorkerClient / MetadataStore（PostgreSQL 接続）は別クレートに置きます。

pub mod inmem_fleet;
pub mod inmem_metadata;
pub mod scheduler;

pub use self::inmem_fleet::{FleetCall, InMemoryFleet};
pub use self::inmem_metadata::InMemoryMetadataStore;
pub use self::scheduler::BoundedTaskScheduler;
