//! shardweave-core
//!
//! Coordinator for queries over sharded tables and for reference table
//! replication.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, catalog, job, attempt, errors, reports, retry, decision）
//! - **ports**: 抽象化レイヤー（WorkerClient, MetadataStore, TaskScheduler, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryMetadataStore, InMemoryFleet, BoundedTaskScheduler）
//! - **merge**: job spool と RowStream
//! - **app**: executor, replicator, truncate, scope, locks, builder
//! - **config**: TOML + 環境変数の設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod merge;
pub mod ports;

pub use app::{Coordinator, CoordinatorBuilder, ExecutionScope};
pub use config::CoordinatorConfig;
pub use domain::CoordinatorError;
pub use merge::RowStream;
