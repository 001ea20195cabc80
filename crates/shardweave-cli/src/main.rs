//! shardweave - demo driver for the coordinator against an in-memory fleet.
//!
//! ```text
//! shardweave demo-query --strategy managed --tasks 3 --down w1
//! shardweave promote --workers 3
//! shardweave sync --workers 4 --tables 2
//! ```

mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use shardweave_core::domain::{
    ColocationId, ExecutorStrategy, Job, NodeAddr, PartitionMethod, PartitionRow,
    ReplicationModel, Row, Shard, ShardId, ShardState, ShardStorage, TableDefinition, TableId,
    Task, WorkerNode,
};
use shardweave_core::impls::{InMemoryFleet, InMemoryMetadataStore};
use shardweave_core::ports::{IdGenerator, MetadataStore, SystemClock, UlidGenerator};
use shardweave_core::{Coordinator, CoordinatorBuilder, CoordinatorConfig};

const WORKER_PORT: u16 = 5432;

#[derive(Debug, Parser)]
#[command(name = "shardweave", about = "Sharded query coordinator demo")]
struct Cli {
    /// TOML config file (env overrides still apply)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one job over a two-replica table and print the merged rows
    DemoQuery {
        #[arg(long, value_enum, default_value_t = Strategy::Managed)]
        strategy: Strategy,

        /// Number of shards (one task each)
        #[arg(long, default_value_t = 3)]
        tasks: usize,

        /// Worker names to take offline (w1, w2)
        #[arg(long)]
        down: Vec<String>,
    },

    /// Upgrade a single-shard table held by w1 to a reference table
    Promote {
        #[arg(long, default_value_t = 3)]
        workers: usize,
    },

    /// Add a worker and copy every reference table to it
    Sync {
        /// Worker count after the new node joined
        #[arg(long, default_value_t = 4)]
        workers: usize,

        #[arg(long, default_value_t = 2)]
        tables: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    ExplainOnly,
    Router,
    Immediate,
    Managed,
}

impl From<Strategy> for ExecutorStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::ExplainOnly => ExecutorStrategy::ExplainOnly,
            Strategy::Router => ExecutorStrategy::Router,
            Strategy::Immediate => ExecutorStrategy::Immediate,
            Strategy::Managed => ExecutorStrategy::Managed,
        }
    }
}

fn worker(i: usize) -> NodeAddr {
    NodeAddr::new(format!("w{i}"), WORKER_PORT)
}

struct Demo {
    fleet: InMemoryFleet,
    store: InMemoryMetadataStore,
    coordinator: Coordinator,
    _spool: tempfile::TempDir,
}

impl Demo {
    async fn new(mut config: CoordinatorConfig, workers: usize) -> Result<Self> {
        std::fs::create_dir_all(&config.spool.dir)
            .with_context(|| format!("cannot create {}", config.spool.dir.display()))?;
        let spool = tempfile::tempdir_in(&config.spool.dir)?;
        config.spool.dir = spool.path().to_path_buf();

        let fleet = InMemoryFleet::new();
        let store = InMemoryMetadataStore::new();
        for i in 1..=workers {
            store
                .add_worker(WorkerNode::new(format!("w{i}"), WORKER_PORT))
                .await;
        }
        let coordinator = CoordinatorBuilder::new(config)
            .worker_client(Arc::new(fleet.clone()))
            .metadata_store(Arc::new(store.clone()))
            .build()?;
        Ok(Self {
            fleet,
            store,
            coordinator,
            _spool: spool,
        })
    }

    /// Single-shard table with finalized placements on `holders`.
    async fn seed_table(
        &self,
        table_id: TableId,
        name: &str,
        method: PartitionMethod,
        colocation: Option<ColocationId>,
        holders: &[NodeAddr],
    ) -> Result<ShardId> {
        let shard_id = ShardId::new(100 + table_id.get());
        self.store
            .register_table(TableDefinition {
                table_id,
                name: name.to_string(),
                owner: "postgres".to_string(),
                ddl: vec!["CREATE TABLE {shard} (id bigint, payload text)".to_string()],
                foreign_keys: Vec::new(),
            })
            .await;
        self.store
            .insert_partition_row(PartitionRow {
                table_id,
                method,
                distribution_column: (!method.is_reference()).then(|| "id".to_string()),
                colocation_id: colocation,
                replication_model: if method.is_reference() {
                    ReplicationModel::TwoPhaseCommit
                } else {
                    ReplicationModel::Coordinator
                },
            })
            .await;
        self.store
            .insert_shard(Shard::unbounded(shard_id, table_id, ShardStorage::Table))
            .await;
        for node in holders {
            self.store
                .insert_placement(shard_id, node, ShardState::Finalized)
                .await?;
        }
        Ok(shard_id)
    }
}

async fn demo_query(
    config: CoordinatorConfig,
    strategy: Strategy,
    tasks: usize,
    down: Vec<String>,
) -> Result<()> {
    let demo = Demo::new(config, 2).await?;
    for name in &down {
        demo.fleet
            .set_down(&NodeAddr::new(name.clone(), WORKER_PORT))
            .await;
    }

    let ids = UlidGenerator::new(SystemClock);
    let job_id = ids.generate_job_id();
    let mut job = Job::new(job_id, strategy.into());
    for i in 0..tasks {
        let shard_id = ShardId::new(100 + i as u64);
        demo.store
            .insert_shard(Shard::unbounded(shard_id, TableId::new(1), ShardStorage::Table))
            .await;
        let query = format!("SELECT id, payload FROM events_{}", shard_id.get());
        demo.fleet
            .respond(
                query.clone(),
                vec![vec![
                    Row::from_texts([format!("{}", i * 2), format!("shard {i}")]),
                    Row::from_texts([format!("{}", i * 2 + 1), format!("shard {i}")]),
                ]],
            )
            .await;
        // candidates listed out of order on purpose: dispatch sorts them
        job = job.with_task(
            Task::new(ids.generate_task_id(), job_id, query)
                .with_shard(shard_id)
                .with_candidate(worker(2))
                .with_candidate(worker(1)),
        );
    }

    let scope = demo.coordinator.scope();
    let mut stream = demo.coordinator.execute_job(&scope, job).await?;
    while let Some(row) = stream.next_row().await? {
        println!("{}", serde_json::to_string(&row)?);
    }
    stream.close().await?;

    if let Some(record) = scope.job_record(job_id).await {
        info!(job_id = %job_id, state = ?record.state, "job finished");
    }
    Ok(())
}

async fn promote(config: CoordinatorConfig, workers: usize) -> Result<()> {
    let demo = Demo::new(config, workers).await?;
    let table_id = TableId::new(1);
    demo.seed_table(table_id, "events", PartitionMethod::Append, None, &[worker(1)])
        .await?;

    let scope = demo.coordinator.scope();
    let report = demo
        .coordinator
        .promote_to_reference_table(&scope, table_id)
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let row = demo
        .store
        .partition_row(table_id)
        .await?
        .context("partition row missing after promotion")?;
    println!("{}", serde_json::to_string_pretty(&row)?);
    Ok(())
}

async fn sync(config: CoordinatorConfig, workers: usize, tables: usize) -> Result<()> {
    anyhow::ensure!(workers >= 2, "sync needs at least two workers");
    let demo = Demo::new(config, workers).await?;

    // every table is already a reference table on all workers but the newest
    let existing: Vec<NodeAddr> = (1..workers).map(worker).collect();
    let group = demo
        .store
        .create_colocation_group(1, existing.len() as u32, None)
        .await;
    for i in 1..=tables {
        demo.seed_table(
            TableId::new(i as u64),
            &format!("dim_{i}"),
            PartitionMethod::None,
            Some(group),
            &existing,
        )
        .await?;
    }

    let scope = demo.coordinator.scope();
    let report = demo.coordinator.replicate_all_reference_tables(&scope).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(
        transactions = demo.fleet.transaction_count().await,
        "sync finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CoordinatorConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    logging::init_logging(&config.log_level, cli.verbose);

    match cli.command {
        Command::DemoQuery {
            strategy,
            tasks,
            down,
        } => demo_query(config, strategy, tasks, down).await,
        Command::Promote { workers } => promote(config, workers).await,
        Command::Sync { workers, tables } => sync(config, workers, tables).await,
    }
}
