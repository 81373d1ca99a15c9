//! CLI command definitions for uptime-stream.
//!
//! Every tunable can be given as a flag or through its environment
//! variable; flags win.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ServiceConfig, DEFAULT_CONSUMER, DEFAULT_GROUP, DEFAULT_STREAM_KEY};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::probe::HttpProbe;
use crate::scheduler::{
    BatchProcessor, Location, PoolError, ProduceOutcome, Producer, Reclaimer, WorkItem, Worker,
    WorkerPool,
};
use crate::storage::Database;
use crate::stream::{DurableLog, RedisStreamLog};

/// Distributed uptime checks over a Redis stream.
#[derive(Parser)]
#[command(name = "uptime-stream")]
#[command(about = "Distribute uptime checks across workers with a Redis stream")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(flatten)]
    pub service: ServiceArgs,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the producer, worker and reclaimer loops until interrupted.
    Run(RunArgs),

    /// Run a single producer pass and exit.
    #[command(name = "produce-once")]
    ProduceOnce,

    /// Show stream, pending and dead-letter counts.
    Stats(StatsArgs),

    /// Create or update the database schema.
    Migrate,

    /// Register a monitor, or change the URL of an existing one.
    #[command(name = "add-monitor")]
    AddMonitor(AddMonitorArgs),
}

/// Loop roles a process can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Producer,
    Worker,
    Reclaimer,
}

/// Arguments for `uptime-stream run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Roles to run, comma separated.
    #[arg(
        long,
        value_enum,
        value_delimiter = ',',
        default_values_t = vec![Role::Producer, Role::Worker, Role::Reclaimer]
    )]
    pub roles: Vec<Role>,

    /// Number of worker loops. Extra workers get a numeric suffix on the
    /// consumer name.
    #[arg(long, default_value = "1")]
    pub workers: usize,
}

/// Arguments for `uptime-stream stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Also print the Prometheus exposition.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `uptime-stream add-monitor`.
#[derive(Parser, Debug)]
pub struct AddMonitorArgs {
    /// Monitor identifier carried on every work item.
    #[arg(long)]
    pub id: String,

    /// URL to check.
    #[arg(long)]
    pub url: String,

    /// Owning user, stored for reference.
    #[arg(long)]
    pub user_id: Option<String>,
}

/// Connection and tuning options shared by every command.
#[derive(clap::Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Stream key work items are appended to.
    #[arg(long, env = "STREAM_KEY", default_value = DEFAULT_STREAM_KEY, global = true)]
    pub stream_key: String,

    /// Consumer group name.
    #[arg(long, env = "CONSUMER_GROUP", default_value = DEFAULT_GROUP, global = true)]
    pub group: String,

    /// Consumer name of this worker. "auto" picks a random unique name.
    #[arg(long, env = "CONSUMER_NAME", default_value = DEFAULT_CONSUMER, global = true)]
    pub consumer: String,

    /// Identity the reclaimer claims stuck entries under.
    #[arg(long, env = "RECLAIMER_NAME", default_value = "pel-reclaimer", global = true)]
    pub reclaimer_name: String,

    /// Region stamped on every result.
    #[arg(long, env = "CHECK_LOCATION", value_enum, ignore_case = true, default_value = "india", global = true)]
    pub location: Location,

    /// Entries per read.
    #[arg(long, env = "BATCH_SIZE", default_value = "10", global = true)]
    pub batch_size: usize,

    /// Long-poll timeout of a read, in milliseconds.
    #[arg(long, env = "BLOCK_TIMEOUT_MS", default_value = "5000", global = true)]
    pub block_timeout_ms: u64,

    /// Time between reclaimer ticks, in milliseconds.
    #[arg(long, env = "RECLAIM_INTERVAL_MS", default_value = "10000", global = true)]
    pub reclaim_interval_ms: u64,

    /// Idle time after which a pending entry is reclaimed, in milliseconds.
    #[arg(long, env = "STUCK_THRESHOLD_MS", default_value = "30000", global = true)]
    pub stuck_threshold_ms: u64,

    /// Stuck entries handled per reclaimer tick.
    #[arg(long, env = "PENDING_PAGE_SIZE", default_value = "10", global = true)]
    pub page_size: usize,

    /// Deliveries before an entry is dead-lettered (0 = never).
    #[arg(long, env = "MAX_DELIVERIES", default_value = "5", global = true)]
    pub max_deliveries: u64,

    /// Items per producer append.
    #[arg(long, env = "PRODUCER_CHUNK_SIZE", default_value = "500", global = true)]
    pub chunk_size: usize,

    /// Time between producer passes, in milliseconds.
    #[arg(long, env = "PRODUCE_INTERVAL_MS", default_value = "60000", global = true)]
    pub produce_interval_ms: u64,

    /// Per-request probe timeout, in milliseconds.
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value = "10000", global = true)]
    pub probe_timeout_ms: u64,

    /// Grace period for loops to stop on shutdown, in seconds.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "30", global = true)]
    pub shutdown_timeout_secs: u64,
}

impl ServiceArgs {
    pub fn to_config(&self) -> ServiceConfig {
        let consumer = if self.consumer == "auto" {
            format!("worker-{}", Uuid::new_v4().simple())
        } else {
            self.consumer.clone()
        };

        ServiceConfig {
            redis_url: self.redis_url.clone(),
            database_url: self.database_url.clone(),
            stream_key: self.stream_key.clone(),
            group: self.group.clone(),
            consumer,
            reclaimer_name: self.reclaimer_name.clone(),
            location: self.location,
            batch_size: self.batch_size,
            block_timeout: Duration::from_millis(self.block_timeout_ms),
            reclaim_interval: Duration::from_millis(self.reclaim_interval_ms),
            stuck_threshold: Duration::from_millis(self.stuck_threshold_ms),
            page_size: self.page_size,
            max_deliveries: self.max_deliveries,
            chunk_size: self.chunk_size,
            produce_interval: Duration::from_millis(self.produce_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;

    let config = cli.service.to_config();
    // These only touch the database.
    if !matches!(cli.command, Commands::Migrate | Commands::AddMonitor(_)) {
        config.validate()?;
    }

    match cli.command {
        Commands::Run(args) => run_service_command(config, args).await?,
        Commands::ProduceOnce => run_produce_once_command(config).await?,
        Commands::Stats(args) => run_stats_command(config, args).await?,
        Commands::Migrate => run_migrate_command(config).await?,
        Commands::AddMonitor(args) => run_add_monitor_command(config, args).await?,
    }
    Ok(())
}

async fn connect_log(config: &ServiceConfig) -> anyhow::Result<Arc<RedisStreamLog>> {
    let log = RedisStreamLog::connect(&config.stream_config()?).await?;
    if log.ensure_group(&config.group).await? {
        info!(stream = %config.stream_key, group = %config.group, "Created consumer group");
    }
    Ok(Arc::new(log))
}

async fn connect_database(config: &ServiceConfig) -> anyhow::Result<Arc<Database>> {
    let db = Database::connect(config.require_database_url()?).await?;
    Ok(Arc::new(db))
}

fn worker_name(base: &str, index: usize, total: usize) -> String {
    if total <= 1 {
        base.to_string()
    } else {
        format!("{}-{}", base, index + 1)
    }
}

async fn run_service_command(config: ServiceConfig, args: RunArgs) -> anyhow::Result<()> {
    if args.roles.is_empty() {
        anyhow::bail!("--roles must name at least one of producer, worker, reclaimer");
    }

    let log = connect_log(&config).await?;
    let db = connect_database(&config).await?;
    let probe = Arc::new(HttpProbe::new(config.probe_timeout)?);

    let mut pool = WorkerPool::new(config.pool_config());
    let stats = pool.shared_stats();

    let processor = Arc::new(
        BatchProcessor::new(
            log.clone(),
            probe,
            db.clone(),
            config.group.clone(),
            config.location,
        )
        .with_stats(Arc::clone(&stats)),
    );

    if args.roles.contains(&Role::Producer) {
        let producer = Producer::new(log.clone(), db.clone(), config.producer_config())
            .with_stats(Arc::clone(&stats));
        pool = pool.with_producer(Arc::new(producer));
    }

    if args.roles.contains(&Role::Worker) {
        let total = args.workers.max(1);
        for index in 0..total {
            let mut worker_config = config.worker_config();
            worker_config.consumer = worker_name(&config.consumer, index, total);
            pool = pool.with_worker(Arc::new(Worker::new(
                Arc::clone(&processor),
                worker_config,
            )));
        }
    }

    if args.roles.contains(&Role::Reclaimer) {
        let reclaimer = Reclaimer::new(Arc::clone(&processor), config.reclaimer_config());
        pool = pool.with_reclaimer(Arc::new(reclaimer));
    }

    pool.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt, shutting down");

    match pool.shutdown().await {
        Ok(()) => {}
        Err(PoolError::ShutdownTimeout(timeout)) => {
            warn!(timeout_secs = timeout.as_secs(), "Loops did not stop in time, aborted");
        }
        Err(e) => return Err(e.into()),
    }

    let final_stats = pool.stats();
    info!(
        checks_persisted = final_stats.checks_persisted,
        acks = final_stats.acks,
        reclaimed = final_stats.reclaimed,
        dead_lettered = final_stats.dead_lettered,
        persist_failures = final_stats.persist_failures,
        "Final pool statistics"
    );
    debug!(metrics = %export_metrics(), "Final metrics");

    Ok(())
}

async fn run_produce_once_command(config: ServiceConfig) -> anyhow::Result<()> {
    let log = connect_log(&config).await?;
    let db = connect_database(&config).await?;
    let producer = Producer::new(log, db, config.producer_config());

    match producer.produce_once().await? {
        ProduceOutcome::Completed(report) => {
            println!(
                "Appended {} of {} work items ({} chunks failed)",
                report.appended, report.discovered, report.failed_chunks
            );
        }
        ProduceOutcome::Skipped => println!("A producer pass is already running"),
    }

    Ok(())
}

/// Snapshot printed by `uptime-stream stats`.
#[derive(Debug, Serialize)]
struct StatsReport {
    stream: String,
    group: String,
    stream_len: u64,
    pending: u64,
    dead_letters: u64,
    /// Persisted results, when a database is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<i64>,
}

async fn run_stats_command(config: ServiceConfig, args: StatsArgs) -> anyhow::Result<()> {
    let log = connect_log(&config).await?;

    let pending = log.pending_summary(&config.group).await?.count;
    MetricsCollector::new().set_pending(&config.group, pending);

    let report = StatsReport {
        stream: config.stream_key.clone(),
        group: config.group.clone(),
        stream_len: log.stream_len().await?,
        pending,
        dead_letters: log.dead_letter_len().await?,
        results: None,
    };
    let report = match config.require_database_url() {
        Ok(_) => StatsReport {
            results: Some(connect_database(&config).await?.count_results().await?),
            ..report
        },
        Err(_) => report,
    };

    if args.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json);
    } else {
        println!("Stream:        {}", report.stream);
        println!("Group:         {}", report.group);
        println!("Entries:       {}", report.stream_len);
        println!("Pending:       {}", report.pending);
        println!("Dead letters:  {}", report.dead_letters);
        if let Some(results) = report.results {
            println!("Results:       {}", results);
        }
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

async fn run_migrate_command(config: ServiceConfig) -> anyhow::Result<()> {
    let db = connect_database(&config).await?;
    let applied = db.run_migrations().await?;
    println!("Applied {} migration(s)", applied);
    for migration in db.applied_migrations().await? {
        println!("  {}  {}", migration.applied_at.format("%Y-%m-%d %H:%M:%S"), migration.name);
    }
    Ok(())
}

async fn run_add_monitor_command(config: ServiceConfig, args: AddMonitorArgs) -> anyhow::Result<()> {
    let item = WorkItem::new(args.id, args.url);
    if item.monitor_id.trim().is_empty() || item.url.trim().is_empty() {
        anyhow::bail!("--id and --url must not be empty");
    }

    let db = connect_database(&config).await?;
    db.upsert_monitor(&item, args.user_id.as_deref()).await?;
    println!("Registered monitor {} -> {}", item.monitor_id, item.url);
    Ok(())
}
