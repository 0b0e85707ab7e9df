//! Deli sequencing service
//!
//! Reads raw document operations from the inbound log, stamps each document's
//! operations with a gapless sequence number, publishes them to the outbound
//! log, and checkpoints sequencer state and inbound offsets.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deli_common::store::FileCheckpointStore;
use deli_sequencer::{DeliConfig, DeliService, ParseErrorPolicy, ServiceHandle};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

mod http;
#[cfg(feature = "kafka")]
mod kafka;
mod shutdown;
mod stdio;

#[derive(Parser, Debug)]
#[command(
    name = "deli-server",
    about = "Deli - per-document ticketing over a partitioned log",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (.toml or .json)
    #[arg(short = 'c', long, env = "DELI_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for sequencer checkpoints
    #[arg(short = 'd', long, env = "DELI_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Port for the metrics endpoint (0 disables it)
    #[arg(short = 'm', long, env = "DELI_METRICS_PORT", default_value = "9464")]
    metrics_port: u16,

    /// Bind address for the metrics endpoint
    #[arg(short = 'b', long, env = "DELI_BIND_ADDR", default_value = "0.0.0.0")]
    bind_addr: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "DELI_LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Consumer group used for offset commits
    #[arg(long, env = "DELI_GROUP_ID")]
    group_id: Option<String>,

    /// Topic carrying raw operations
    #[arg(long, env = "DELI_RECEIVE_TOPIC")]
    receive_topic: Option<String>,

    /// Topic receiving sequenced operations
    #[arg(long, env = "DELI_SEND_TOPIC")]
    send_topic: Option<String>,

    /// Processed records between checkpoints
    #[arg(long, env = "DELI_CHECKPOINT_BATCH_SIZE")]
    checkpoint_batch_size: Option<u64>,

    /// Checkpoint timer in milliseconds
    #[arg(long, env = "DELI_CHECKPOINT_INTERVAL_MS")]
    checkpoint_interval_ms: Option<u64>,

    /// Bound of the intake queue
    #[arg(long, env = "DELI_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// What to do with undecodable records (fail, skip)
    #[arg(long, env = "DELI_PARSE_ERROR_POLICY", value_parser = parse_policy)]
    parse_error_policy: Option<ParseErrorPolicy>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read JSON records from stdin and write sequenced operations to stdout (default)
    Stdio {
        /// File holding committed offsets (defaults to <data-dir>/offsets.json)
        #[arg(long, env = "DELI_OFFSETS_FILE")]
        offsets_file: Option<PathBuf>,

        /// Stop gracefully once stdin is exhausted
        #[arg(long, default_value = "false")]
        exit_on_eof: bool,
    },

    /// Consume from and produce to Kafka
    #[cfg(feature = "kafka")]
    Kafka {
        /// Bootstrap brokers
        #[arg(long, env = "DELI_BROKERS", default_value = "localhost:9092")]
        brokers: String,
    },

    /// Print the effective configuration and exit
    CheckConfig,

    /// Show version information
    Version,
}

fn parse_policy(value: &str) -> std::result::Result<ParseErrorPolicy, String> {
    match value.to_ascii_lowercase().as_str() {
        "fail" => Ok(ParseErrorPolicy::Fail),
        "skip" => Ok(ParseErrorPolicy::Skip),
        other => Err(format!("unknown parse error policy '{}' (expected fail or skip)", other)),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // Logs go to stderr so stdout stays free for the stdio driver.
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// File settings first, then command-line and environment overrides.
fn load_config(cli: &Cli) -> Result<DeliConfig> {
    let mut config = match &cli.config {
        Some(path) => DeliConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => DeliConfig::default(),
    };

    if let Some(group_id) = &cli.group_id {
        config.group_id = group_id.clone();
    }
    if let Some(topic) = &cli.receive_topic {
        config.receive_topic = topic.clone();
    }
    if let Some(topic) = &cli.send_topic {
        config.send_topic = topic.clone();
    }
    if let Some(size) = cli.checkpoint_batch_size {
        config.checkpoint_batch_size = size;
    }
    if let Some(interval) = cli.checkpoint_interval_ms {
        config.checkpoint_interval_ms = interval;
    }
    if let Some(capacity) = cli.queue_capacity {
        config.queue_capacity = capacity;
    }
    if let Some(policy) = cli.parse_error_policy {
        config.parse_error_policy = policy;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);

    let default_command = Commands::Stdio {
        offsets_file: None,
        exit_on_eof: false,
    };
    let command = cli.command.as_ref().unwrap_or(&default_command);

    if let Commands::Version = command {
        println!("deli-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(&cli)?;

    match command {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Stdio {
            offsets_file,
            exit_on_eof,
        } => run_stdio(&cli, config, offsets_file.clone(), *exit_on_eof).await,
        #[cfg(feature = "kafka")]
        Commands::Kafka { brokers } => run_kafka(&cli, config, brokers).await,
        Commands::Version => Ok(()),
    }
}

async fn open_store(cli: &Cli) -> Result<Arc<FileCheckpointStore>> {
    let store = FileCheckpointStore::new(&cli.data_dir)
        .await
        .with_context(|| format!("opening checkpoint store in {}", cli.data_dir.display()))?;
    Ok(Arc::new(store))
}

async fn run_stdio(
    cli: &Cli,
    config: DeliConfig,
    offsets_file: Option<PathBuf>,
    exit_on_eof: bool,
) -> Result<()> {
    let store = open_store(cli).await?;
    let offsets_path = offsets_file.unwrap_or_else(|| cli.data_dir.join("offsets.json"));
    let committer = stdio::FileOffsetCommitter::open(&offsets_path, config.group_id.clone())
        .await
        .with_context(|| format!("opening offsets file {}", offsets_path.display()))?;
    let next_offset = stdio::resume_offset(&committer, &store, 0).await?;

    info!(
        data_dir = %cli.data_dir.display(),
        offsets_file = %offsets_path.display(),
        next_offset = next_offset,
        "Starting stdio driver"
    );

    let consumer = stdio::LineConsumer::new(
        tokio::io::BufReader::new(tokio::io::stdin()),
        config.receive_topic.clone(),
        next_offset,
    );
    let eof = exit_on_eof.then(|| consumer.eof());
    let producer = Arc::new(stdio::LineProducer::new(tokio::io::stdout()));

    let service = DeliService::new(config, consumer, producer, Arc::new(committer), store)?;
    run_service(cli, service, eof).await
}

#[cfg(feature = "kafka")]
async fn run_kafka(cli: &Cli, config: DeliConfig, brokers: &str) -> Result<()> {
    let store = open_store(cli).await?;
    let (consumer, producer, committer) = kafka::connect(brokers, &config)?;

    let service = DeliService::new(
        config,
        consumer,
        Arc::new(producer),
        Arc::new(committer),
        store,
    )?;
    run_service(cli, service, None).await
}

/// Start the service, serve metrics, and stop on signal, on `done`, or when a
/// component fails.
async fn run_service(
    cli: &Cli,
    service: DeliService,
    done: Option<watch::Receiver<bool>>,
) -> Result<()> {
    let handle = service.start();

    if cli.metrics_port != 0 {
        let addr: SocketAddr = format!("{}:{}", cli.bind_addr, cli.metrics_port)
            .parse()
            .context("invalid metrics bind address")?;
        let metrics_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(addr, metrics_handle).await {
                error!(error = %e, "Metrics endpoint failed");
            }
        });
    }

    let result = tokio::select! {
        result = handle.completed() => result,
        signal = shutdown::wait_for_signal() => {
            signal?;
            stop(&handle).await
        }
        _ = input_finished(done) => {
            info!("Input finished");
            stop(&handle).await
        }
    };

    match &result {
        Ok(()) => info!("Deli service exited cleanly"),
        Err(e) => error!(error = %e, "Deli service exited with error"),
    }
    result?;
    Ok(())
}

/// Resolves once `done` flips to true; pends forever otherwise.
async fn input_finished(done: Option<watch::Receiver<bool>>) {
    if let Some(mut done) = done {
        if done.wait_for(|done| *done).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

async fn stop(handle: &ServiceHandle) -> deli_common::Result<()> {
    info!(
        queued = handle.queue_depth(),
        processed = handle.processed(),
        "Stopping deli service"
    );
    handle.stop().await
}
