//! deadletter CLI
//!
//! Command-line interface for the retry, dead-letter and alarm pipeline.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use deadletter::alerting::{AlertEvaluator, NotificationChannel, NotificationFanout};
use deadletter::collector::{MetricStore, Pipeline};
use deadletter::config::{Config, LoggingConfig, TelemetryConfig};
use deadletter::db::{PostgresPool, RedisPool};
use deadletter::dispatcher::{Dispatcher, ShouldFailHandler};
use deadletter::dlq::{self, DepthSampler, RetentionSweeper};
use deadletter::models::{AlarmRule, DeliveryOutcome, Event};

/// Longest accepted event line
const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// deadletter - Retry, dead-letter and alarm pipeline for event handlers
#[derive(Parser)]
#[command(name = "deadletter")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "DEADLETTER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch NDJSON events and run the alarm pipeline
    Serve {
        /// Read events from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Exit once the input is exhausted instead of waiting for Ctrl+C.
        /// Alarms are judged one last time, open windows included, before exiting.
        #[arg(long)]
        once: bool,

        /// NDJSON file that receives events handed back on shutdown, ready for replay
        #[arg(long, default_value = "deadletter-handback.ndjson")]
        handback: PathBuf,
    },

    /// Dispatch a single event
    Send {
        /// Event source
        #[arg(long, default_value = "deadletter.cli")]
        source: String,

        /// Event type
        #[arg(long, default_value = "Manual")]
        detail_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        detail: String,

        /// Ask the reference handler to fail every attempt
        #[arg(long)]
        should_fail: bool,
    },

    /// Inspect and manage the dead-letter store
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Inspect alarm rules
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// Show the number of stored records
    Depth,

    /// Remove and print the oldest records
    Drain {
        /// Maximum number of records
        #[arg(long, default_value = "100")]
        limit: usize,

        /// Append drained records to this NDJSON file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove records past the retention horizon
    Sweep,
}

#[derive(Subcommand)]
enum RulesCommands {
    /// List the effective alarm rules
    List,

    /// Validate rules and notification channels
    Validate,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,
}

/// Event as written by producers
#[derive(Debug, Serialize, Deserialize)]
struct IncomingEvent {
    source: String,
    #[serde(rename = "detail-type", alias = "detail_type")]
    detail_type: String,
    #[serde(default)]
    detail: serde_json::Value,
}

impl From<IncomingEvent> for Event {
    fn from(incoming: IncomingEvent) -> Self {
        Event::json(incoming.source, incoming.detail_type, &incoming.detail)
    }
}

impl From<&Event> for IncomingEvent {
    fn from(event: &Event) -> Self {
        let detail = serde_json::from_slice(&event.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&event.payload).into_owned())
        });
        Self {
            source: event.source.clone(),
            detail_type: event.detail_type.clone(),
            detail,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    init_tracing(&config.logging, cli.verbose);

    // Execute command
    let result = match cli.command {
        Commands::Serve {
            input,
            once,
            handback,
        } => run_serve(config, input, once, &handback, cli.format).await,
        Commands::Send {
            source,
            detail_type,
            detail,
            should_fail,
        } => run_send(config, source, detail_type, &detail, should_fail, cli.format).await,
        Commands::Dlq { command } => run_dlq(config, command, cli.format).await,
        Commands::Rules { command } => run_rules(&config, command, cli.format),
        Commands::Db { command } => run_db(config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Ok(Config::load(path)?)
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let log_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if logging.format.eq_ignore_ascii_case("json") {
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

fn install_exporter(telemetry: &TelemetryConfig) -> anyhow::Result<()> {
    if let Some(addr) = telemetry.prometheus_listen {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "Prometheus exporter listening");
    }
    Ok(())
}

async fn build_fanout(config: &Config) -> anyhow::Result<NotificationFanout> {
    let needs_redis = config
        .alerting
        .channels
        .iter()
        .any(|c| matches!(c, NotificationChannel::Redis { .. }));
    let redis = if needs_redis {
        let pool = RedisPool::new(&config.redis)?;
        pool.health_check().await?;
        Some(pool)
    } else {
        None
    };

    Ok(NotificationFanout::from_channels(
        &config.alerting.channels,
        config.alerting.delivery_timeout,
        redis.as_ref(),
    )?)
}

async fn run_serve(
    config: Config,
    input: Option<PathBuf>,
    once: bool,
    handback: &Path,
    format: OutputFormat,
) -> anyhow::Result<()> {
    install_exporter(&config.telemetry)?;

    let store = dlq::open(&config).await?;
    let metric_store = Arc::new(MetricStore::new());
    let pipeline = Arc::new(Pipeline::from_config(&config.metrics, metric_store.clone()));
    let fanout = Arc::new(build_fanout(&config).await?);
    let rules = config
        .alerting
        .effective_rules(&config.metrics, &config.dead_letter);
    let evaluator = Arc::new(
        AlertEvaluator::new(rules, metric_store.clone(), fanout)?
            .with_interval(config.alerting.evaluation_interval),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatcher.clone(),
        Arc::new(ShouldFailHandler),
        store.clone(),
        pipeline.clone(),
    ));
    let sweeper = RetentionSweeper::new(store.clone(), config.dead_letter.sweep_interval);
    let sampler = Arc::new(DepthSampler::new(
        store.clone(),
        metric_store,
        &config.metrics.namespace,
        &config.dead_letter.name,
        config.dead_letter.depth_sample_interval,
    ));

    let cancel = CancellationToken::new();
    // The pipeline stops last so that every attempt record reaches the metric store.
    let records_done = CancellationToken::new();
    let pipeline_task = {
        let (pipeline, token) = (pipeline.clone(), records_done.clone());
        tokio::spawn(async move { pipeline.start(token).await })
    };
    let mut background = JoinSet::new();
    {
        let (evaluator, token) = (evaluator.clone(), cancel.clone());
        background.spawn(async move { evaluator.start(token).await });
    }
    {
        let token = cancel.clone();
        background.spawn(async move { sweeper.start(token).await });
    }
    {
        let (sampler, token) = (sampler.clone(), cancel.clone());
        background.spawn(async move { sampler.start(token).await });
    }

    let (tx, rx) = mpsc::channel(config.dispatcher.max_concurrency.max(1) * 4);
    let dispatch = tokio::spawn(dispatcher.run(rx, cancel.clone()));

    info!(
        input = %input.as_deref().map_or("stdin".into(), |p| p.display().to_string()),
        "Reading events"
    );

    let accepted = AtomicU64::new(0);
    let fed = tokio::select! {
        fed = feed_events(input.as_deref(), tx, &accepted) => fed,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, finishing in-flight dispatches");
            cancel.cancel();
            Ok(())
        }
    };
    if let Err(e) = &fed {
        error!(error = %e, "Reading events failed, finishing in-flight dispatches");
        cancel.cancel();
    }
    let received = accepted.load(Ordering::Relaxed);

    let dispatched = dispatch.await;

    if fed.is_ok() && !once && !cancel.is_cancelled() {
        info!("Input exhausted; alarms stay active until Ctrl+C");
        tokio::signal::ctrl_c().await?;
    }

    cancel.cancel();
    while background.join_next().await.is_some() {}
    records_done.cancel();
    pipeline_task.await?;

    if once {
        let now = Utc::now();
        if let Err(e) = sampler.sample(now).await {
            warn!(error = %e, "Failed to sample dead-letter depth");
        }
        let transitions = evaluator.evaluate_final(now).await;
        info!(transitions = transitions.len(), "Final alarm evaluation finished");
    }

    let summary = dispatched??;

    let handed_back: Vec<&Event> = summary
        .cancelled
        .iter()
        .map(|dispatched| &dispatched.event)
        .chain(summary.unsent.iter())
        .collect();
    if !handed_back.is_empty() {
        write_handback(handback, &handed_back).await?;
        warn!(
            count = handed_back.len(),
            path = %handback.display(),
            "Undelivered events written for replay"
        );
    }
    fed?;

    let depth = store.depth().await?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "received": received,
                "delivered": summary.delivered,
                "dead_lettered": summary.dead_lettered,
                "cancelled": summary.cancelled.len(),
                "unsent": summary.unsent.len(),
                "dead_letter_depth": depth,
            })
        ),
        OutputFormat::Text | OutputFormat::Table => {
            println!("Received:      {received}");
            println!("Delivered:     {}", summary.delivered);
            println!("Dead-lettered: {}", summary.dead_lettered);
            println!("Cancelled:     {}", summary.cancelled.len());
            println!("Unsent:        {}", summary.unsent.len());
            println!("DLQ depth:     {depth}");
        }
    }

    Ok(())
}

/// Forward NDJSON events into the dispatcher, counting accepted events in `accepted`
async fn feed_events(
    input: Option<&Path>,
    tx: mpsc::Sender<Event>,
    accepted: &AtomicU64,
) -> anyhow::Result<()> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = match input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };

    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_EVENT_BYTES));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(max_bytes = MAX_EVENT_BYTES, "Skipping oversized event line");
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<IncomingEvent>(&line) {
            Ok(incoming) => {
                if tx.send(incoming.into()).await.is_err() {
                    warn!("Dispatcher stopped accepting events");
                    break;
                }
                accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "Skipping malformed event line"),
        }
    }

    Ok(())
}

/// Append events to an NDJSON file in the format `serve` reads
async fn write_handback(path: &Path, events: &[&Event]) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    for event in events {
        let mut line = serde_json::to_string(&IncomingEvent::from(*event))?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
    }
    file.sync_all().await?;
    Ok(())
}

async fn run_send(
    config: Config,
    source: String,
    detail_type: String,
    detail: &str,
    should_fail: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let mut detail: serde_json::Value = serde_json::from_str(detail)?;
    if should_fail {
        if let Some(object) = detail.as_object_mut() {
            object.insert("shouldFail".to_string(), serde_json::Value::Bool(true));
        }
    }

    let store = dlq::open(&config).await?;
    let metric_store = Arc::new(MetricStore::new());
    let pipeline = Arc::new(Pipeline::from_config(&config.metrics, metric_store.clone()));
    let dispatcher = Dispatcher::new(
        config.dispatcher.clone(),
        Arc::new(ShouldFailHandler),
        store,
        pipeline.clone(),
    );

    let cancel = CancellationToken::new();
    let pipeline_task = {
        let (pipeline, token) = (pipeline.clone(), cancel.clone());
        tokio::spawn(async move { pipeline.start(token).await })
    };

    let outcome = dispatcher
        .dispatch(Event::json(source, detail_type, &detail))
        .await?;

    cancel.cancel();
    pipeline_task.await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text | OutputFormat::Table => match outcome {
            DeliveryOutcome::Delivered { sequence, attempts } => {
                println!("Event {sequence} delivered after {attempts} attempt(s)");
            }
            DeliveryOutcome::DeadLettered {
                sequence,
                attempts,
                record_id,
            } => {
                println!("Event {sequence} dead-lettered after {attempts} attempt(s) as {record_id}");
            }
            DeliveryOutcome::Cancelled {
                sequence, attempts, ..
            } => {
                println!("Event {sequence} cancelled after {attempts} attempt(s)");
            }
        },
    }
    println!("Metric samples: {}", pipeline.stats().samples_extracted);

    Ok(())
}

async fn run_dlq(config: Config, command: DlqCommands, format: OutputFormat) -> anyhow::Result<()> {
    let store = dlq::open(&config).await?;

    match command {
        DlqCommands::Depth => {
            let depth = store.depth().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "depth": depth })),
                OutputFormat::Text | OutputFormat::Table => println!("{depth}"),
            }
        }
        DlqCommands::Drain { limit, output } => {
            let records = store.drain(limit).await?;

            if let Some(path) = output {
                use tokio::io::AsyncWriteExt;

                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                for record in &records {
                    let mut line = serde_json::to_string(record)?;
                    line.push('\n');
                    file.write_all(line.as_bytes()).await?;
                }
                file.sync_all().await?;
                println!("Drained {} record(s) into {}", records.len(), path.display());
                return Ok(());
            }

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                OutputFormat::Text => {
                    for record in &records {
                        println!("{}", serde_json::to_string(record)?);
                    }
                }
                OutputFormat::Table => {
                    println!(
                        "{:<36}  {:>8}  {:<24}  {:<20}  {:>8}",
                        "ID", "SEQUENCE", "SOURCE", "TYPE", "ATTEMPTS"
                    );
                    for record in &records {
                        println!(
                            "{:<36}  {:>8}  {:<24}  {:<20}  {:>8}",
                            record.id,
                            record.event.sequence,
                            record.event.event.source,
                            record.event.event.detail_type,
                            record.attempts
                        );
                    }
                }
            }
        }
        DlqCommands::Sweep => {
            let sweeper = RetentionSweeper::new(store, config.dead_letter.sweep_interval);
            let removed = sweeper.sweep(Utc::now()).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
                OutputFormat::Text | OutputFormat::Table => {
                    println!("Removed {removed} expired record(s)");
                }
            }
        }
    }

    Ok(())
}

fn run_rules(config: &Config, command: RulesCommands, format: OutputFormat) -> anyhow::Result<()> {
    let rules = config
        .alerting
        .effective_rules(&config.metrics, &config.dead_letter);

    match command {
        RulesCommands::List => print_rules(&rules, format)?,
        RulesCommands::Validate => {
            for rule in &rules {
                rule.validate()?;
            }
            for channel in &config.alerting.channels {
                channel.validate()?;
            }
            println!(
                "{} rule(s) and {} channel(s) are valid",
                rules.len(),
                config.alerting.channels.len()
            );
        }
    }

    Ok(())
}

fn print_rules(rules: &[AlarmRule], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rules)?),
        OutputFormat::Text => {
            for rule in rules {
                println!(
                    "{} [{:?}]: {:?} of {} {} {} over {}, {}/{} datapoints",
                    rule.name,
                    rule.severity,
                    rule.statistic,
                    rule.source,
                    rule.operator.symbol(),
                    rule.threshold,
                    humantime::format_duration(rule.window),
                    rule.datapoints_to_alarm,
                    rule.evaluation_periods
                );
            }
        }
        OutputFormat::Table => {
            println!(
                "{:<40}  {:<8}  {:<8}  {:>2}  {:>10}  {:>6}",
                "NAME", "SEVERITY", "STAT", "OP", "THRESHOLD", "WINDOW"
            );
            for rule in rules {
                println!(
                    "{:<40}  {:<8}  {:<8}  {:>2}  {:>10}  {:>6}",
                    rule.name,
                    format!("{:?}", rule.severity),
                    format!("{:?}", rule.statistic),
                    rule.operator.symbol(),
                    rule.threshold,
                    humantime::format_duration(rule.window).to_string()
                );
            }
        }
    }
    Ok(())
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    match command {
        DbCommands::Migrate => {
            let pool = PostgresPool::new(&config.database).await?;
            pool.migrate().await?;
            println!("Migrations applied");
        }
    }
    Ok(())
}
