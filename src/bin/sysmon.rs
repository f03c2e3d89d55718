use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use sysmon::{
    Reading, TIMESTAMP_FORMAT,
    config::{Config, load_config},
    storage::open_backend,
    supervisor::{
        PortState, StartOutcome, StopOutcome, Supervisor, SystemProcessTable, TokioSpawner,
    },
    thresholds::{self, Metric, ThresholdSet},
    util::init_tracing,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::trace;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Supervise system health monitoring and inspect its data")]
struct Args {
    /// Config file (defaults to $SYSMON_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Start the collector and the ingester
    Start,
    /// Stop both processes and everything they spawned
    Stop,
    /// Report whether monitoring is running
    Status,
    /// Show the most recent reading
    View,
    /// List readings for an inclusive range of days, newest first
    Query {
        /// First day (YYYY-MM-DD)
        start: String,
        /// Last day (YYYY-MM-DD)
        end: String,
    },
    /// Change the threshold of each metric
    #[command(alias = "configure-thresholds")]
    Configure {
        /// Set a limit without prompting, e.g. `--set cpu_usage=85`
        #[arg(long = "set", value_name = "METRIC=LIMIT")]
        set: Vec<String>,
    },
    /// Kill stray processes, drop stale state and wait for the port
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("sysmon");
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Start => start(&config, args.config.as_deref()).await,
        Command::Stop => stop(&config).await,
        Command::Status => status(&config).await,
        Command::View => view(&config).await,
        Command::Query { start, end } => query(&config, &start, &end).await,
        Command::Configure { set } => configure(&config, &set).await,
        Command::Reconcile => reconcile(&config).await,
    }
}

fn supervisor(
    config: &Config,
    config_path: Option<&Path>,
) -> anyhow::Result<Supervisor<SystemProcessTable, TokioSpawner>> {
    let mut spawner = TokioSpawner::new();
    if let Some(path) = config_path {
        // children read the same configuration
        let path = std::path::absolute(path)
            .with_context(|| format!("cannot resolve {}", path.display()))?;
        spawner = spawner.with_env("SYSMON_CONFIG", path.to_string_lossy());
    }

    Ok(Supervisor::new(config, SystemProcessTable::new(), spawner)?)
}

async fn start(config: &Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut supervisor = supervisor(config, config_path)?;

    match supervisor.start().await? {
        StartOutcome::Started(record) => println!(
            "Monitoring started (collector pid {}, ingester pid {})",
            record.collector_pid, record.ingester_pid
        ),
        StartOutcome::AlreadyRunning(record) => println!(
            "Monitoring is already running (collector pid {}, ingester pid {})",
            record.collector_pid, record.ingester_pid
        ),
    }

    Ok(())
}

async fn stop(config: &Config) -> anyhow::Result<()> {
    let mut supervisor = supervisor(config, None)?;

    match supervisor.stop().await? {
        StopOutcome::Stopped { killed, .. } => {
            println!("Monitoring stopped ({} processes terminated)", killed.len())
        }
        StopOutcome::NotRunning => println!("Monitoring is not running"),
    }

    Ok(())
}

async fn reconcile(config: &Config) -> anyhow::Result<()> {
    let mut supervisor = supervisor(config, None)?;
    let report = supervisor.reconcile().await?;

    if report.killed.is_empty() {
        println!("No stray processes found");
    } else {
        println!("Terminated stray processes: {:?}", report.killed);
    }
    if report.removed_record {
        println!("Removed stale lifecycle record");
    }
    match report.port {
        PortState::Skipped => println!("Monitoring is running, port left alone"),
        _ => println!("Port {} is free", config.collector.address()),
    }

    Ok(())
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let mut supervisor = supervisor(config, None)?;
    let report = supervisor.status()?;

    println!("Monitoring is {}", report.state);
    if let Some(record) = report.record {
        println!("  collector pid: {}", record.collector_pid);
        println!("  ingester pid:  {}", record.ingester_pid);
        println!("  started at:    {}", record.started_at.format(TIMESTAMP_FORMAT));
    }

    match open_backend(&config.storage).await {
        Ok(backend) => {
            match backend.get_stats().await {
                Ok(stats) => println!("  storage:       {stats}"),
                Err(e) => println!("  storage:       unavailable ({e})"),
            }
            backend.close().await?;
        }
        Err(e) => println!("  storage:       unavailable ({e})"),
    }

    Ok(())
}

async fn view(config: &Config) -> anyhow::Result<()> {
    let backend = open_backend(&config.storage).await?;

    match backend.latest().await? {
        Some(reading) => {
            println!("Latest reading ({})", reading.timestamp.format(TIMESTAMP_FORMAT));
            println!("{:<16}{:>12}", "Metric", "Value");
            for metric in Metric::ALL {
                println!(
                    "{:<16}{:>12}",
                    metric.description(),
                    format!("{:.2}{}", metric.value(&reading), metric.unit())
                );
            }
        }
        None => println!("No readings recorded yet"),
    }

    backend.close().await?;
    Ok(())
}

fn parse_day(input: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), DATE_FORMAT)
        .with_context(|| format!("invalid date {input:?}, expected YYYY-MM-DD"))
}

async fn query(config: &Config, start: &str, end: &str) -> anyhow::Result<()> {
    let start = parse_day(start)?;
    let end = parse_day(end)?;
    if end < start {
        bail!("end date {end} is before start date {start}");
    }

    let backend = open_backend(&config.storage).await?;
    let readings = backend
        .query_range(start.and_time(NaiveTime::MIN), end_of_day(end))
        .await?;

    if readings.is_empty() {
        println!("No readings between {start} and {end}");
    } else {
        print_readings(&readings);
    }

    backend.close().await?;
    Ok(())
}

fn end_of_day(day: NaiveDate) -> chrono::NaiveDateTime {
    day.and_hms_opt(23, 59, 59)
        .unwrap_or_else(|| day.and_time(NaiveTime::MIN))
}

fn print_readings(readings: &[Reading]) {
    println!(
        "{:<20}{:>10}{:>10}{:>12}{:>12}",
        "Timestamp", "CPU %", "Mem %", "Disk MB/s", "Net MB/s"
    );
    for reading in readings {
        println!(
            "{:<20}{:>10.2}{:>10.2}{:>12.2}{:>12.2}",
            reading.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            reading.cpu_usage,
            reading.memory_usage,
            reading.disk_io,
            reading.network_usage
        );
    }
}

async fn configure(config: &Config, assignments: &[String]) -> anyhow::Result<()> {
    let backend = open_backend(&config.storage).await?;
    let current = backend.get_thresholds().await?.merged_with_defaults();

    let updated = if assignments.is_empty() {
        let mut stdin = BufReader::new(tokio::io::stdin());
        prompt_limits(&mut stdin, &mut std::io::stdout(), &current).await?
    } else {
        apply_assignments(&current, assignments)?
    };

    for (metric, limit) in updated.iter() {
        backend.set_threshold(metric, limit).await?;
    }

    println!("Thresholds updated:");
    for (metric, limit) in updated.iter() {
        println!("  {:<16}{limit}{}", metric.description(), metric.unit());
    }

    backend.close().await?;
    Ok(())
}

fn apply_assignments(current: &ThresholdSet, assignments: &[String]) -> anyhow::Result<ThresholdSet> {
    let mut updated = current.clone();

    for assignment in assignments {
        let Some((name, value)) = assignment.split_once('=') else {
            bail!("expected METRIC=LIMIT, got {assignment:?}");
        };
        let metric: Metric = name.trim().parse()?;
        let current_limit = updated.limit(metric).unwrap_or(metric.default_limit());
        let limit = thresholds::parse_limit_input(metric, value, current_limit)
            .with_context(|| format!("invalid limit for {metric}"))?;
        updated.set(metric, limit);
    }

    Ok(updated)
}

/// Ask for every metric in turn. Blank input (or end of input) keeps the
/// current limit, invalid input asks again.
async fn prompt_limits<R, W>(
    input: &mut R,
    output: &mut W,
    current: &ThresholdSet,
) -> anyhow::Result<ThresholdSet>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut updated = current.clone();

    for metric in Metric::ALL {
        let current_limit = current.limit(metric).unwrap_or(metric.default_limit());

        loop {
            write!(
                output,
                "{} threshold ({}) [{current_limit}]: ",
                metric.description(),
                metric.unit()
            )?;
            output.flush()?;

            let mut line = String::new();
            if input.read_line(&mut line).await? == 0 {
                writeln!(output)?;
                updated.set(metric, current_limit);
                break;
            }

            match thresholds::parse_limit_input(metric, &line, current_limit) {
                Ok(limit) => {
                    updated.set(metric, limit);
                    break;
                }
                Err(e) => writeln!(output, "{e}")?,
            }
        }
    }

    Ok(updated)
}
