use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

use loadtally::clock::SystemClock;
use loadtally::config::Config;
use loadtally::export::HealthMetrics;
use loadtally::identity::CommandIdentity;
use loadtally::sink::SinkTarget;
use loadtally::{AggregateError, Aggregator, AggregatorSettings};

/// Per-second aggregation of load-test result records.
#[derive(Parser)]
#[command(name = "loadtally", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Raw result file to ingest; reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Host name reported in run lifecycle logs.
    #[arg(long, default_value = "local")]
    host: String,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("loadtally {}", version::full());
        return Ok(());
    }

    // Logs go to stderr so stdout stays free for aggregated rows.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting loadtally",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.runtime.worker_threads)
        .thread_name("loadtally-worker")
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, cli).await })
}

async fn run(cfg: Config, cli: Cli) -> Result<()> {
    let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    if cfg.health.enabled {
        metrics.start().await?;
    }

    let aggregator = Aggregator::new(
        AggregatorSettings::from_config(&cfg),
        SinkTarget::from_path(&cfg.output.path, cfg.output.append),
        Arc::new(CommandIdentity::new(
            cfg.identity.command.clone(),
            cfg.identity.timeout,
        )),
        Arc::new(SystemClock),
        Arc::clone(&metrics),
    )
    .context("creating aggregator")?;

    aggregator.on_run_started(&cli.host).await?;

    let ingest = async {
        match &cli.input {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening input {}", path.display()))?;
                ingest_lines(&aggregator, BufReader::new(file)).await
            }
            None => ingest_lines(&aggregator, BufReader::new(tokio::io::stdin())).await,
        }
    };

    let ingest_result = tokio::select! {
        result = ingest => result,
        _ = shutdown_signal() => Ok(()),
    };

    // The final drain runs even if ingestion failed or was interrupted.
    let report = aggregator.on_run_ended(&cli.host).await?;
    metrics.stop();

    if let Some(report) = report {
        tracing::info!(
            records_ingested = report.stats.records_ingested,
            requests_aggregated = report.stats.requests_aggregated,
            buckets_drained = report.stats.buckets_drained,
            "loadtally stopped",
        );
    }

    ingest_result
}

async fn ingest_lines<R>(aggregator: &Aggregator, reader: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("reading input")? {
        if line.trim().is_empty() {
            continue;
        }
        match aggregator.ingest(&line).await {
            Ok(_) => {}
            Err(AggregateError::MalformedRecord(_) | AggregateError::MalformedKey(_)) => {}
            Err(e) => return Err(e).context("ingesting record"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, stopping ingest"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, stopping ingest"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, stopping ingest");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, stopping ingest");
    }
}
