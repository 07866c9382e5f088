//! telebatch CLI
//!
//! Feeds JSON-lines device readings through a [`BatchEngine`], fetches
//! stored batches, and shows the effective configuration.

mod http_notifier;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use telebatch_core::config::{Config, LogFormat};
use telebatch_core::engine::EngineEvent;
use telebatch_core::ledger::LogNotifier;
use telebatch_core::logging::init_logging;
use telebatch_core::storage::{BatchStore, ContentId, DirStore, TimeoutStore};
use telebatch_core::BatchEngine;

use crate::http_notifier::HttpNotifier;

#[derive(Parser, Debug)]
#[command(
    name = "telebatch",
    version,
    about = "Batch device telemetry into content-addressed uploads"
)]
struct Cli {
    /// Config file (default: <config dir>/telebatch/config.toml when present)
    #[arg(long, short, global = true, env = "TELEBATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Buffer JSON-lines readings, upload them, and print a summary
    Ingest {
        /// Read from FILE instead of stdin
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Batch store directory
        #[arg(long)]
        store: Option<PathBuf>,

        /// Override the batch interval
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Print a stored batch as JSON
    Fetch {
        content_id: String,

        /// Batch store directory
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<telebatch_core::Error>()
                .and_then(telebatch_core::Error::remediation)
            {
                eprint!("\n{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate().context("invalid configuration")?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Commands::Ingest {
            input,
            store,
            interval_ms,
        } => {
            if let Some(ms) = interval_ms {
                config.engine.batch_interval_ms = ms;
            }
            cmd_ingest(&config, input.as_deref(), store.as_deref()).await
        }
        Commands::Fetch { content_id, store } => {
            cmd_fetch(&config, &content_id, store.as_deref()).await
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("telebatch").join("config.toml"))
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.is_file() => Config::load(&path)
            .with_context(|| format!("failed to load config {}", path.display())),
        _ => Ok(Config::default()),
    }
}

fn store_dir(config: &Config, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit.or(config.storage.dir.as_deref()) {
        return Ok(dir.to_path_buf());
    }
    dirs::data_dir()
        .map(|dir| dir.join("telebatch").join("batches"))
        .context("no data directory on this platform; pass --store")
}

fn open_store(config: &Config, explicit: Option<&Path>) -> Result<Arc<dyn BatchStore>> {
    let dir = store_dir(config, explicit)?;
    let store = DirStore::open(&dir)
        .with_context(|| format!("failed to open batch store {}", dir.display()))?;
    info!(dir = %dir.display(), "batch store opened");
    Ok(match config.storage.upload_timeout() {
        Some(timeout) => Arc::new(TimeoutStore::new(store, timeout)),
        None => Arc::new(store),
    })
}

// ── ingest ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct UploadSummary {
    device_id: String,
    content_id: ContentId,
    readings: usize,
}

#[derive(Debug, Serialize)]
struct DeadLetterSummary {
    device_id: String,
    attempts: u32,
    error: String,
    buffered: usize,
}

#[derive(Debug, Serialize)]
struct IngestSummary {
    accepted: u64,
    rejected: u64,
    uploads: Vec<UploadSummary>,
    dead_letters: Vec<DeadLetterSummary>,
    unflushed_readings: usize,
    drained: bool,
}

fn collect_uploads(
    mut events: broadcast::Receiver<EngineEvent>,
    mut stop: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<Vec<UploadSummary>> {
    fn record(uploads: &mut Vec<UploadSummary>, event: EngineEvent) {
        if let EngineEvent::Uploaded {
            device_id,
            content_id,
            readings,
            ..
        } = event
        {
            uploads.push(UploadSummary {
                device_id,
                content_id,
                readings,
            });
        }
    }

    tokio::spawn(async move {
        let mut uploads = Vec::new();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => record(&mut uploads, event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "upload summary missed events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = &mut stop => {
                    loop {
                        match events.try_recv() {
                            Ok(event) => record(&mut uploads, event),
                            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
        uploads
    })
}

async fn cmd_ingest(config: &Config, input: Option<&Path>, store: Option<&Path>) -> Result<()> {
    let store = open_store(config, store)?;
    let builder = BatchEngine::builder(store).config(config.engine.clone());
    let builder = match &config.ledger.endpoint {
        Some(endpoint) => builder.notifier(Arc::new(HttpNotifier::new(endpoint)?)),
        None => builder.notifier(Arc::new(LogNotifier)),
    };
    let engine = builder.build()?;

    let (stop_tx, stop_rx) = oneshot::channel();
    let collector = collect_uploads(engine.subscribe(), stop_rx);

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match input {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut accepted = 0u64;
    let mut rejected = 0u64;
    let mut lines = reader.lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let result = serde_json::from_str::<serde_json::Value>(line)
            .map_err(telebatch_core::Error::from)
            .and_then(|value| engine.ingest_json(value));
        match result {
            Ok(_) => accepted += 1,
            Err(err) => {
                warn!(line = line_no, error = %err, "skipping reading");
                rejected += 1;
            }
        }
    }

    let report = engine.shutdown().await;
    let _ = stop_tx.send(());
    let uploads = collector.await.context("upload collector failed")?;

    let summary = IngestSummary {
        accepted,
        rejected,
        uploads,
        dead_letters: engine
            .dead_letters()
            .into_iter()
            .map(|dead| DeadLetterSummary {
                device_id: dead.device_id,
                attempts: dead.attempts,
                error: dead.error.to_string(),
                buffered: dead.buffered,
            })
            .collect(),
        unflushed_readings: report.unflushed_readings,
        drained: report.drained,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.unflushed_readings > 0 {
        bail!("{} readings were not uploaded", summary.unflushed_readings);
    }
    Ok(())
}

// ── fetch ───────────────────────────────────────────────────────────────

async fn cmd_fetch(config: &Config, content_id: &str, store: Option<&Path>) -> Result<()> {
    let content_id: ContentId = content_id.parse()?;
    let store = open_store(config, store)?;
    let engine = BatchEngine::builder(store).config(config.engine.clone()).build()?;
    let batch = engine
        .retrieve(&content_id)
        .await
        .with_context(|| format!("failed to fetch {content_id}"))?;
    println!("{}", serde_json::to_string_pretty(&batch)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "telebatch",
            "ingest",
            "--store",
            "/tmp/batches",
            "--log-format",
            "json",
            "--interval-ms",
            "5000",
        ])
        .unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Commands::Ingest {
                store, interval_ms, ..
            } => {
                assert_eq!(store, Some(PathBuf::from("/tmp/batches")));
                assert_eq!(interval_ms, Some(5000));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn explicit_store_wins_over_config() {
        let mut config = Config::default();
        config.storage.dir = Some(PathBuf::from("/from/config"));
        assert_eq!(
            store_dir(&config, Some(Path::new("/from/flag"))).unwrap(),
            PathBuf::from("/from/flag")
        );
        assert_eq!(
            store_dir(&config, None).unwrap(),
            PathBuf::from("/from/config")
        );
    }
}
