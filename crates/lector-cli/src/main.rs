mod cli;
mod engine;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lector_core::app::{App, RetentionLoop};
use lector_core::domain::{OrphanPolicy, TaskId, Transcript};
use lector_core::impls::{LocalAudioStore, SqliteTaskStore};
use lector_core::ports::{Clock, HistoryQuery, IdGenerator, SystemClock, UlidGenerator};
use lector_core::{AppBuilder, QueueConfig, QueueError, QueueManager};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, RetentionArgs, ServeArgs, SubmitArgs};
use crate::engine::CommandTranscriber;

const DRAIN_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<QueueError>() {
                Some(q) => eprintln!("error [{}]: {err:#}", q.kind().status_code()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let stores = Stores::open(&cli.db, &cli.audio_dir).await?;

    match cli.command {
        Command::Serve(args) => serve(stores, args, false).await,
        Command::Run(args) => serve(stores, args, true).await,
        Command::Submit(args) => submit(stores, args).await,
        Command::Status { task_id, lines } => {
            let manager = stores.connect(client_config()).await?;
            let task = manager.status(parse_id(&task_id)?).await?;
            match (&task.result, lines) {
                (Some(transcript), true) => print_lines(transcript),
                _ => print_json(&task),
            }
        }
        Command::Cancel { task_id } => {
            let manager = stores.connect(client_config()).await?;
            print_json(&manager.cancel(parse_id(&task_id)?).await?)
        }
        Command::Recent { limit } => {
            let manager = stores.connect(client_config()).await?;
            print_json(&manager.list_recent(limit).await?)
        }
        Command::History {
            page,
            page_size,
            filter,
        } => {
            let manager = stores.connect(client_config()).await?;
            let query = HistoryQuery::new(page, page_size, filter)?;
            print_json(&manager.history(&query).await?)
        }
        Command::Snapshot => {
            let manager = stores.connect(client_config()).await?;
            print_json(&manager.snapshot().await?)
        }
        Command::Stats {
            window_secs,
            workers,
        } => {
            let manager = stores.connect(client_config()).await?;
            print_json(&manager.statistics(window_secs, workers).await?)
        }
        Command::Prune(args) => prune(stores, args).await,
    }
}

/// Process-wide stores shared by every command.
struct Stores {
    tasks: Arc<SqliteTaskStore>,
    audio: Arc<LocalAudioStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Stores {
    async fn open(db: &Path, audio_dir: &Path) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
        let tasks = SqliteTaskStore::open(db)
            .with_context(|| format!("opening task database {}", db.display()))?;
        let audio = LocalAudioStore::open(audio_dir, ids.clone())
            .await
            .with_context(|| format!("opening audio directory {}", audio_dir.display()))?;
        Ok(Self {
            tasks: Arc::new(tasks),
            audio: Arc::new(audio),
            clock,
            ids,
        })
    }

    fn builder(&self, config: QueueConfig) -> AppBuilder {
        AppBuilder::new(config)
            .task_store(self.tasks.clone())
            .audio_store(self.audio.clone())
            .clock(self.clock.clone())
            .id_generator(self.ids.clone())
    }

    async fn connect(&self, config: QueueConfig) -> Result<Arc<QueueManager>> {
        self.builder(config)
            .connect()
            .await
            .context("connecting to the queue")
    }
}

/// Config for commands that never start workers. `connect` performs no
/// orphan recovery, so the policy is not consulted.
fn client_config() -> QueueConfig {
    QueueConfig::new(OrphanPolicy::Fail)
}

fn serve_config(args: &ServeArgs) -> QueueConfig {
    let mut config = QueueConfig::new(args.orphan_policy);
    config.worker_count = args.workers;
    config.max_queue_size = args.max_queue_size;
    config.sync_timeout = args.sync_timeout_secs;
    config.retention_horizon = args.retention.retention_secs;
    config.retention_interval = args.retention.retention_interval_secs;
    config.prune_records_after = args.retention.prune_records_secs;
    config
}

async fn serve(stores: Stores, args: ServeArgs, drain: bool) -> Result<()> {
    let engine = CommandTranscriber::new(args.engine_cmd.clone(), args.engine_args.clone())
        .with_timeout(args.engine_timeout_secs);
    let app = stores
        .builder(serve_config(&args))
        .transcriber(Arc::new(engine))
        .start()
        .await
        .context("starting lector")?;

    if !app.recovered().is_empty() {
        info!(count = app.recovered().len(), "orphaned tasks handled at startup");
    }

    if drain {
        wait_until_drained(&app).await?;
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        info!("shutdown requested");
    }

    let aborted = app.shutdown(args.shutdown_grace_secs).await;
    if aborted > 0 {
        anyhow::bail!("{aborted} worker(s) did not finish within the grace period");
    }
    Ok(())
}

async fn wait_until_drained(app: &App) -> Result<()> {
    loop {
        let counts = app.manager().counts().await?;
        if counts.queued == 0 && counts.running == 0 {
            info!(done = counts.done, failed = counts.failed, "queue drained");
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(DRAIN_POLL) => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                info!("shutdown requested");
                return Ok(());
            }
        }
    }
}

async fn submit(stores: Stores, args: SubmitArgs) -> Result<()> {
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let extension = args
        .file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");

    let mut config = client_config();
    config.max_queue_size = args.max_queue_size;
    config.sync_timeout = args.sync_timeout_secs;
    let manager = stores.connect(config).await?;

    let task = manager
        .submit_audio(&bytes, extension, args.priority, args.mode)
        .await?;
    print_json(&task)
}

async fn prune(stores: Stores, args: RetentionArgs) -> Result<()> {
    let retention = RetentionLoop::new(
        stores.tasks.clone(),
        stores.audio.clone(),
        stores.clock.clone(),
        args.retention_secs,
        args.retention_interval_secs,
    )
    .with_pruning(args.prune_records_secs);
    print_json(&retention.run_once().await?)
}

fn parse_id(raw: &str) -> Result<TaskId> {
    raw.parse::<TaskId>()
        .map_err(|e| QueueError::InvalidArgument(e.to_string()).into())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_lines(transcript: &Transcript) -> Result<()> {
    let lines = transcript.speaker_lines(Transcript::DEFAULT_MERGE_GAP);
    if lines.is_empty() {
        println!("{}", transcript.text);
    } else {
        for line in lines {
            println!("{line}");
        }
    }
    Ok(())
}
