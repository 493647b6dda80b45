//! Command line surface of `lector`.
//!
//! 各フラグは環境変数からも与えられます（`LECTOR_*`）。

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use lector_core::domain::{OrphanPolicy, SubmitMode};
use lector_core::ports::HistoryFilter;

#[derive(Debug, Parser)]
#[command(name = "lector", version, about = "Priority transcription queue")]
pub struct Cli {
    /// SQLite database holding the task table.
    #[arg(long, env = "LECTOR_DB", default_value = "lector.db", global = true)]
    pub db: PathBuf,

    /// Directory for uploaded audio files.
    #[arg(long, env = "LECTOR_AUDIO_DIR", default_value = "audio", global = true)]
    pub audio_dir: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LECTOR_LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run workers until interrupted.
    Serve(ServeArgs),
    /// Run workers until the queue is empty, then exit.
    Run(ServeArgs),
    /// Submit an audio file.
    Submit(SubmitArgs),
    /// Show one task.
    Status {
        task_id: String,
        /// Print the transcript as merged speaker lines.
        #[arg(long)]
        lines: bool,
    },
    /// Cancel a queued task.
    Cancel { task_id: String },
    /// Most recently submitted tasks.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Finished tasks, newest first.
    History {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 50)]
        page_size: usize,
        /// all | done | failed
        #[arg(long, default_value = "all")]
        filter: HistoryFilter,
    },
    /// Queue counts, depth, pending and running tasks.
    Snapshot,
    /// Throughput and wait statistics over a window.
    Stats {
        #[arg(long, default_value = "3600", value_parser = parse_duration)]
        window_secs: Duration,
        /// Worker count used for the load figure.
        #[arg(long, env = "LECTOR_WORKERS", default_value_t = 1)]
        workers: usize,
    },
    /// One retention pass: delete old audio, optionally prune records.
    Prune(RetentionArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// What to do with tasks left Running by a previous process: requeue | fail
    #[arg(long, env = "LECTOR_ORPHAN_POLICY")]
    pub orphan_policy: OrphanPolicy,

    #[arg(long, env = "LECTOR_WORKERS", default_value_t = 1)]
    pub workers: usize,

    #[arg(long, env = "LECTOR_MAX_QUEUE_SIZE", default_value_t = 10)]
    pub max_queue_size: usize,

    /// Engine program. Audio is piped to its stdin, JSON is read from stdout.
    #[arg(long, env = "LECTOR_ENGINE_CMD")]
    pub engine_cmd: String,

    /// Extra argument for the engine program (repeatable).
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    pub engine_args: Vec<String>,

    /// Kill the engine after this many seconds.
    #[arg(long, env = "LECTOR_ENGINE_TIMEOUT_SECS", value_parser = parse_duration)]
    pub engine_timeout_secs: Option<Duration>,

    #[arg(long, default_value = "300", value_parser = parse_duration)]
    pub sync_timeout_secs: Duration,

    #[command(flatten)]
    pub retention: RetentionArgs,

    /// How long in-flight tasks may keep running after a shutdown request.
    #[arg(long, default_value = "30", value_parser = parse_duration)]
    pub shutdown_grace_secs: Duration,
}

#[derive(Debug, Args)]
pub struct RetentionArgs {
    /// Audio of tasks finished longer ago than this is deleted.
    #[arg(long, env = "LECTOR_RETENTION_SECS", default_value = "1800", value_parser = parse_duration)]
    pub retention_secs: Duration,

    #[arg(long, default_value = "3600", value_parser = parse_duration)]
    pub retention_interval_secs: Duration,

    /// Delete finished task records older than this.
    #[arg(long, env = "LECTOR_PRUNE_RECORDS_SECS", value_parser = parse_duration)]
    pub prune_records_secs: Option<Duration>,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    pub file: PathBuf,

    /// 1 (lowest) to 100 (highest).
    #[arg(long, default_value_t = 10)]
    pub priority: i64,

    /// sync waits for the transcript, async returns the queued task.
    #[arg(long, default_value = "async")]
    pub mode: SubmitMode,

    #[arg(long, env = "LECTOR_MAX_QUEUE_SIZE", default_value_t = 10)]
    pub max_queue_size: usize,

    #[arg(long, default_value = "300", value_parser = parse_duration)]
    pub sync_timeout_secs: Duration,
}

fn parse_duration(arg: &str) -> Result<Duration, std::num::ParseIntError> {
    let seconds = arg.parse()?;
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_requires_orphan_policy() {
        let err = Cli::try_parse_from(["lector", "serve", "--engine-cmd", "whisper"]);
        // the env var may be set on the test host
        if std::env::var_os("LECTOR_ORPHAN_POLICY").is_none() {
            assert!(err.is_err());
        }
    }

    #[test]
    fn serve_flags() {
        let cli = Cli::try_parse_from([
            "lector",
            "--db",
            "/tmp/q.db",
            "serve",
            "--orphan-policy",
            "requeue",
            "--workers",
            "3",
            "--engine-cmd",
            "whisper",
            "--engine-arg",
            "--model",
            "--engine-arg",
            "base",
            "--retention-secs",
            "60",
        ])
        .unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/q.db"));
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.orphan_policy, OrphanPolicy::Requeue);
        assert_eq!(args.workers, 3);
        assert_eq!(args.engine_args, vec!["--model", "base"]);
        assert_eq!(args.retention.retention_secs, Duration::from_secs(60));
    }

    #[test]
    fn submit_defaults() {
        let cli = Cli::try_parse_from(["lector", "submit", "talk.wav"]).unwrap();
        let Command::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.priority, 10);
        assert_eq!(args.mode, SubmitMode::Async);
        assert_eq!(args.sync_timeout_secs, Duration::from_secs(300));
    }

    #[test]
    fn history_filter_is_parsed() {
        let cli = Cli::try_parse_from(["lector", "history", "--filter", "failed"]).unwrap();
        let Command::History { filter, .. } = cli.command else {
            panic!("expected history");
        };
        assert_eq!(filter, HistoryFilter::Failed);
        assert!(Cli::try_parse_from(["lector", "history", "--filter", "lost"]).is_err());
    }
}
