use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "gphotos2immich",
    version,
    about = "Import Google Photos shared albums into an Immich server"
)]
pub struct Cli {
    /// Directory holding the job database and staged files
    #[arg(long, global = true, env = "GP2I_DATA_DIR", default_value = "~/.gphotos2immich")]
    pub data_dir: String,

    /// Base64 key sealing stored credentials (default: key file in the data dir)
    #[arg(long, global = true, env = "GP2I_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Log level (RUST_LOG overrides)
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue a new import job
    Submit(SubmitArgs),

    /// List all jobs
    List,

    /// Show one job in detail
    Status(StatusArgs),

    /// Follow a job's progress until it stops running
    Watch(WatchArgs),

    /// Cancel a queued, paused or running job
    Cancel(JobArg),

    /// Pause a queued or running job
    Pause(JobArg),

    /// Put a paused job back in the queue
    Resume(JobArg),

    /// Re-queue a finished job so its failed items are tried again
    RetryFailed(JobArg),

    /// Delete a job that is not running, with its staged files
    Delete(JobArg),

    /// Pause every queued job
    PauseQueued,

    /// Delete every queued job
    RemoveQueued,

    /// Check that the Immich server accepts the given credentials
    TestLogin(TestLoginArgs),

    /// Run the worker: admit queued jobs and process them
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JobArg {
    /// Job id (as printed by `submit` or `list`)
    pub id: String,
}

/// Where to import into and how to log in.
#[derive(Args, Debug, Clone)]
pub struct DestinationArgs {
    /// Immich server URL, e.g. https://photos.example.com
    #[arg(long, env = "IMMICH_URL")]
    pub immich_url: String,

    /// Immich API key.
    /// WARNING: passing via --api-key is visible in process listings.
    /// Prefer the IMMICH_API_KEY environment variable instead.
    #[arg(long, env = "IMMICH_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Immich account email (instead of an API key)
    #[arg(long, env = "IMMICH_EMAIL")]
    pub email: Option<String>,

    /// Immich account password (if not provided, will prompt)
    #[arg(long, env = "IMMICH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct TimeoutArgs {
    /// Timeout in seconds for API requests and album pages
    #[arg(long, default_value_t = 60)]
    pub request_timeout: u64,

    /// Timeout in seconds for media downloads and uploads
    #[arg(long, default_value_t = 300)]
    pub transfer_timeout: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub destination: DestinationArgs,

    /// Shared album link (repeatable)
    #[arg(short = 'a', long = "album")]
    pub albums: Vec<String>,

    /// File with one album link per line ("-" reads stdin)
    #[arg(long)]
    pub links_file: Option<PathBuf>,

    /// Upload without creating matching Immich albums
    #[arg(long)]
    pub no_create_album: bool,

    /// Upload even when the server already has the same file
    #[arg(long)]
    pub no_skip_duplicates: bool,

    /// Keep payloads in memory instead of staging them on disk
    #[arg(long)]
    pub no_staging: bool,

    /// Concurrent downloads per job (1-10)
    #[arg(long, default_value_t = 3)]
    pub download_concurrency: usize,

    /// Concurrent uploads per job (1-10)
    #[arg(long, default_value_t = 3)]
    pub upload_concurrency: usize,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    pub id: String,

    /// List failed items with their errors
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    pub id: String,

    /// Seconds between polls of the job database
    #[arg(long, default_value_t = 1)]
    pub interval: u64,

    /// Disable the progress bar and print a line per change
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TestLoginArgs {
    #[command(flatten)]
    pub destination: DestinationArgs,

    #[command(flatten)]
    pub timeouts: TimeoutArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Maximum number of jobs running at once
    #[arg(long, default_value_t = 1)]
    pub max_running_jobs: usize,

    /// Max retries per download, upload or API call (0 = no retries)
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Initial retry delay in seconds
    #[arg(long, default_value_t = 2)]
    pub retry_delay: u64,

    #[command(flatten)]
    pub timeouts: TimeoutArgs,

    /// Seconds between checks for queued jobs and control requests
    #[arg(long, default_value_t = 2)]
    pub poll_interval: u64,

    /// Exit once no job is queued or running
    #[arg(long)]
    pub once: bool,

    /// Send sd_notify messages to systemd
    #[arg(long)]
    pub notify_systemd: bool,
}
