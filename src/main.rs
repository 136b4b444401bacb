//! Command-line front end and worker for gphotos2immich.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use gphotos2immich::cli::{self, Command};
use gphotos2immich::config::{self, Config, Timeouts, WorkerConfig};
use gphotos2immich::controller::{ControlOutcome, EngineConfig, JobController};
use gphotos2immich::destination::{Destination, ImmichClient, ImmichFactory};
use gphotos2immich::lock::WorkerLock;
use gphotos2immich::secrets::SecretBox;
use gphotos2immich::shutdown;
use gphotos2immich::source::GooglePhotosClient;
use gphotos2immich::staging::StagingManager;
use gphotos2immich::state::{Job, JobStatus, JobStore, SqliteJobStore};
use gphotos2immich::systemd::{SystemdNotifier, WorkerStatus};

/// Zero-content SHA-1 used to exercise the server's checksum lookup.
const EMPTY_CHECKSUM: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";

async fn open_store(config: &Config) -> anyhow::Result<Arc<SqliteJobStore>> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let secrets = SecretBox::load(config.secret_key.as_deref(), &config.key_path())?;
    let store = SqliteJobStore::open(&config.db_path(), secrets).await?;
    tracing::debug!(path = %store.path().display(), "Job database opened");
    Ok(Arc::new(store))
}

/// Controller for one CLI invocation or the worker.
async fn open_controller(
    config: &Config,
    engine: EngineConfig,
    timeouts: Timeouts,
) -> anyhow::Result<Arc<JobController>> {
    let store = open_store(config).await?;
    let source = GooglePhotosClient::new(timeouts.request, timeouts.transfer)?;
    let factory = ImmichFactory {
        request_timeout: timeouts.request,
        transfer_timeout: timeouts.transfer,
    };
    Ok(Arc::new(JobController::new(
        store,
        Arc::new(source),
        Arc::new(factory),
        Arc::new(StagingManager::new(config.staging_dir())),
        engine,
    )))
}

fn default_timeouts() -> Timeouts {
    Timeouts {
        request: Duration::from_secs(60),
        transfer: Duration::from_secs(300),
    }
}

/// Controller for one-shot control commands; it never runs jobs itself.
async fn cli_controller(config: &Config) -> anyhow::Result<Arc<JobController>> {
    open_controller(config, EngineConfig::default(), default_timeouts()).await
}

fn prompt_password() -> Option<String> {
    if !std::io::stdin().is_terminal() {
        return None;
    }
    tokio::task::block_in_place(|| rpassword::prompt_password("Immich password: ").ok())
}

fn print_outcome(id: &str, outcome: ControlOutcome) {
    match outcome {
        ControlOutcome::Applied(status) => println!("Job {} is now {}", id, status),
        ControlOutcome::Requested(request) => println!(
            "Job {} is running; {} requested, it stops at the next item boundary",
            id,
            request.as_str()
        ),
    }
}

fn progress_summary(job: &Job) -> String {
    let p = &job.progress;
    format!(
        "{}/{} items ({:.0}%), albums {}/{}, uploaded {}, skipped {}, failed {}",
        p.items_processed,
        p.total_items,
        p.percent(),
        p.albums_processed,
        p.total_albums,
        p.uploaded,
        p.skipped,
        p.failed
    )
}

async fn run_submit(config: &Config, args: cli::SubmitArgs) -> anyhow::Result<()> {
    let auth = config::auth_from_args(&args.destination, prompt_password)?;
    let links_text = args
        .links_file
        .as_deref()
        .map(config::read_links_file)
        .transpose()?;
    let new_job = config::job_from_args(&args, auth, links_text.as_deref())?;
    let controller = cli_controller(config).await?;
    let job = controller.create_job(new_job).await?;
    println!("{}", job.id);
    eprintln!(
        "Queued job with {} album link(s); start a worker with `gphotos2immich run`",
        job.album_links.len()
    );
    Ok(())
}

async fn run_list(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let jobs = store.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<9}  {:>6}  {:>11}  {:<19}  {}",
        "ID", "STATUS", "DONE", "ITEMS", "CREATED", "DESTINATION"
    );
    for job in jobs {
        println!(
            "{:<36}  {:<9}  {:>5.0}%  {:>5}/{:<5}  {:<19}  {}",
            job.id,
            job.status.as_str(),
            job.progress.percent(),
            job.progress.items_processed,
            job.progress.total_items,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.immich_url
        );
    }
    Ok(())
}

async fn run_status(config: &Config, args: cli::StatusArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let Some(job) = store.get_job(&args.id).await? else {
        anyhow::bail!("Job {} not found", args.id);
    };

    println!("Job:         {}", job.id);
    println!("Status:      {}", job.status);
    println!("Destination: {} ({})", job.immich_url, job.auth.mode_str());
    println!(
        "Created:     {}",
        job.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Updated:     {}",
        job.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("Progress:    {}", progress_summary(&job));
    if let Some(request) = job.control {
        println!("Requested:   {}", request.as_str());
    }
    if let Some(error) = &job.last_error {
        println!("Last error:  {}", error);
    }

    println!();
    println!("Albums:");
    for album in store.albums(&job.id).await? {
        println!(
            "  {:>2}. {:<9} {}/{} {} ({})",
            album.position + 1,
            album.status.as_str(),
            album.processed,
            album.item_count,
            album.display_name(),
            album.link
        );
        if let Some(error) = &album.error {
            println!("      {}", error);
        }
    }

    if args.failed {
        let failed = store.failed_items(&job.id).await?;
        println!();
        println!("Failed items ({}):", failed.len());
        for item in failed {
            println!(
                "  {} ({} attempt(s)) - {}",
                item.effective_filename(),
                item.attempts,
                item.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    if !job.log_tail.is_empty() {
        println!();
        println!("Log:");
        for line in job.log_tail.lines() {
            println!("  {}", line);
        }
    }
    Ok(())
}

fn watch_bar(hidden: bool) -> ProgressBar {
    if hidden || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

/// Poll the store until the job leaves `QUEUED`/`RUNNING`.
async fn run_watch(config: &Config, args: cli::WatchArgs) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let pb = watch_bar(args.no_progress_bar);
    let interval = Duration::from_secs(args.interval.max(1));
    let mut last_line = String::new();

    let job = loop {
        let Some(job) = store.get_job(&args.id).await? else {
            pb.finish_and_clear();
            anyhow::bail!("Job {} not found", args.id);
        };
        let p = job.progress;
        pb.set_length(p.total_items);
        pb.set_position(p.items_processed);
        pb.set_message(format!(
            "{} | uploaded {} skipped {} failed {}",
            job.status, p.uploaded, p.skipped, p.failed
        ));
        if pb.is_hidden() {
            let line = format!("{} {}", job.status, progress_summary(&job));
            if line != last_line {
                println!("{}", line);
                last_line = line;
            }
        }
        if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            break job;
        }
        tokio::time::sleep(interval).await;
    };

    pb.finish_and_clear();
    println!("Job {} is {}: {}", job.id, job.status, progress_summary(&job));
    if let Some(error) = &job.last_error {
        println!("Last error: {}", error);
    }
    Ok(())
}

async fn run_test_login(args: cli::TestLoginArgs) -> anyhow::Result<()> {
    let timeouts = Timeouts::from_args(&args.timeouts)?;
    let auth = config::auth_from_args(&args.destination, prompt_password)?;
    let client = ImmichClient::new(
        &args.destination.immich_url,
        timeouts.request,
        timeouts.transfer,
    )?;
    let identity = client.authenticate(&auth).await?;
    println!(
        "Logged in to {} as {} <{}>",
        args.destination.immich_url, identity.name, identity.email
    );
    match client.checksum_exists(EMPTY_CHECKSUM).await {
        Ok(Some(_)) => println!("Checksum lookup: supported"),
        Ok(None) => println!("Checksum lookup: not supported, duplicates are detected on upload"),
        Err(e) => println!("Checksum lookup: failed ({})", e),
    }
    Ok(())
}

async fn worker_status(store: &dyn JobStore) -> anyhow::Result<WorkerStatus> {
    Ok(WorkerStatus {
        running: store.list_by_status(JobStatus::Running).await?.len(),
        queued: store.list_by_status(JobStatus::Queued).await?.len(),
    })
}

async fn run_worker(config: &Config, args: cli::RunArgs) -> anyhow::Result<()> {
    let worker = WorkerConfig::from_args(&args)?;
    let lock = WorkerLock::acquire(&config.lock_path()).await?;
    let controller = open_controller(config, worker.engine.clone(), worker.timeouts).await?;
    let shutdown_token = shutdown::install_signal_handler()?;
    let notifier = SystemdNotifier::new(worker.notify_systemd);

    tracing::info!(
        data_dir = %config.data_dir.display(),
        max_running_jobs = worker.engine.max_running_jobs,
        lock = %lock.path().display(),
        "Worker started"
    );
    notifier.ready();

    let reporter = {
        let store = controller.store().clone();
        let token = shutdown_token.clone();
        let interval = worker.engine.poll_interval;
        tokio::spawn(async move {
            loop {
                match worker_status(store.as_ref()).await {
                    Ok(status) => notifier.status(&status),
                    Err(e) => tracing::debug!(error = %e, "Failed to read worker status"),
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    };

    let result = controller.clone().run(shutdown_token.clone(), worker.once).await;
    notifier.stopping();
    reporter.abort();
    result?;
    tracing::info!("Worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_cli(&cli.data_dir, cli.secret_key.as_deref())?;

    match cli.command {
        Command::Submit(args) => run_submit(&config, args).await,
        Command::List => run_list(&config).await,
        Command::Status(args) => run_status(&config, args).await,
        Command::Watch(args) => run_watch(&config, args).await,
        Command::TestLogin(args) => run_test_login(args).await,
        Command::Run(args) => run_worker(&config, args).await,
        Command::Cancel(job) => {
            let controller = cli_controller(&config).await?;
            print_outcome(&job.id, controller.cancel(&job.id).await?);
            Ok(())
        }
        Command::Pause(job) => {
            let controller = cli_controller(&config).await?;
            print_outcome(&job.id, controller.pause(&job.id).await?);
            Ok(())
        }
        Command::Resume(job) => {
            let controller = cli_controller(&config).await?;
            print_outcome(&job.id, controller.resume(&job.id).await?);
            Ok(())
        }
        Command::RetryFailed(job) => {
            let controller = cli_controller(&config).await?;
            print_outcome(&job.id, controller.retry_failed(&job.id).await?);
            Ok(())
        }
        Command::Delete(job) => {
            cli_controller(&config).await?.delete(&job.id).await?;
            println!("Deleted job {}", job.id);
            Ok(())
        }
        Command::PauseQueued => {
            let ids = cli_controller(&config).await?.pause_queued().await?;
            println!("Paused {} queued job(s)", ids.len());
            Ok(())
        }
        Command::RemoveQueued => {
            let ids = cli_controller(&config).await?.remove_queued().await?;
            println!("Removed {} queued job(s)", ids.len());
            Ok(())
        }
    }
}
