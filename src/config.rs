use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::cli::{DestinationArgs, RunArgs, SubmitArgs, TimeoutArgs};
use crate::controller::EngineConfig;
use crate::destination::AuthConfig;
use crate::retry::RetryConfig;
use crate::state::{parse_album_links, JobOptions, NewJob, MAX_CONCURRENCY, MIN_CONCURRENCY};

const DB_FILE: &str = "jobs.db";
const STAGING_DIR: &str = "staging";
const LOCK_FILE: &str = "worker.lock";
const KEY_FILE: &str = "secret.key";

/// Locations shared by every command.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Base64 key for stored credentials; the key file is used when unset.
    pub secret_key: Option<String>,
}

impl Config {
    pub fn from_cli(data_dir: &str, secret_key: Option<&str>) -> anyhow::Result<Self> {
        if data_dir.trim().is_empty() {
            anyhow::bail!("--data-dir must not be empty");
        }
        Ok(Self {
            data_dir: expand_tilde(data_dir.trim()),
            secret_key: secret_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join(STAGING_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }
}

/// Settings of the `run` worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub engine: EngineConfig,
    pub timeouts: Timeouts,
    pub once: bool,
    pub notify_systemd: bool,
}

impl WorkerConfig {
    pub fn from_args(args: &RunArgs) -> anyhow::Result<Self> {
        if args.max_running_jobs == 0 {
            anyhow::bail!("--max-running-jobs must be at least 1");
        }
        if args.poll_interval == 0 {
            anyhow::bail!("--poll-interval must be at least 1 second");
        }
        Ok(Self {
            engine: EngineConfig {
                max_running_jobs: args.max_running_jobs,
                retry: RetryConfig {
                    max_retries: args.max_retries,
                    base_delay_secs: args.retry_delay,
                    max_delay_secs: 60,
                },
                poll_interval: Duration::from_secs(args.poll_interval),
            },
            timeouts: Timeouts::from_args(&args.timeouts)?,
            once: args.once,
            notify_systemd: args.notify_systemd,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub request: Duration,
    pub transfer: Duration,
}

impl Timeouts {
    pub fn from_args(args: &TimeoutArgs) -> anyhow::Result<Self> {
        if args.request_timeout == 0 || args.transfer_timeout == 0 {
            anyhow::bail!("timeouts must be at least 1 second");
        }
        Ok(Self {
            request: Duration::from_secs(args.request_timeout),
            transfer: Duration::from_secs(args.transfer_timeout),
        })
    }
}

/// Build the destination credentials: an API key, or an email with a
/// password from the flags, the environment or `password_provider`.
pub fn auth_from_args<F>(args: &DestinationArgs, password_provider: F) -> anyhow::Result<AuthConfig>
where
    F: FnOnce() -> Option<String>,
{
    let api_key = args.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty());
    let email = args.email.as_deref().map(str::trim).filter(|e| !e.is_empty());
    match (api_key, email) {
        (Some(_), Some(_)) => anyhow::bail!("use either --api-key or --email, not both"),
        (Some(key), None) => Ok(AuthConfig::ApiKey {
            api_key: key.to_string(),
        }),
        (None, Some(email)) => {
            let password = args
                .password
                .clone()
                .filter(|p| !p.is_empty())
                .or_else(password_provider)
                .filter(|p| !p.is_empty())
                .context("a password is required for email login")?;
            Ok(AuthConfig::Credentials {
                email: email.to_string(),
                password,
            })
        }
        (None, None) => anyhow::bail!("an API key (--api-key) or an email (--email) is required"),
    }
}

/// Build a new job from `submit` arguments. `links_text` is the content
/// of `--links-file`, if one was given.
pub fn job_from_args(
    args: &SubmitArgs,
    auth: AuthConfig,
    links_text: Option<&str>,
) -> anyhow::Result<NewJob> {
    for (flag, value) in [
        ("--download-concurrency", args.download_concurrency),
        ("--upload-concurrency", args.upload_concurrency),
    ] {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&value) {
            anyhow::bail!(
                "{} must be between {} and {}",
                flag,
                MIN_CONCURRENCY,
                MAX_CONCURRENCY
            );
        }
    }

    let mut links = args.albums.join("\n");
    if let Some(text) = links_text {
        links.push('\n');
        links.push_str(text);
    }
    if parse_album_links(&links).is_empty() {
        anyhow::bail!("no album links given (use --album or --links-file)");
    }

    let options = JobOptions {
        create_album: !args.no_create_album,
        skip_duplicates: !args.no_skip_duplicates,
        store_staging: !args.no_staging,
        download_concurrency: args.download_concurrency,
        upload_concurrency: args.upload_concurrency,
    };
    Ok(NewJob::new(&args.destination.immich_url, auth, &links, options))
}

/// Read a links file, with `-` meaning stdin.
pub fn read_links_file(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read links file {}", path.display()))
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Documents");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Documents"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_config_paths_under_data_dir() {
        let config = Config::from_cli("/var/lib/g2i", None).unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/g2i/jobs.db"));
        assert_eq!(config.staging_dir(), PathBuf::from("/var/lib/g2i/staging"));
        assert_eq!(config.key_path(), PathBuf::from("/var/lib/g2i/secret.key"));
        assert_eq!(config.secret_key, None);
        assert!(Config::from_cli("  ", None).is_err());

        let keyed = Config::from_cli("/var/lib/g2i", Some(" abc= ")).unwrap();
        assert_eq!(keyed.secret_key.as_deref(), Some("abc="));
        assert_eq!(Config::from_cli("/x", Some("")).unwrap().secret_key, None);
    }

    fn destination(api_key: Option<&str>, email: Option<&str>, password: Option<&str>) -> DestinationArgs {
        DestinationArgs {
            immich_url: "https://immich.local".into(),
            api_key: api_key.map(String::from),
            email: email.map(String::from),
            password: password.map(String::from),
        }
    }

    #[test]
    fn test_auth_api_key() {
        let auth = auth_from_args(&destination(Some(" key "), None, None), || None).unwrap();
        assert_eq!(
            auth,
            AuthConfig::ApiKey {
                api_key: "key".into()
            }
        );
    }

    #[test]
    fn test_auth_prompts_for_missing_password() {
        let auth = auth_from_args(&destination(None, Some("me@example.com"), None), || {
            Some("hunter2".into())
        })
        .unwrap();
        assert_eq!(
            auth,
            AuthConfig::Credentials {
                email: "me@example.com".into(),
                password: "hunter2".into()
            }
        );
    }

    #[test]
    fn test_auth_rejects_ambiguous_or_missing() {
        assert!(auth_from_args(&destination(Some("k"), Some("e@x"), None), || None).is_err());
        assert!(auth_from_args(&destination(None, None, None), || None).is_err());
        assert!(auth_from_args(&destination(None, Some("e@x"), None), || None).is_err());
    }

    fn submit_args(extra: &[&str]) -> SubmitArgs {
        let mut argv = vec![
            "gphotos2immich",
            "submit",
            "--immich-url",
            "https://immich.local/",
            "--api-key",
            "k",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Submit(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_job_from_args_merges_links() {
        let args = submit_args(&["-a", "https://photos.app.goo.gl/a", "--no-create-album"]);
        let auth = AuthConfig::ApiKey {
            api_key: "k".into(),
        };
        let job = job_from_args(
            &args,
            auth,
            Some("\nhttps://photos.app.goo.gl/b\n\n  https://photos.app.goo.gl/c  \n"),
        )
        .unwrap();
        assert_eq!(job.album_links.len(), 3);
        assert_eq!(job.album_links[2], "https://photos.app.goo.gl/c");
        assert!(!job.options.create_album);
        assert!(job.options.skip_duplicates);
    }

    #[test]
    fn test_job_from_args_validation() {
        let auth = || AuthConfig::ApiKey {
            api_key: "k".into(),
        };
        assert!(job_from_args(&submit_args(&[]), auth(), Some("\n\n")).is_err());
        let args = submit_args(&["-a", "https://photos.app.goo.gl/a", "--download-concurrency", "11"]);
        assert!(job_from_args(&args, auth(), None).is_err());
    }

    #[test]
    fn test_worker_config_from_args() {
        let cli = Cli::try_parse_from([
            "gphotos2immich",
            "run",
            "--max-running-jobs",
            "2",
            "--retry-delay",
            "5",
            "--once",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let worker = WorkerConfig::from_args(&args).unwrap();
        assert_eq!(worker.engine.max_running_jobs, 2);
        assert_eq!(worker.engine.retry.base_delay_secs, 5);
        assert_eq!(worker.timeouts.transfer, Duration::from_secs(300));
        assert!(worker.once);

        let mut bad = args.clone();
        bad.max_running_jobs = 0;
        assert!(WorkerConfig::from_args(&bad).is_err());
    }
}
