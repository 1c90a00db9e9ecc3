use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub download_dir: String,
    pub database_url: String,
    /// Global ceiling on concurrent transfers, at least 1.
    pub max_concurrent: usize,
    /// Minutes between sweeps of rate-limited folders, at least 1.
    pub retry_interval_minutes: u64,
    pub body_limit: usize,
    pub shutdown_grace_secs: u64,
    pub remote_base_url: String,
    /// 0 disables the per-transfer timeout.
    pub transfer_timeout_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Background folder download service")]
pub struct Args {
    /// Host to bind to (overrides FOLDER_FETCH_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FOLDER_FETCH_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory downloaded files are written to (overrides FOLDER_FETCH_DOWNLOAD_DIR)
    #[arg(long)]
    pub download_dir: Option<String>,

    /// Database URL (overrides FOLDER_FETCH_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum concurrent transfers (overrides FOLDER_FETCH_MAX_CONCURRENT)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Minutes between retries of rate-limited folders (overrides FOLDER_FETCH_RETRY_INTERVAL_MINUTES)
    #[arg(long)]
    pub retry_interval_minutes: Option<u64>,

    /// Request body cap in bytes (overrides FOLDER_FETCH_BODY_LIMIT)
    #[arg(long)]
    pub body_limit: Option<usize>,

    /// Seconds to wait for in-flight transfers on shutdown (overrides FOLDER_FETCH_SHUTDOWN_GRACE_SECS)
    #[arg(long)]
    pub shutdown_grace_secs: Option<u64>,

    /// Base URL of the remote folder API (overrides FOLDER_FETCH_REMOTE_BASE_URL)
    #[arg(long)]
    pub remote_base_url: Option<String>,

    /// Per-transfer timeout in seconds, 0 to disable (overrides FOLDER_FETCH_TRANSFER_TIMEOUT_SECS)
    #[arg(long)]
    pub transfer_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |name| env::var(name))?;
        Ok((cfg, migrate))
    }

    /// CLI flag > env var > default. `lookup` reads one environment variable.
    fn merge(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<Self> {
        let text = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let cfg = Self {
            host: match args.host {
                Some(v) => v,
                None => text("FOLDER_FETCH_HOST", "0.0.0.0")?,
            },
            port: match args.port {
                Some(v) => v,
                None => parse_env(&lookup, "FOLDER_FETCH_PORT", 3000)?,
            },
            download_dir: match args.download_dir {
                Some(v) => v,
                None => text("FOLDER_FETCH_DOWNLOAD_DIR", "./data/downloads")?,
            },
            database_url: match args.database_url {
                Some(v) => v,
                None => text("FOLDER_FETCH_DATABASE_URL", "sqlite://./data/state.db")?,
            },
            max_concurrent: match args.max_concurrent {
                Some(v) => v,
                None => parse_env(&lookup, "FOLDER_FETCH_MAX_CONCURRENT", 4)?,
            }
            .max(1),
            retry_interval_minutes: match args.retry_interval_minutes {
                Some(v) => v,
                None => parse_env(&lookup, "FOLDER_FETCH_RETRY_INTERVAL_MINUTES", 60)?,
            }
            .max(1),
            body_limit: match args.body_limit {
                Some(v) => v,
                None => parse_env(&lookup, "FOLDER_FETCH_BODY_LIMIT", 1024 * 1024)?,
            },
            shutdown_grace_secs: match args.shutdown_grace_secs {
                Some(v) => v,
                None => parse_env(&lookup, "FOLDER_FETCH_SHUTDOWN_GRACE_SECS", 10)?,
            },
            remote_base_url: match args.remote_base_url {
                Some(v) => v,
                None => text("FOLDER_FETCH_REMOTE_BASE_URL", "http://127.0.0.1:8080")?,
            },
            transfer_timeout_secs: match args.transfer_timeout_secs {
                Some(v) => v,
                None => parse_env(&lookup, "FOLDER_FETCH_TRANSFER_TIMEOUT_SECS", 0)?,
            },
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_minutes.saturating_mul(60))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        (self.transfer_timeout_secs > 0).then(|| Duration::from_secs(self.transfer_timeout_secs))
    }
}

fn parse_env<T>(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
