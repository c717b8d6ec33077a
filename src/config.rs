use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_MAX_REQUEST_BYTES: usize = 50 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub object_dir: String,
    pub object_secret_key: String,
    pub default_bucket: String,
    pub jwt_secret: String,
    pub auth_url: Option<String>,
    pub public_url: String,
    pub spool_dir: PathBuf,
    pub max_request_bytes: usize,
    pub call_timeout: Duration,
    pub transfer_timeout: Duration,
}

/// Secrets are redacted so the config can be logged at startup.
impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("object_dir", &self.object_dir)
            .field("object_secret_key", &"<redacted>")
            .field("default_bucket", &self.default_bucket)
            .field("jwt_secret", &"<redacted>")
            .field("auth_url", &self.auth_url)
            .field("public_url", &self.public_url)
            .field("spool_dir", &self.spool_dir)
            .field("max_request_bytes", &self.max_request_bytes)
            .field("call_timeout", &self.call_timeout)
            .field("transfer_timeout", &self.transfer_timeout)
            .finish()
    }
}

/// What the process should do after loading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    /// Apply the schema, provision the default bucket, exit.
    Migrate,
    /// List uploads still pending after this many minutes, exit.
    ReportOrphans { older_than_minutes: u64 },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Managed file storage API")]
pub struct Args {
    /// Host to bind to (overrides STORAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STORAGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Metadata database URL (overrides STORAGE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory where objects are stored (overrides STORAGE_OBJECT_DIR)
    #[arg(long)]
    pub object_dir: Option<String>,

    /// Public base URL for presigned links (overrides STORAGE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Print uploads pending for longer than MINUTES and exit
    #[arg(long, value_name = "MINUTES", conflicts_with = "migrate")]
    pub report_orphans: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        Self::from_sources(args, |key| env::var(key).ok())
    }

    /// Merge `args` over values produced by `lookup`, over defaults.
    /// Missing required settings are an error.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<(Self, RunMode)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| get(key).ok_or_else(|| anyhow!("{} must be set", key));

        let cfg = Self {
            host: args
                .host
                .or_else(|| get("STORAGE_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => parse_or(&get, "STORAGE_PORT", 5000)?,
            },
            database_url: args
                .database_url
                .or_else(|| get("STORAGE_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/storage.db".into()),
            object_dir: args
                .object_dir
                .or_else(|| get("STORAGE_OBJECT_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            object_secret_key: require("STORAGE_OBJECT_SECRET_KEY")?,
            default_bucket: get("STORAGE_DEFAULT_BUCKET").unwrap_or_else(|| "default".into()),
            jwt_secret: require("STORAGE_JWT_SECRET")?,
            auth_url: get("STORAGE_AUTH_URL"),
            public_url: match args.public_url {
                Some(url) => url,
                None => require("STORAGE_PUBLIC_URL")?,
            },
            spool_dir: get("STORAGE_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            max_request_bytes: parse_or(
                &get,
                "STORAGE_MAX_REQUEST_BYTES",
                DEFAULT_MAX_REQUEST_BYTES,
            )?,
            call_timeout: Duration::from_secs(parse_or(&get, "STORAGE_CALL_TIMEOUT_SECS", 10)?),
            transfer_timeout: Duration::from_secs(parse_or(
                &get,
                "STORAGE_TRANSFER_TIMEOUT_SECS",
                300,
            )?),
        };

        if cfg.call_timeout.is_zero() || cfg.transfer_timeout.is_zero() {
            anyhow::bail!("timeouts must be greater than zero");
        }

        let mode = if args.migrate {
            RunMode::Migrate
        } else if let Some(minutes) = args.report_orphans {
            RunMode::ReportOrphans {
                older_than_minutes: minutes,
            }
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
