use anyhow::{Context, Result};
use file_storage::{
    config::{AppConfig, RunMode},
    models::{actor::ActorIdentity, bucket::BucketSettings},
    routes,
    services::{
        actor_resolver::ActorResolver,
        file_service::{FileService, Timeouts},
        metadata_store::SqliteMetadataStore,
        object_store::LocalObjectStore,
    },
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-storage with config: {:?}", cfg);

    // --- Ensure local directories exist ---
    for dir in [Path::new(&cfg.object_dir), cfg.spool_dir.as_path()] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            tracing::info!("Created directory at {}", dir.display());
        }
    }

    // SQLite won't create missing parent directories itself
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if !db_path.is_empty() && db_path != ":memory:" {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    // --- Initialize metadata store ---
    tracing::debug!("Connecting to {}", cfg.database_url);
    let metadata = Arc::new(
        SqliteMetadataStore::connect(&cfg.database_url)
            .await
            .context("connecting to metadata database")?,
    );

    let timeouts = Timeouts {
        call: cfg.call_timeout,
        transfer: cfg.transfer_timeout,
    };

    match mode {
        RunMode::Migrate => {
            metadata.migrate().await?;
            let bucket = metadata
                .ensure_bucket(&BucketSettings::named(cfg.default_bucket.clone()))
                .await?;
            tracing::info!(bucket = %bucket.name, "Database migration complete.");
            return Ok(()); // exit after migration
        }
        RunMode::ReportOrphans { older_than_minutes } => {
            return report_orphans(&cfg, metadata, timeouts, older_than_minutes).await;
        }
        RunMode::Serve => {}
    }

    // --- Initialize core services ---
    let objects = Arc::new(LocalObjectStore::new(
        cfg.object_dir.clone(),
        cfg.object_secret_key.as_bytes(),
        cfg.public_url.clone(),
    ));
    let files = FileService::new(metadata, objects.clone(), timeouts);
    let resolver = Arc::new(ActorResolver::from_settings(
        &cfg.jwt_secret,
        cfg.auth_url.as_deref(),
        cfg.call_timeout,
    ));

    let state = AppState {
        files,
        resolver,
        objects,
        default_bucket: cfg.default_bucket.clone(),
        spool_dir: cfg.spool_dir.clone(),
    };

    // --- Build router ---
    let app = routes::routes::routes(state, cfg.max_request_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Print uploads that never reached confirmation, one JSON line each.
async fn report_orphans(
    cfg: &AppConfig,
    metadata: Arc<SqliteMetadataStore>,
    timeouts: Timeouts,
    older_than_minutes: u64,
) -> Result<()> {
    let objects = Arc::new(LocalObjectStore::new(
        cfg.object_dir.clone(),
        cfg.object_secret_key.as_bytes(),
        cfg.public_url.clone(),
    ));
    let files = FileService::new(metadata, objects, timeouts);

    let age = Duration::from_secs(older_than_minutes.saturating_mul(60));
    let pending = files
        .pending_uploads(&ActorIdentity::service(), age)
        .await
        .context("listing pending uploads")?;

    tracing::info!(
        count = pending.len(),
        older_than_minutes,
        "pending uploads found"
    );
    for record in &pending {
        println!("{}", serde_json::to_string(record)?);
    }

    Ok(())
}
