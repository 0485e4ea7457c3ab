// SPDX-License-Identifier: MIT

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use enrolld::{
    broadcast::FrameBroadcaster, catalogue::Catalogue, config::ServerConfig, http,
    modes::ModeController, registry::SessionRegistry, storage::Storage, AppContext,
};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "enrolld",
    about = "Realtime course-selection server",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML config file
    #[arg(long, env = "ENROLLD_CONFIG", default_value = "enrolld.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ENROLLD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "ENROLLD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server (default when no subcommand given).
    ///
    /// Runs enrolld in the foreground until SIGTERM/Ctrl-C.
    ///
    /// Examples:
    ///   enrolld serve --config enrolld.toml
    ///   enrolld
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    match args.command {
        None | Some(Command::Serve) => run_server(&args.config).await?,
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("enrolld.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

async fn run_server(config_path: &std::path::Path) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "enrolld starting");

    let config = Arc::new(ServerConfig::load(config_path).context("load config")?);
    info!(
        addr = %config.listener.addr,
        db = %config.db.conn,
        prod = config.prod,
        "config loaded"
    );

    let storage = Arc::new(Storage::new(&config.db.conn).await.context("open database")?);

    // The seat counters are rebuilt from the choices table on every start,
    // so a crash between an in-memory increment and its compensation cannot
    // leave a course permanently over-counted.
    let catalogue = Arc::new(Catalogue::load(&storage).await.context("load catalogue")?);
    if catalogue.is_empty() {
        warn!("catalogue is empty — seed the courses table before opening selections");
    }

    let broadcaster = Arc::new(FrameBroadcaster::new());
    let modes = Arc::new(
        ModeController::load(storage.clone(), broadcaster.clone())
            .await
            .context("load mode")?,
    );
    let registry = Arc::new(SessionRegistry::new());

    let ctx = Arc::new(AppContext {
        config,
        storage: storage.clone(),
        catalogue,
        registry,
        modes,
        broadcaster,
        usem_count: AtomicU64::new(0),
        started_at: std::time::Instant::now(),
    });

    // ── Expired-cookie pruning (hourly) ──────────────────────────────────────
    {
        let storage = storage.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60 * 60)).await;
                let now = chrono::Utc::now().timestamp();
                match storage.prune_expired_sessions(now).await {
                    Ok(n) if n > 0 => info!(pruned = n, "pruned expired auth cookies"),
                    Ok(_) => {}
                    Err(e) => warn!(err = %e, "cookie pruning failed"),
                }
            }
        });
    }

    http::serve(ctx).await
}
