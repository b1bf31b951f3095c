use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pulsewatch::app::{check_documents, Coordinator};
use pulsewatch::config::Settings;
use pulsewatch::server;
use pulsewatch::store::InstanceLock;
use pulsewatch::supervisor::RotatingLog;

#[derive(Parser, Debug)]
#[command(name = "pulsewatch")]
#[command(about = "Supervises tracking workers and owns their stats documents")]
struct Args {
    /// Path to a TOML/YAML/JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Serve the intake endpoints without starting or watching workers
    #[arg(long)]
    no_supervisor: bool,

    /// Validate stored documents, restoring or quarantining bad ones, and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref()).context("failed to load settings")?;
    if let Some(listen) = args.listen {
        settings.server.listen_addr = listen;
    }
    if args.no_supervisor {
        settings.supervisor.enabled = false;
    }

    let _log_guard = init_tracing(&settings)?;

    std::fs::create_dir_all(&settings.store.runtime_dir).with_context(|| {
        format!(
            "failed to create {}",
            settings.store.runtime_dir.display()
        )
    })?;
    let lock_path = settings.instance_lock_path();
    let Some(_instance) = InstanceLock::try_acquire(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?
    else {
        bail!(
            "another coordinator holds {}; refusing to start",
            lock_path.display()
        );
    };

    if args.check {
        let report = check_documents(&settings)?;
        println!(
            "total={} ok={} restored={} invalid={}",
            report.total, report.ok, report.restored, report.invalid
        );
        return Ok(());
    }

    let listener = TcpListener::bind(&settings.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.listen_addr))?;

    let coordinator = Arc::new(Coordinator::init(settings)?);
    coordinator.start().await?;
    info!("application startup complete");

    let served = server::serve(coordinator.clone(), listener, shutdown_signal()).await;
    coordinator.shutdown().await;
    if let Err(e) = &served {
        error!(error = %e, "http server failed");
    }
    served.context("http server failed")
}

fn init_tracing(settings: &Settings) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.level))
        .context("invalid log filter")?;

    let path = settings.log_path();
    let writer = RotatingLog::new(&path, settings.logging.max_bytes, settings.logging.backups)
        .writer()
        .with_context(|| format!("failed to open {}", path.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
