//! Resource allocator server entry point: loads configuration, wires the
//! monitor/estimator/allocator/control-loop stack, spawns the admin HTTP
//! server, and drives the control loop until `max_iteration`.

use clap::{Parser, ValueEnum};
use resalloc::admin::{self, DEFAULT_ADMIN_PORT};
use resalloc::allocator::{fij, incremental, spirit, Policy};
use resalloc::config::{Config, ConfigOverrides};
use resalloc::control_loop::ControlLoop;
use resalloc::monitor::Monitor;
use resalloc::Result;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab-case")]
enum AllocatorKind {
    Spirit,
    Static,
    Oracle,
    IncTrade,
    FijTrade,
}

/// CLI surface: `--config`, `--allocator`, `--alloc_interval`, `--max_iter`.
#[derive(Debug, Parser)]
#[command(name = "resalloc-server", about = "Multi-tenant cache/bandwidth resource allocator")]
struct Cli {
    #[arg(long)]
    config: PathBuf,

    #[arg(long, value_enum, default_value = "spirit")]
    allocator: AllocatorKind,

    #[arg(long = "alloc_interval")]
    alloc_interval: Option<f64>,

    #[arg(long = "max_iter", default_value_t = 1_000_000)]
    max_iter: u64,

    #[arg(long, default_value_t = DEFAULT_ADMIN_PORT)]
    admin_port: u16,

    /// Directory for the "one log file per component" files from spec.md
    /// §6; omit to log to stdout only.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Re-created at startup per spec.md §6: `rolling::never` truncates on
    // open rather than appending to a prior run's log.
    let _file_guard = init_logging(cli.log_dir.as_deref());
    print_banner();

    let mut config = Config::load(&cli.config)?;
    config.apply_overrides(&ConfigOverrides {
        allocation_interval_in_sec: cli.alloc_interval,
    });

    tracing::info!(
        cluster = %config.cluster.name,
        apps = config.profiles.len(),
        allocator = ?cli.allocator,
        "configuration loaded"
    );

    let monitor = Arc::new(Monitor::new(config.app_ids(), config.allocation_parameters.allocation_interval_in_sec));
    let admin_router = admin::build_router(monitor.clone());
    let admin_addr = format!("0.0.0.0:{}", cli.admin_port);
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&admin_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %admin_addr, "admin server listening");
                if let Err(e) = axum::serve(listener, admin_router).await {
                    tracing::error!(error = %e, "admin server error");
                }
            }
            Err(e) => tracing::error!(error = %e, addr = %admin_addr, "failed to bind admin server"),
        }
    });

    let policy = match cli.allocator {
        AllocatorKind::Spirit => Policy::Spirit(spirit::SpiritState::default()),
        AllocatorKind::Static => Policy::Static,
        AllocatorKind::Oracle => Policy::Oracle,
        AllocatorKind::IncTrade => Policy::IncrementalTrade(incremental::IncrementalState::default()),
        AllocatorKind::FijTrade => Policy::FijTrade(fij::FijState::default()),
    };

    let mut control_loop = ControlLoop::new(&config, monitor, policy);
    control_loop.run(cli.max_iter).await?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Installs the `tracing` subscriber. With `--log-dir`, logs go to both
/// stdout and `<log_dir>/resalloc.log`, re-created (truncated) each run —
/// the ambient replacement for the original's per-component
/// `./logs/<component>.log` file handlers (spec.md §6). The returned guard
/// must be held for the process lifetime to flush the non-blocking writer.
fn init_logging(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file = tracing_appender::rolling::never(dir, "resalloc.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_writer(std::io::stdout.and(non_blocking))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .init();
            None
        }
    }
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║  resalloc — cache/bandwidth resource allocator              ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}
