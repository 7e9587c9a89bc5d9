use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use foreman_core::config::Config;
use foreman_core::daemon::Daemon;
use foreman_core::flag::ShutdownFlag;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Exit codes per spec §6.3.
mod exit {
    pub const OK: u8 = 0;
    pub const FATAL: u8 = 1;
    pub const PREFLIGHT_FAILURE: u8 = 2;
    pub const DRAIN_TIMEOUT: u8 = 124;
}

#[derive(Debug, clap::Parser)]
struct Args {
    /// TOML config file overlaid on top of the built-in defaults.
    #[arg(long, env = "FOREMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for the task filesystem, state store and logs
    /// (spec §6.1). Overrides the `root` key in the config file.
    #[arg(long, env = "FOREMAN_ROOT")]
    root: Option<PathBuf>,
}

fn main() -> ExitCode {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
    );
    registry.init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load_toml(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "failed to load config");
                return ExitCode::from(exit::PREFLIGHT_FAILURE);
            }
        },
        None => Config::default(),
    };
    if let Some(root) = args.root {
        config.root = root;
    }
    if let Err(msg) = config.validate() {
        tracing::error!(error = %msg, "config failed validation");
        return ExitCode::from(exit::PREFLIGHT_FAILURE);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start tokio runtime");
            return ExitCode::from(exit::FATAL);
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let shutdown_grace = Duration::from_secs(config.pool.shutdown_grace_s);

    let daemon = match Daemon::start(config).await {
        Ok(daemon) => daemon,
        Err(err) => {
            tracing::error!(error = %err, "startup preflight failed");
            return ExitCode::from(exit::PREFLIGHT_FAILURE);
        }
    };

    let shutdown = daemon.shutdown_flag();
    let signal_pause = daemon.signal_pause_flag();
    let budget_killed = daemon.budget_killed_flag();

    let signals = tokio::task::spawn(listen_for_signals(shutdown.clone(), signal_pause));
    let reaper = tokio::task::spawn(reap_orphans_forever());

    tracing::info!("foreman starting up");
    let drained = tokio::time::timeout(shutdown_grace + Duration::from_secs(5), daemon.run()).await;

    signals.abort();
    reaper.abort();

    match drained {
        Ok(()) if budget_killed.is_raised() => {
            tracing::error!("foreman shut down after a budget kill");
            ExitCode::from(exit::FATAL)
        }
        Ok(()) => {
            tracing::info!("foreman shut down cleanly");
            ExitCode::from(exit::OK)
        }
        Err(_) => {
            tracing::error!("worker drain exceeded the shutdown grace window");
            ExitCode::from(exit::DRAIN_TIMEOUT)
        }
    }
}

/// Spec §6.3: `SIGTERM`/`SIGINT` raise shutdown; `SIGUSR1` pauses new task
/// claims; `SIGUSR2` resumes them. Runs until aborted by the caller.
async fn listen_for_signals(shutdown: Arc<ShutdownFlag>, signal_pause: Arc<ShutdownFlag>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
        let mut sigusr2 = signal(SignalKind::user_defined2()).expect("failed to install SIGUSR2 handler");

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT, shutting down");
                    shutdown.raise();
                    return;
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    shutdown.raise();
                    return;
                }
                _ = sigusr1.recv() => {
                    tracing::info!("received SIGUSR1, pausing new task claims");
                    signal_pause.raise();
                }
                _ = sigusr2.recv() => {
                    tracing::info!("received SIGUSR2, resuming task claims");
                    signal_pause.reset();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received ctrl-c, shutting down");
        shutdown.raise();
    }
}

/// Reaps zombie children left behind by crashed or misbehaving delegate
/// subprocesses (spec §4.15 "reaps orphan child processes"). The delegate
/// invoker already sets `process_group(0)` and waits on its own children;
/// this is a backstop for any that get detached before their parent worker
/// observes their exit.
#[cfg(unix)]
async fn reap_orphans_forever() {
    loop {
        loop {
            let mut status = 0;
            // SAFETY: waitpid with WNOHANG never blocks and only touches
            // the calling process's own child table.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            tracing::debug!(pid, "reaped orphan child process");
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

#[cfg(not(unix))]
async fn reap_orphans_forever() {
    std::future::pending::<()>().await;
}
