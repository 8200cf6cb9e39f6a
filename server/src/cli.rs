//! Command-line entrypoint.
//!
//! Applications hand [`run`] a domain factory and get the full server
//! lifecycle: configuration loading (with `PROTEAN_ENV` overlays and
//! `PROTEAN_DOMAIN` path override), worker supervision, and graceful
//! shutdown. Exit code 0 on a clean stop, 1 when any worker crashed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::ProteanConfig;
use crate::domain::{Domain, Ports};
use crate::engine::{Engine, EngineOptions};

#[derive(Parser)]
#[command(name = "protean", version, about = "Domain message processing server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor and its worker processes.
    Server {
        /// Path to the domain configuration file.
        #[arg(long, env = "PROTEAN_DOMAIN")]
        domain: Option<PathBuf>,

        /// Number of worker processes.
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Process until all sources are quiescent, then exit.
        #[arg(long)]
        test_mode: bool,

        /// Verbose logging.
        #[arg(long)]
        debug: bool,
    },
}

/// Parse the CLI and run. `build_domain` is invoked in every worker
/// process with the loaded configuration.
pub fn run<F>(build_domain: F) -> ExitCode
where
    F: Fn(ProteanConfig) -> Domain,
{
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            domain,
            workers,
            test_mode,
            debug,
        } => {
            init_tracing(debug);

            if workers == 0 {
                tracing::error!("--workers must be at least 1");
                return ExitCode::FAILURE;
            }

            let is_worker = std::env::var(worker_env()).is_ok();
            if is_worker || test_mode {
                run_worker(build_domain, domain.as_deref(), test_mode, debug)
            } else {
                run_supervisor(domain, workers, debug)
            }
        }
    }
}

fn worker_env() -> &'static str {
    #[cfg(unix)]
    {
        crate::supervisor::WORKER_ENV
    }
    #[cfg(not(unix))]
    {
        "PROTEAN_WORKER"
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A worker inherits the subscriber of its own process only; init once.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn run_worker<F>(
    build_domain: F,
    config_path: Option<&std::path::Path>,
    test_mode: bool,
    debug: bool,
) -> ExitCode
where
    F: Fn(ProteanConfig) -> Domain,
{
    let config = match ProteanConfig::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result: anyhow::Result<()> = runtime.block_on(async {
        let ports = Ports::from_config(&config).await?;
        let domain = build_domain(config);
        let options = EngineOptions {
            test_mode,
            debug,
            ..Default::default()
        };
        let engine = Engine::new(domain, ports, options)?;

        let handle = engine.handle();
        spawn_shutdown_listener(handle);

        engine.run().await?;
        Ok(())
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "worker failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
fn spawn_shutdown_listener(handle: crate::engine::EngineHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
        match signal(kind) {
            Ok(mut stream) => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        tracing::info!("shutdown signal received");
                        handle.stop();
                    }
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install signal handler");
            }
        }
    }
}

#[cfg(not(unix))]
fn spawn_shutdown_listener(handle: crate::engine::EngineHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            handle.stop();
        }
    });
}

#[cfg(unix)]
fn run_supervisor(config_path: Option<PathBuf>, workers: usize, debug: bool) -> ExitCode {
    use crate::supervisor::{Supervisor, WorkerCommand};

    let mut args = vec!["server".to_string()];
    if let Some(path) = &config_path {
        args.push("--domain".to_string());
        args.push(path.display().to_string());
    }
    if debug {
        args.push("--debug".to_string());
    }

    let command = match WorkerCommand::from_current_exe(args) {
        Ok(command) => command,
        Err(err) => {
            tracing::error!(error = %err, "failed to locate current executable");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(async { Supervisor::new(workers, command).run().await });
    ExitCode::from(code.clamp(0, 255) as u8)
}

#[cfg(not(unix))]
fn run_supervisor(_config_path: Option<PathBuf>, _workers: usize, _debug: bool) -> ExitCode {
    tracing::error!("multi-process supervision requires unix; run with --workers 1");
    ExitCode::FAILURE
}
