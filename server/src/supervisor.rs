//! Worker process supervision: spawn, monitor, and gracefully stop N
//! worker processes.
//!
//! Workers are started spawn-style — a fresh process image running this
//! same binary with the worker environment flag — never by forking, so no
//! event-loop or connection state leaks into children. Each worker
//! re-derives its domain from the configured path on startup.
//!
//! There is no automatic restart: a crashed worker is logged, removed from
//! the pool, and reflected in the exit code; restart policy belongs to the
//! external process manager.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Environment flag marking a spawned worker process.
pub const WORKER_ENV: &str = "PROTEAN_WORKER";

/// Default time children get to exit after SIGTERM.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// How worker processes are launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Relaunch the current executable with `args` and the worker flag set.
    pub fn from_current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?)
            .args(args)
            .env(WORKER_ENV, "1"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I: IntoIterator<Item = S>, S: Into<String>>(mut self, args: I) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self) -> std::io::Result<tokio::process::Child> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.spawn()
    }
}

/// Asks a running supervisor to begin shutdown (what a signal would do).
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    pub fn terminate(&self) {
        let _ = self.tx.send(true);
    }
}

/// Spawns N workers and supervises them until the pool is empty.
pub struct Supervisor {
    workers: usize,
    command: WorkerCommand,
    grace: Duration,
    terminate_tx: Arc<watch::Sender<bool>>,
    terminate_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(workers: usize, command: WorkerCommand) -> Self {
        let (terminate_tx, terminate_rx) = watch::channel(false);
        Self {
            workers,
            command,
            grace: DEFAULT_GRACE,
            terminate_tx: Arc::new(terminate_tx),
            terminate_rx,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.terminate_tx.clone(),
        }
    }

    /// Run to completion. Returns the aggregate exit code: 0 when every
    /// worker exited cleanly, 1 when any worker failed or had to be
    /// force-killed.
    pub async fn run(&self) -> i32 {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(u32, bool)>();
        let mut pool: HashSet<u32> = HashSet::new();

        for n in 0..self.workers {
            match self.command.spawn() {
                Ok(mut child) => {
                    let Some(pid) = child.id() else {
                        tracing::error!(worker = n, "worker exited before it could be tracked");
                        continue;
                    };
                    tracing::info!(worker = n, pid, "worker started");
                    pool.insert(pid);
                    let exit_tx = exit_tx.clone();
                    tokio::spawn(async move {
                        let success = match child.wait().await {
                            Ok(status) => status.success(),
                            Err(err) => {
                                tracing::error!(pid, error = %err, "failed to wait on worker");
                                false
                            }
                        };
                        let _ = exit_tx.send((pid, success));
                    });
                }
                Err(err) => {
                    tracing::error!(worker = n, error = %err, "failed to spawn worker");
                }
            }
        }

        if pool.is_empty() {
            tracing::error!("no workers running");
            return 1;
        }

        self.listen_for_signals();

        let mut terminate_rx = self.terminate_rx.clone();
        let mut shutting_down = false;
        let mut deadline: Option<Instant> = None;
        let mut exit_code = 0;

        while !pool.is_empty() {
            let force_kill = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                exited = exit_rx.recv() => {
                    let Some((pid, success)) = exited else { break };
                    pool.remove(&pid);
                    if success {
                        tracing::info!(pid, remaining = pool.len(), "worker exited");
                    } else {
                        tracing::error!(pid, remaining = pool.len(), "worker exited abnormally");
                        exit_code = 1;
                    }
                }
                changed = terminate_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    if shutting_down {
                        // A second signal during shutdown is ignored.
                        tracing::debug!("already shutting down; signal ignored");
                        continue;
                    }
                    shutting_down = true;
                    deadline = Some(Instant::now() + self.grace);
                    tracing::info!(workers = pool.len(), "terminating workers");
                    for pid in &pool {
                        signal_worker(*pid, Signal::SIGTERM);
                    }
                }
                _ = force_kill => {
                    tracing::warn!(
                        laggards = pool.len(),
                        grace_secs = self.grace.as_secs_f64(),
                        "grace period elapsed; force-killing workers"
                    );
                    for pid in &pool {
                        signal_worker(*pid, Signal::SIGKILL);
                    }
                    exit_code = 1;
                    deadline = None;
                }
            }
        }

        tracing::info!(exit_code, "supervisor exiting");
        exit_code
    }

    /// Route interrupt, terminate, and hangup into the terminate channel.
    fn listen_for_signals(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        for kind in [
            SignalKind::interrupt(),
            SignalKind::terminate(),
            SignalKind::hangup(),
        ] {
            match signal(kind) {
                Ok(mut stream) => {
                    let handle = self.handle();
                    tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            handle.terminate();
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install signal handler");
                }
            }
        }
    }
}

fn signal_worker(pid: u32, signal: Signal) {
    if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
        // ESRCH just means the worker already exited.
        tracing::debug!(pid, ?signal, error = %err, "failed to signal worker");
    }
}
