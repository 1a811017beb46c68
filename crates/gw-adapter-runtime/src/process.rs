//! Supervision of one engine process
//!
//! A supervisor owns a spawned process for its whole lifetime. One tokio
//! task per process waits on both output streams and the exit status at
//! once, so nothing polls. Every line is echoed to the host log, kept in a
//! bounded ring, and checked for the readiness marker.

use crate::config::ProcessConfig;
use crate::log::LogRing;
use crate::{Result, RuntimeError};
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use nix::sys::signal::Signal;

/// Observable state of a supervised process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub running: bool,
    pub loaded: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub command: Vec<String>,
}

/// State written by the I/O task and read by everyone else
struct Shared {
    running: AtomicBool,
    loaded: AtomicBool,
    /// Pid of the live child, 0 once it has been reaped
    pid: AtomicU32,
    log: RwLock<LogRing>,
}

/// Owns one spawned process
pub struct ProcessSupervisor {
    config: ProcessConfig,
    shared: Arc<Shared>,
    io_task: Option<JoinHandle<()>>,
    start_time: Option<Instant>,
    restart_count: u32,
}

impl ProcessSupervisor {
    /// Create a supervisor; nothing is spawned until [`start`](Self::start)
    pub fn new(config: ProcessConfig) -> Self {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            log: RwLock::new(LogRing::new(config.log_lines)),
        });
        Self {
            config,
            shared,
            io_task: None,
            start_time: None,
            restart_count: 0,
        }
    }

    /// Spawn the process. Starting a running process only reports its status.
    pub async fn start(&mut self) -> Result<ProcessStatus> {
        if self.is_running() {
            debug!(instance = %self.config.name, "Process already running");
            return Ok(self.status());
        }

        self.config.validate()?;

        // A previous run may still be draining output from orphaned children
        if let Some(handle) = self.io_task.take() {
            handle.abort();
        }

        info!(
            instance = %self.config.name,
            "Starting process: {} {:?}", self.config.command, self.config.args
        );

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        if let Some(working_dir) = &self.config.working_dir {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn().map_err(|e| {
            RuntimeError::Process(format!("Failed to spawn {}: {}", self.config.command, e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Process("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Process("stderr not captured".to_string()))?;

        self.shared.pid.store(child.id().unwrap_or_default(), Ordering::SeqCst);
        self.start_time = Some(Instant::now());
        self.shared.loaded.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);

        self.io_task = Some(tokio::spawn(supervise(
            self.config.name.clone(),
            self.config.ready_marker.clone(),
            child,
            stdout,
            stderr,
            Arc::clone(&self.shared),
        )));

        Ok(self.status())
    }

    /// Terminate the process group and wait for it to exit.
    ///
    /// A process that already exited is not signalled; its group id may
    /// belong to someone else by now.
    pub async fn stop(&mut self) -> Result<()> {
        self.start_time = None;
        let handle = self.io_task.take();

        let Some(pid) = self.live_pid() else {
            if let Some(handle) = handle {
                debug!(instance = %self.config.name, "Process already exited");
                handle.abort();
            }
            self.mark_stopped();
            return Ok(());
        };

        info!(instance = %self.config.name, pid, "Stopping process");

        #[cfg(unix)]
        signal_group(pid, Signal::SIGTERM);

        if let Some(mut handle) = handle {
            match timeout(self.config.shutdown_timeout, &mut handle).await {
                Ok(_) => info!(instance = %self.config.name, "Process stopped gracefully"),
                Err(_) => {
                    warn!(instance = %self.config.name, "Graceful shutdown timed out, forcing kill");
                    #[cfg(unix)]
                    if let Some(pid) = self.live_pid() {
                        signal_group(pid, Signal::SIGKILL);
                    }
                    if timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                        error!(instance = %self.config.name, "Process did not exit after SIGKILL");
                        handle.abort();
                    }
                }
            }
        }

        self.mark_stopped();
        Ok(())
    }

    fn mark_stopped(&self) {
        self.shared.pid.store(0, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.loaded.store(false, Ordering::SeqCst);
    }

    /// Pid of the child while it has not been reaped
    fn live_pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Stop then start again
    pub async fn restart(&mut self) -> Result<ProcessStatus> {
        info!(instance = %self.config.name, "Restarting process");
        self.stop().await?;
        self.restart_count += 1;
        self.start().await
    }

    /// The process has been spawned and has not exited
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The readiness marker was seen since the last start
    pub fn is_loaded(&self) -> bool {
        self.shared.loaded.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ProcessStatus {
        let running = self.is_running();
        ProcessStatus {
            running,
            loaded: self.is_loaded(),
            pid: if running { self.live_pid() } else { None },
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            restart_count: self.restart_count,
            command: self.config.command_line(),
        }
    }

    /// Copy of the retained output, oldest first
    pub async fn logs(&self) -> Vec<String> {
        self.shared.log.read().await.lines()
    }

    pub fn uptime(&self) -> Option<Duration> {
        if self.is_running() {
            self.start_time.map(|start| start.elapsed())
        } else {
            None
        }
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(pid) = self.live_pid() {
            warn!(instance = %self.config.name, pid, "Supervisor dropped with running process, killing it");
            #[cfg(unix)]
            signal_group(pid, Signal::SIGKILL);
        }
        if let Some(handle) = self.io_task.take() {
            handle.abort();
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!("Failed to send {:?} to process group {}: {}", signal, pid, e);
    }
}

/// Multiplex both output streams and the exit status of `child`
async fn supervise(
    name: String,
    marker: String,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    shared: Arc<Shared>,
) {
    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let mut out_open = true;
    let mut err_open = true;
    let mut exited = false;

    while out_open || err_open || !exited {
        tokio::select! {
            line = out.next_line(), if out_open => match line {
                Ok(Some(line)) => record(&name, &marker, &shared, "stdout", line).await,
                Ok(None) => out_open = false,
                Err(e) => {
                    warn!(instance = %name, "Failed to read stdout: {}", e);
                    out_open = false;
                }
            },
            line = err.next_line(), if err_open => match line {
                Ok(Some(line)) => record(&name, &marker, &shared, "stderr", line).await,
                Ok(None) => err_open = false,
                Err(e) => {
                    warn!(instance = %name, "Failed to read stderr: {}", e);
                    err_open = false;
                }
            },
            status = child.wait(), if !exited => {
                exited = true;
                shared.pid.store(0, Ordering::SeqCst);
                shared.running.store(false, Ordering::SeqCst);
                shared.loaded.store(false, Ordering::SeqCst);
                match status {
                    Ok(status) => info!(instance = %name, "Process exited: {}", status),
                    Err(e) => error!(instance = %name, "Failed to wait for process: {}", e),
                }
            }
        }
    }
}

async fn record(name: &str, marker: &str, shared: &Shared, stream: &'static str, line: String) {
    info!(instance = %name, stream, "{}", line);

    if shared.running.load(Ordering::SeqCst)
        && line.contains(marker)
        && !shared.loaded.swap(true, Ordering::SeqCst)
    {
        info!(instance = %name, "Model loaded");
    }

    shared.log.write().await.push(line);
}
