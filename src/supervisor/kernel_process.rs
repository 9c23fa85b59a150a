//! Kernel Process - the long-running kernel child
//!
//! - stdout/stderr capture into a bounded output buffer with live broadcast
//! - exit notification tagged with the connection generation
//! - graceful terminate, forced kill and wait-for-exit

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};

use crate::config::KernelConfig;
use crate::utils::kernel_command;

use super::error::KernelError;

/// Matches the `[Level]` marker in kernel log lines.
const KERNEL_LOG_PATTERN: &str = r"\[(?P<level>Debug|Info|Warning|Error)\]";

// ─── Output Types ────────────────────────────────────────────

/// A single line of kernel console output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    /// Sequential ID, stable across kernel restarts
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: OutputSource,
    pub content: String,
    pub level: OutputLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
    /// Lifecycle messages from the supervisor itself
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Ring buffer of recent output lines.
struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    next_id: u64,
    max_size: usize,
}

impl OutputBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: OutputSource, content: String, level: OutputLevel) -> OutputLine {
        let line = OutputLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    fn get_since(&self, since_id: u64) -> Vec<OutputLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<OutputLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

/// Output history shared by every kernel run of one supervisor, so
/// subscribers and buffered lines survive restarts.
#[derive(Clone)]
pub struct KernelOutput {
    buffer: Arc<Mutex<OutputBuffer>>,
    tx: broadcast::Sender<OutputLine>,
}

impl KernelOutput {
    pub fn new(max_lines: usize) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            buffer: Arc::new(Mutex::new(OutputBuffer::with_capacity(max_lines))),
            tx,
        }
    }

    pub async fn push(&self, source: OutputSource, content: String, level: OutputLevel) {
        let line = self.buffer.lock().await.push(source, content, level);
        let _ = self.tx.send(line);
    }

    pub async fn since(&self, since_id: u64) -> Vec<OutputLine> {
        self.buffer.lock().await.get_since(since_id)
    }

    pub async fn recent(&self, count: usize) -> Vec<OutputLine> {
        self.buffer.lock().await.get_recent(count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.tx.subscribe()
    }
}

// ─── Kernel Process ──────────────────────────────────────────

/// Sent by the waiter task when the kernel exits, for whatever reason.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub generation: u64,
    pub status: String,
}

/// Handle to a running kernel. Dropping it kills the kernel.
pub struct KernelProcess {
    pub pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    running_rx: watch::Receiver<bool>,
}

impl KernelProcess {
    /// Spawn `<kernel> -config <config_path>` with the asset location set.
    ///
    /// Output lines go to `output`; the exit is reported on `exit_tx` tagged
    /// with `generation`.
    pub async fn spawn(
        config: &KernelConfig,
        config_path: &Path,
        generation: u64,
        output: KernelOutput,
        exit_tx: mpsc::UnboundedSender<ProcessExit>,
    ) -> Result<Self, KernelError> {
        let mut cmd = kernel_command(&config.kernel_path, &config.assets_path);
        cmd.arg("-config").arg(config_path).kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| KernelError::SpawnFailed(format!("{}: {}", config.kernel_path.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| KernelError::SpawnFailed("kernel exited before reporting a PID".to_string()))?;

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (running_tx, running_rx) = watch::channel(true);

        let log_regex = match Regex::new(KERNEL_LOG_PATTERN) {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                tracing::warn!("Invalid kernel log pattern: {}", e);
                None
            }
        };

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputSource::Stdout, output.clone(), log_regex.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputSource::Stderr, output.clone(), log_regex);
        }

        // ── process waiter ───────────────────────────────────
        {
            let output = output.clone();
            tokio::spawn(async move {
                // A dropped handle counts as a kill request.
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_rx => {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("Failed to kill kernel (pid {}): {}", pid, e);
                        }
                        child.wait().await
                    }
                };
                let exit_msg = match status {
                    Ok(status) => format!("Kernel exited with {}", status),
                    Err(e) => format!("Failed to wait for kernel: {}", e),
                };
                tracing::debug!("{} (pid {}, generation {})", exit_msg, pid, generation);
                // The pid may be reused once reaped; no signal may target it after this.
                let _ = running_tx.send(false);
                output.push(OutputSource::System, exit_msg.clone(), OutputLevel::Info).await;
                let _ = exit_tx.send(ProcessExit { generation, status: exit_msg });
            });
        }

        output
            .push(OutputSource::System, format!("Kernel started with PID {}", pid), OutputLevel::Info)
            .await;

        Ok(Self {
            pid,
            kill_tx: Some(kill_tx),
            running_rx,
        })
    }

    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Ask the kernel to exit (SIGTERM). Platforms without signals kill it.
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Err(e) = signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
                tracing::debug!("SIGTERM to kernel (pid {}) failed: {}", self.pid, e);
            }
        }
        #[cfg(not(unix))]
        self.force_kill();
    }

    pub fn force_kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait until the waiter task has observed the exit.
    pub async fn wait_for_exit(&mut self) {
        while self.is_running() {
            if self.running_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Terminate, wait up to `grace`, then kill and wait for the exit.
    pub async fn stop(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        self.terminate();
        if tokio::time::timeout(grace, self.wait_for_exit()).await.is_err() {
            tracing::warn!(
                "Kernel (pid {}) did not exit within {}s, killing it",
                self.pid,
                grace.as_secs()
            );
            self.force_kill();
            self.wait_for_exit().await;
        }
    }
}

fn spawn_reader<R>(stream: R, source: OutputSource, output: KernelOutput, re: Option<Arc<Regex>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            let mut level = parse_log_level(&line, re.as_deref());
            // stderr lines default to at least Warn
            if source == OutputSource::Stderr && level == OutputLevel::Info {
                level = OutputLevel::Warn;
            }
            output.push(source, line, level).await;
        }
    });
}

// ─── Helpers ─────────────────────────────────────────────────

/// Parse the level of a kernel log line, e.g.
/// `2023/05/01 12:00:00 [Warning] app/dispatcher: ...`.
/// Lines without a level marker default to Info.
fn parse_log_level(line: &str, pattern: Option<&Regex>) -> OutputLevel {
    if let Some(re) = pattern {
        if let Some(level) = re.captures(line).and_then(|c| c.name("level")) {
            return match level.as_str() {
                "Error" => OutputLevel::Error,
                "Warning" => OutputLevel::Warn,
                "Debug" => OutputLevel::Debug,
                _ => OutputLevel::Info,
            };
        }
    }
    OutputLevel::Info
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────
