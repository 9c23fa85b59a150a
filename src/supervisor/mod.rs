//! Process Supervisor
//!
//! A single supervisor task owns the kernel process, the lifecycle state and
//! the stats poller. `KernelSupervisor` handles send it commands; the kernel
//! waiter reports exits on a separate channel. Both are handled in order by
//! the same task, so lifecycle changes never race each other.

pub mod error;
pub mod kernel_process;
pub mod state_machine;
pub mod tags;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::config::{KernelConfig, StartupFlags};
use crate::materialize::{materialize, ConfigTree};
use crate::stats::{StatsPoller, StatsSample};
use crate::validator::{config_test::validate_config, validate_kernel, ValidationResult};

use error::KernelError;
use kernel_process::{KernelOutput, KernelProcess, OutputLine, OutputSource, OutputLevel, ProcessExit};
use state_machine::{State, StateMachine};
use tags::TagProtocolMap;

/// Lifecycle notifications for callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    Connected { connection_id: Uuid, pid: u32 },
    Disconnected { connection_id: Option<Uuid> },
    Crashed { connection_id: Option<Uuid>, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub state: State,
    pub started: bool,
    pub connection_id: Option<Uuid>,
    pub pid: Option<u32>,
    pub kernel_version: Option<String>,
    pub stats_active: bool,
    pub tag_count: usize,
}

enum Command {
    Start {
        tree: ConfigTree,
        reply: oneshot::Sender<Result<Uuid, KernelError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<KernelStatus>,
    },
    TagMap {
        reply: oneshot::Sender<Option<TagProtocolMap>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the supervisor task. When the last handle is dropped
/// the task stops a running kernel and exits.
#[derive(Clone)]
pub struct KernelSupervisor {
    cmd_tx: mpsc::Sender<Command>,
    started: Arc<AtomicBool>,
    events: broadcast::Sender<KernelEvent>,
    output: KernelOutput,
    config: Arc<KernelConfig>,
}

impl KernelSupervisor {
    /// Spawn the supervisor task. The returned receiver is the single
    /// listener for traffic samples.
    pub fn spawn(config: KernelConfig, flags: StartupFlags) -> (Self, mpsc::UnboundedReceiver<StatsSample>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (stats_tx, stats_rx) = mpsc::unbounded_channel();
        let started = Arc::new(AtomicBool::new(false));
        let output = KernelOutput::new(config.output_buffer_size);
        let config = Arc::new(config);

        let task = SupervisorTask {
            poller: StatsPoller::new(config.api_endpoint.clone(), config.stats_interval(), stats_tx),
            config: config.clone(),
            flags,
            machine: StateMachine::new(),
            started: started.clone(),
            process: None,
            tag_map: None,
            connection_id: None,
            kernel_version: None,
            generation: 0,
            exit_tx,
            events: events.clone(),
            output: output.clone(),
        };
        tokio::spawn(task.run(cmd_rx, exit_rx));

        let handle = Self {
            cmd_tx,
            started,
            events,
            output,
            config,
        };
        (handle, stats_rx)
    }

    /// Materialize `tree`, test it, then launch the kernel with it.
    pub async fn start_connection(&self, tree: ConfigTree) -> Result<Uuid, KernelError> {
        self.request(|reply| Command::Start { tree, reply }).await?
    }

    /// Stop the kernel and the stats poller. Safe to call at any time.
    pub async fn stop_connection(&self) -> Result<(), KernelError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn status(&self) -> Result<KernelStatus, KernelError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Tag map of the current connection, if any.
    pub async fn tag_map(&self) -> Result<Option<TagProtocolMap>, KernelError> {
        self.request(|reply| Command::TagMap { reply }).await
    }

    /// Stop the kernel and end the supervisor task.
    pub async fn shutdown(&self) -> Result<(), KernelError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub async fn validate_kernel(&self) -> ValidationResult {
        validate_kernel(&self.config.kernel_path, &self.config.assets_path, self.config.version_timeout()).await
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output.subscribe()
    }

    pub async fn recent_output(&self, count: usize) -> Vec<OutputLine> {
        self.output.recent(count).await
    }

    pub async fn output_since(&self, since_id: u64) -> Vec<OutputLine> {
        self.output.since(since_id).await
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, KernelError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| KernelError::SupervisorGone)?;
        rx.await.map_err(|_| KernelError::SupervisorGone)
    }
}

struct SupervisorTask {
    config: Arc<KernelConfig>,
    flags: StartupFlags,
    machine: StateMachine,
    /// Read by the exit handler to tell a crash from a requested stop.
    started: Arc<AtomicBool>,
    process: Option<KernelProcess>,
    poller: StatsPoller,
    tag_map: Option<TagProtocolMap>,
    connection_id: Option<Uuid>,
    kernel_version: Option<String>,
    generation: u64,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
    events: broadcast::Sender<KernelEvent>,
    output: KernelOutput,
}

impl SupervisorTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut exit_rx: mpsc::UnboundedReceiver<ProcessExit>) {
        tracing::info!("Kernel supervisor started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle(cmd).await {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("All supervisor handles dropped");
                        self.stop_connection().await;
                        break;
                    }
                },
                Some(exit) = exit_rx.recv() => self.on_process_exit(exit).await,
            }
        }
        tracing::info!("Kernel supervisor stopped");
    }

    /// Returns false once the task should exit.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { tree, reply } => {
                let result = self.start_connection(tree).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop_connection().await;
                let _ = reply.send(());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::TagMap { reply } => {
                let _ = reply.send(self.tag_map.clone());
            }
            Command::Shutdown { reply } => {
                self.stop_connection().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn status(&self) -> KernelStatus {
        KernelStatus {
            state: self.machine.state,
            started: self.started.load(Ordering::SeqCst),
            connection_id: self.connection_id,
            pid: self.process.as_ref().map(|p| p.pid),
            kernel_version: self.kernel_version.clone(),
            stats_active: self.poller.is_active(),
            tag_count: self.tag_map.as_ref().map_or(0, TagProtocolMap::len),
        }
    }

    async fn start_connection(&mut self, tree: ConfigTree) -> Result<Uuid, KernelError> {
        if self.started.load(Ordering::SeqCst) || self.machine.state != State::Stopped {
            tracing::warn!("Status is invalid, expect Stopped when starting a connection");
            return Err(KernelError::InvalidState(self.machine.state));
        }

        self.transition(State::Starting);
        match self.launch(&tree).await {
            Ok(process) => {
                let connection_id = Uuid::new_v4();
                let pid = process.pid;
                self.process = Some(process);
                self.started.store(true, Ordering::SeqCst);
                self.connection_id = Some(connection_id);
                self.transition(State::Running);
                tracing::info!("Kernel running (pid {}, connection {})", pid, connection_id);

                self.start_stats(&tree).await;
                let _ = self.events.send(KernelEvent::Connected { connection_id, pid });
                Ok(connection_id)
            }
            Err(e) => {
                tracing::error!("Kernel failed to start: {}", e);
                self.transition(State::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&mut self, tree: &ConfigTree) -> Result<KernelProcess, KernelError> {
        let config_path = materialize(tree, &self.config.generated_config_path())?;
        let version = validate_config(&self.config, self.flags, &config_path).await?;
        self.kernel_version = Some(version);

        self.generation += 1;
        KernelProcess::spawn(
            &self.config,
            &config_path,
            self.generation,
            self.output.clone(),
            self.exit_tx.clone(),
        )
        .await
    }

    async fn start_stats(&mut self, tree: &ConfigTree) {
        let map = TagProtocolMap::from_config(tree, self.config.use_outbound_stats);

        if self.flags.no_api {
            tracing::info!("API has been disabled by the command line arguments");
        } else if !self.config.enable_api {
            tracing::info!("API has been disabled by the global config option");
        } else if map.is_empty() {
            tracing::info!("API is disabled since no inbound tags configured");
        } else {
            tracing::debug!("Starting API");
            self.poller.start(map.clone()).await;
        }
        self.tag_map = Some(map);
    }

    /// Idempotent teardown for a requested stop.
    async fn stop_connection(&mut self) {
        let was_started = self.teardown().await;
        if self.machine.state == State::Running {
            self.transition(State::Stopped);
        }
        if was_started {
            let connection_id = self.connection_id.take();
            tracing::info!("Kernel stopped");
            let _ = self.events.send(KernelEvent::Disconnected { connection_id });
        }
    }

    async fn on_process_exit(&mut self, exit: ProcessExit) {
        if exit.generation != self.generation || !self.started.load(Ordering::SeqCst) {
            tracing::debug!("Ignoring exit of generation {}: {}", exit.generation, exit.status);
            return;
        }

        tracing::error!("Kernel crashed: {}", exit.status);
        self.transition(State::Crashed);
        self.teardown().await;
        let connection_id = self.connection_id.take();
        self.output
            .push(OutputSource::System, "Kernel crashed".to_string(), OutputLevel::Error)
            .await;
        let _ = self.events.send(KernelEvent::Crashed {
            connection_id,
            reason: exit.status,
        });
        self.transition(State::Stopped);
    }

    /// Stop the poller, clear the started flag, then end the kernel.
    /// Returns whether the connection was started.
    async fn teardown(&mut self) -> bool {
        if self.poller.is_active() {
            self.poller.stop().await;
        }

        // Must read false before the kernel exits: the exit handler treats an
        // exit seen while started as a crash.
        let was_started = self.started.swap(false, Ordering::SeqCst);

        if let Some(mut process) = self.process.take() {
            process.stop(self.config.stop_timeout()).await;
        }
        self.tag_map = None;
        was_started
    }

    fn transition(&mut self, to: State) {
        if let Err(e) = self.machine.transition(to) {
            tracing::error!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_status_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let config = KernelConfig::new(dir.path().join("v2ray"), dir.path());
        let (supervisor, _stats) = KernelSupervisor::spawn(config, StartupFlags::default());

        let status = supervisor.status().await.unwrap();
        assert_eq!(status.state, State::Stopped);
        assert!(!status.started);
        assert!(status.pid.is_none());
        assert!(!supervisor.is_started());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = KernelConfig::new(dir.path().join("v2ray"), dir.path());
        let (supervisor, _stats) = KernelSupervisor::spawn(config, StartupFlags::default());

        supervisor.stop_connection().await.unwrap();
        supervisor.stop_connection().await.unwrap();
        assert_eq!(supervisor.status().await.unwrap().state, State::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_missing_kernel_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::new(dir.path().join("v2ray"), dir.path());
        config.generated_dir = dir.path().join("generated");
        let (supervisor, _stats) = KernelSupervisor::spawn(config, StartupFlags::default());

        let err = supervisor
            .start_connection(serde_json::json!({ "inbounds": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::NotFound(_)));
        assert_eq!(supervisor.status().await.unwrap().state, State::Stopped);
        assert!(!supervisor.is_started());
        // the config is materialized before the kernel is checked
        assert!(dir.path().join("generated").join("config.gen.json").is_file());
    }

    #[tokio::test]
    async fn test_shutdown_ends_task() {
        let dir = tempfile::tempdir().unwrap();
        let config = KernelConfig::new(dir.path().join("v2ray"), dir.path());
        let (supervisor, _stats) = KernelSupervisor::spawn(config, StartupFlags::default());

        supervisor.shutdown().await.unwrap();
        assert!(matches!(supervisor.status().await, Err(KernelError::SupervisorGone)));
    }
}
