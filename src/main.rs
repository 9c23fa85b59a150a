use std::collections::HashMap;

use kernel_warden::{ipc, GlobalConfig, KernelEvent, KernelSupervisor, StartupFlags};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Kernel warden starting");

    let cfg = GlobalConfig::load()?;
    let args: Vec<String> = std::env::args().collect();
    let flags = StartupFlags::from_args_and_env(&args);
    if flags.allow_xray_variant {
        tracing::warn!("Xray kernel builds are allowed by the environment");
    }

    let (supervisor, mut stats_rx) = KernelSupervisor::spawn(cfg.kernel.clone(), flags);

    // Lifecycle events
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} kernel events", n);
                    continue;
                }
                Err(_) => break,
            };
            match event {
                KernelEvent::Connected { connection_id, pid } => {
                    tracing::info!("Connection {} established (kernel pid {})", connection_id, pid);
                }
                KernelEvent::Disconnected { connection_id } => {
                    tracing::info!("Connection {:?} stopped", connection_id);
                }
                KernelEvent::Crashed { connection_id, reason } => {
                    tracing::error!("Connection {:?} lost, kernel crashed: {}", connection_id, reason);
                }
            }
        }
    });

    // Per-tag traffic totals
    tokio::spawn(async move {
        let mut totals: HashMap<(kernel_warden::Direction, String), (u64, u64)> = HashMap::new();
        while let Some(sample) = stats_rx.recv().await {
            let entry = totals.entry((sample.direction, sample.tag.clone())).or_default();
            entry.0 += sample.upload_delta;
            entry.1 += sample.download_delta;
            tracing::debug!(
                "{} {} ({}): +{}/+{} bytes, total {}/{}",
                sample.direction,
                sample.tag,
                sample.protocol,
                sample.upload_delta,
                sample.download_delta,
                entry.0,
                entry.1
            );
        }
    });

    // Optional config tree to start with: first non-flag argument
    if let Some(path) = args.iter().skip(1).find(|a| !a.starts_with("--")) {
        match kernel_warden::materialize::load_materialized(std::path::Path::new(path)) {
            Ok(tree) => {
                if let Err(e) = supervisor.start_connection(tree).await {
                    tracing::error!("Kernel failed to start: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to read config tree {}: {}", path, e),
        }
    }

    let ipc_server = ipc::IPCServer::new(supervisor.clone(), cfg.ipc_listen());
    tokio::select! {
        result = ipc_server.start() => {
            if let Err(e) = result {
                tracing::error!("IPC server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    if let Err(e) = supervisor.shutdown().await {
        tracing::warn!("Supervisor shutdown: {}", e);
    }
    tracing::info!("Kernel warden shutting down");
    Ok(())
}
