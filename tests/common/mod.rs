//! Shared fixtures: fake kernel scripts and a fake stats endpoint.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use kernel_warden::supervisor::kernel_process::OutputLine;
use kernel_warden::{KernelConfig, KernelEvent};
use serde_json::{json, Value};
use tokio::sync::broadcast;

#[path = "../../src/test_support.rs"]
mod fake_kernel;

pub use fake_kernel::{FakeKernel, BAD_INVOCATION_EXIT, SHUTDOWN_MARKER};

/// Error line printed by kernels installed with a failing config test.
pub const CONFIG_TEST_ERROR: &str = "main: failed to read config";

/// Kernel that answers `--version` and `-test`, and stays up (or exits
/// after `run_secs`) when launched with `-config`.
pub fn install_kernel(dir: &Path, test_exit: i32, run_secs: Option<u32>) -> PathBuf {
    FakeKernel {
        test_exit,
        test_error: CONFIG_TEST_ERROR,
        run_secs,
        ..Default::default()
    }
    .install(dir)
}

pub fn kernel_config(dir: &Path, exec: &Path, api_endpoint: &str) -> KernelConfig {
    let mut config = KernelConfig::new(exec, dir);
    config.generated_dir = dir.join("generated");
    config.api_endpoint = api_endpoint.to_string();
    config.stats_interval_ms = 50;
    config.stop_timeout_secs = 5;
    config
}

pub fn config_tree() -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [
            { "tag": "socks-in", "protocol": "socks", "port": 1080 },
            { "tag": "http-in", "protocol": "http", "port": 8080 },
            { "tag": "_WARDEN_API_INBOUND_", "protocol": "dokodemo-door", "port": 15490 },
            { "tag": "", "protocol": "http", "port": 8081 }
        ],
        "outbounds": [
            { "tag": "proxy", "protocol": "vmess" },
            { "tag": "direct", "protocol": "freedom" }
        ]
    })
}

pub async fn next_event(rx: &mut broadcast::Receiver<KernelEvent>) -> KernelEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for kernel event")
        .expect("event channel closed")
}

/// Wait until a kernel output line containing `needle` arrives.
pub async fn wait_for_output(rx: &mut broadcast::Receiver<OutputLine>, needle: &str) {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(line) if line.content.contains(needle) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("output channel closed"),
            }
        }
    })
    .await;
    assert!(found.is_ok(), "timed out waiting for output containing {:?}", needle);
}

/// Serve cumulative counters that grow by 100 up / 200 down per request.
/// Returns the endpoint URL.
pub async fn spawn_stats_endpoint() -> String {
    let hits = Arc::new(AtomicU64::new(0));
    let router = Router::new()
        .route("/debug/vars", get(vars_handler))
        .with_state(hits);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/debug/vars", addr)
}

async fn vars_handler(State(hits): State<Arc<AtomicU64>>) -> Json<Value> {
    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "stats": {
            "inbound": {
                "socks-in": { "uplink": n * 100, "downlink": n * 200 },
                "http-in": { "uplink": n * 10, "downlink": n * 20 }
            },
            "outbound": {
                "proxy": { "uplink": n * 100, "downlink": n * 200 }
            }
        }
    }))
}
