//! Stats Poller - streams per-tag traffic deltas from the running kernel
//!
//! The kernel serves cumulative counters as JSON on its stats endpoint:
//!
//! ```json
//! { "stats": { "inbound":  { "socks-in": { "uplink": 10, "downlink": 20 } },
//!              "outbound": { "proxy":    { "uplink": 10, "downlink": 20 } } } }
//! ```
//!
//! Each poll turns the counters of every tag in the `TagProtocolMap` into a
//! `StatsSample` holding the traffic since the previous poll.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::supervisor::tags::{Direction, TagProtocolMap};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Traffic of one tag since the previous poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSample {
    pub direction: Direction,
    pub tag: String,
    pub protocol: String,
    pub upload_delta: u64,
    pub download_delta: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TrafficCounter {
    #[serde(default)]
    pub uplink: u64,
    #[serde(default)]
    pub downlink: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CounterSnapshot {
    #[serde(default)]
    pub inbound: HashMap<String, TrafficCounter>,
    #[serde(default)]
    pub outbound: HashMap<String, TrafficCounter>,
}

impl CounterSnapshot {
    fn get(&self, direction: Direction, tag: &str) -> Option<TrafficCounter> {
        match direction {
            Direction::Inbound => self.inbound.get(tag).copied(),
            Direction::Outbound => self.outbound.get(tag).copied(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VarsResponse {
    #[serde(default)]
    stats: CounterSnapshot,
}

/// Background poller; at most one polling task at a time.
pub struct StatsPoller {
    endpoint: String,
    interval: Duration,
    listener: mpsc::UnboundedSender<StatsSample>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl StatsPoller {
    pub fn new(endpoint: impl Into<String>, interval: Duration, listener: mpsc::UnboundedSender<StatsSample>) -> Self {
        Self {
            endpoint: endpoint.into(),
            interval,
            listener,
            running: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    /// Start polling for the tags in `map`. A previous task is stopped first.
    pub async fn start(&mut self, map: TagProtocolMap) {
        self.stop().await;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build stats client: {}, using defaults", e);
                reqwest::Client::new()
            });
        let token = CancellationToken::new();

        tracing::info!("Starting stats poller for {} tags at {}", map.len(), self.endpoint);
        let handle = tokio::spawn(poll_loop(
            client,
            self.endpoint.clone(),
            self.interval,
            map,
            self.listener.clone(),
            token.clone(),
        ));
        self.running = Some((token, handle));
    }

    /// Stop polling. Returns once the polling task has exited; calling it
    /// while stopped is a no-op.
    pub async fn stop(&mut self) {
        let Some((token, handle)) = self.running.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::warn!("Stats poller task ended abnormally: {}", e);
        }
        tracing::info!("Stats poller stopped");
    }
}

async fn poll_loop(
    client: reqwest::Client,
    endpoint: String,
    interval: Duration,
    map: TagProtocolMap,
    listener: mpsc::UnboundedSender<StatsSample>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last = HashMap::new();
    let mut error_count: u32 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = tokio::select! {
            _ = token.cancelled() => break,
            snapshot = fetch_counters(&client, &endpoint) => snapshot,
        };

        match snapshot {
            Ok(snapshot) => {
                if error_count > 0 {
                    tracing::info!("Stats endpoint recovered after {} errors", error_count);
                    error_count = 0;
                }
                for sample in compute_deltas(&map, &snapshot, &mut last) {
                    if listener.send(sample).is_err() {
                        tracing::debug!("Stats listener dropped, poller exiting");
                        return;
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                // first 3, then every 10th
                if error_count <= 3 || error_count % 10 == 0 {
                    tracing::warn!("Stats query failed (count: {}): {}", error_count, e);
                }
            }
        }
    }
}

async fn fetch_counters(client: &reqwest::Client, endpoint: &str) -> Result<CounterSnapshot, reqwest::Error> {
    let response = client.get(endpoint).send().await?.error_for_status()?;
    Ok(response.json::<VarsResponse>().await?.stats)
}

/// Turn cumulative counters into per-tag deltas. `last` keeps the previous
/// values between calls. A counter that went backwards (kernel reset) counts
/// from zero. Tags absent from the snapshot are skipped.
pub fn compute_deltas(
    map: &TagProtocolMap,
    snapshot: &CounterSnapshot,
    last: &mut HashMap<(Direction, String), TrafficCounter>,
) -> Vec<StatsSample> {
    let mut samples = Vec::with_capacity(map.len());
    for (direction, tag, protocol) in map.iter() {
        let Some(current) = snapshot.get(direction, tag) else {
            continue;
        };
        let previous = last.insert((direction, tag.to_string()), current).unwrap_or_default();
        samples.push(StatsSample {
            direction,
            tag: tag.to_string(),
            protocol: protocol.to_string(),
            upload_delta: delta(previous.uplink, current.uplink),
            download_delta: delta(previous.downlink, current.downlink),
        });
    }
    samples
}

fn delta(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}
