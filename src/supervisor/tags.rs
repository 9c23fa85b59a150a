//! Tag → protocol lookup used to label traffic counters.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Tag of the kernel's internal control inbound; never user traffic.
pub const API_INBOUND_TAG: &str = "_WARDEN_API_INBOUND_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// Name of the config tree section holding this direction's entries
    pub fn section(self) -> &'static str {
        match self {
            Self::Inbound => "inbounds",
            Self::Outbound => "outbounds",
        }
    }

    /// Key used by the kernel's stats counters
    pub fn counter_key(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.counter_key())
    }
}

/// `(direction, tag) → protocol`, derived once per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagProtocolMap {
    entries: BTreeMap<Direction, BTreeMap<String, String>>,
}

impl TagProtocolMap {
    /// Collect tags from `tree`. Inbounds are always included; outbounds only
    /// when `include_outbound` is set. Empty tags and the API inbound are
    /// skipped.
    pub fn from_config(tree: &Value, include_outbound: bool) -> Self {
        let mut map = Self::default();
        let directions: &[Direction] = if include_outbound {
            &[Direction::Inbound, Direction::Outbound]
        } else {
            &[Direction::Inbound]
        };

        for &direction in directions {
            let Some(items) = tree.get(direction.section()).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let tag = item.get("tag").and_then(Value::as_str).unwrap_or_default();
                if tag == API_INBOUND_TAG {
                    continue;
                }
                if tag.is_empty() {
                    tracing::info!("Ignored {} with empty tag", direction);
                    continue;
                }
                let protocol = item.get("protocol").and_then(Value::as_str).unwrap_or_default();
                map.insert(direction, tag, protocol);
            }
        }
        map
    }

    fn insert(&mut self, direction: Direction, tag: &str, protocol: &str) {
        let section = self.entries.entry(direction).or_default();
        if let Some(previous) = section.insert(tag.to_string(), protocol.to_string()) {
            tracing::warn!("Duplicate {} tag '{}' (was {}), keeping the last entry", direction, tag, previous);
        }
    }

    pub fn protocol(&self, direction: Direction, tag: &str) -> Option<&str> {
        self.entries.get(&direction)?.get(tag).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// All `(direction, tag, protocol)` triples, inbounds first.
    pub fn iter(&self) -> impl Iterator<Item = (Direction, &str, &str)> + '_ {
        self.entries
            .iter()
            .flat_map(|(d, tags)| tags.iter().map(move |(t, p)| (*d, t.as_str(), p.as_str())))
    }
}
