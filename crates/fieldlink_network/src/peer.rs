//! Peer directory: device ids learned from local-link traffic and the
//! host each one was last heard from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A device seen on the local link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub device_id: String,
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// Filled in once the peer sends a profile.
    pub callsign: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// `device id → host` directory used to unicast on the local link.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PeerDirectory {
    peers: HashMap<String, PeerEntry>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `device_id` was heard from `addr`. A device that moves
    /// hosts is re-pointed at the newest address.
    pub fn learn(&mut self, device_id: &str, addr: SocketAddr) {
        let now = Utc::now();
        self.peers
            .entry(device_id.to_string())
            .and_modify(|p| {
                p.addr = addr;
                p.last_seen = now;
            })
            .or_insert_with(|| PeerEntry {
                device_id: device_id.to_string(),
                addr,
                callsign: None,
                last_seen: now,
            });
    }

    pub fn set_callsign(&mut self, device_id: &str, callsign: &str) {
        if let Some(peer) = self.peers.get_mut(device_id) {
            peer.callsign = Some(callsign.to_string());
        }
    }

    pub fn resolve(&self, device_id: &str) -> Option<SocketAddr> {
        self.peers.get(device_id).map(|p| p.addr)
    }

    /// Hosts for every resolvable device id, deduplicated.
    pub fn resolve_all(&self, device_ids: &[String]) -> Vec<SocketAddr> {
        let mut hosts = Vec::new();
        for addr in device_ids.iter().filter_map(|id| self.resolve(id)) {
            if !hosts.contains(&addr) {
                hosts.push(addr);
            }
        }
        hosts
    }

    pub fn get(&self, device_id: &str) -> Option<&PeerEntry> {
        self.peers.get(device_id)
    }

    pub fn forget(&mut self, device_id: &str) -> Option<PeerEntry> {
        self.peers.remove(device_id)
    }

    /// Drop peers not heard from within `max_age`. Returns how many went.
    pub fn prune_older_than(&mut self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.peers.len();
        self.peers.retain(|_, p| p.last_seen >= cutoff);
        before - self.peers.len()
    }

    /// All peers, most recently seen first.
    pub fn list(&self) -> Vec<&PeerEntry> {
        let mut all: Vec<_> = self.peers.values().collect();
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Save the directory to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize peer directory: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write peer file: {e}"))
    }

    /// Load the directory from a JSON file, or return an empty one.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<PeerDirectory>(&data) {
                    Ok(directory) => return directory,
                    Err(e) => tracing::warn!("Corrupt peer file: {e}"),
                },
                Err(e) => tracing::warn!("Cannot read peer file: {e}"),
            }
        }
        Self::new()
    }
}

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
