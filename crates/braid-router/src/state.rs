//! Read-only state snapshot
//!
//! Serializable view of a router's bonds and session table, served by the
//! node's HTTP state endpoint and pretty-printed by the console.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of one router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterState {
    /// Local peer name
    pub name: String,
    /// Bonds with their channels
    pub bonds: Vec<BondState>,
    /// Active sessions, one entry per pair
    pub sessions: Vec<SessionState>,
}

/// One bond (all channels sharing a peer name)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondState {
    pub name: String,
    pub channels: Vec<ChannelState>,
}

/// One authenticated channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelState {
    pub index: u32,
    /// Concurrent session halves on this channel
    pub used: u64,
    pub remote: String,
    pub connected_at: DateTime<Utc>,
    /// Milliseconds since the last inbound frame
    pub idle_ms: u64,
}

/// One session, rendered as its two endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub from: EndpointState,
    pub to: EndpointState,
}

/// One session endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointState {
    /// `"channel"` or `"raw"`
    pub kind: String,
    /// Endpoint identity
    pub id: u64,
    /// Session id on that endpoint
    pub sid: u64,
    /// Peer name for channels, target URI for raw streams
    pub label: String,
}

impl RouterState {
    /// Total channels across all bonds
    pub fn channel_count(&self) -> usize {
        self.bonds.iter().map(|b| b.channels.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes() {
        let state = RouterState {
            name: "master".into(),
            bonds: vec![BondState {
                name: "slaver".into(),
                channels: vec![ChannelState {
                    index: 0,
                    used: 2,
                    remote: "127.0.0.1:9232".into(),
                    connected_at: Utc::now(),
                    idle_ms: 12,
                }],
            }],
            sessions: vec![],
        };

        let json = serde_json::to_string(&state).unwrap();
        let back: RouterState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "master");
        assert_eq!(back.channel_count(), 1);
        assert_eq!(back.bonds[0].channels[0].used, 2);
    }
}
