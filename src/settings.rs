//! Session configuration
//!
//! Tunables consumed by the session, connections, transfers, disk layer
//! and DHT. Defaults follow common ed2k client behavior.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Parameters for one index server link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerParameters {
    /// Display name of the server
    pub name: String,
    /// Hostname or dotted quad
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Per-operation timeout (resolve, connect, login) in seconds
    pub operations_timeout: u64,
    /// Idle seconds before a keep-alive probe is written
    pub keep_alive_timeout: u64,
    /// Base reconnect delay in seconds; scaled by failcount
    pub reconnect_timeout: u64,
    /// Seconds between shared-files announces
    pub announce_timeout: u64,
    /// Cap on entries pushed per announce call
    pub announce_items_per_call_limit: usize,
}

impl Default for ServerParameters {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 4661,
            operations_timeout: 30,
            keep_alive_timeout: 200,
            reconnect_timeout: 5,
            announce_timeout: 60,
            announce_items_per_call_limit: 60,
        }
    }
}

/// Configuration for the ed2k session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Nickname sent in the login tag list
    pub client_name: String,
    /// TCP listen port
    pub listen_port: u16,
    /// Seconds of peer inactivity before the connection is closed
    pub peer_timeout: u64,
    /// Seconds allowed for an outbound peer connect
    pub peer_connect_timeout: u64,
    /// Seconds a block request may go unanswered before rescheduling
    pub block_request_timeout: u64,
    /// Consecutive failures before a peer is forgotten
    pub max_failcount: u32,
    /// Base seconds between reconnect attempts to the same peer
    pub min_reconnect_time: u64,
    /// New outbound connection attempts per second
    pub connection_speed: usize,
    /// Session-wide connection cap
    pub connections_limit: usize,
    /// Cap on simultaneous half-open TCP attempts
    pub half_open_limit: usize,
    /// Upload slots handed out by the upload queue
    pub upload_slots: usize,
    /// Download rate limit in bytes/s; 0 means unlimited
    pub download_rate_limit: u64,
    /// Upload rate limit in bytes/s; 0 means unlimited
    pub upload_rate_limit: u64,
    /// Milliseconds between scheduler ticks
    pub tick_interval: u64,
    /// Per-transfer cap on peer list size
    pub max_peerlist_size: usize,
    /// Outstanding block requests per peer
    pub max_outstanding_requests: usize,
    /// Open file handles kept by the file pool
    pub file_pool_size: usize,
    /// Queued disk bytes above which producers stall
    pub max_queued_disk_bytes: usize,
    /// Queued disk bytes below which stalled producers resume
    pub max_queued_disk_bytes_low_watermark: usize,
    /// Reject resume data whose saved mtime differs
    pub ignore_resume_timestamps: bool,
    /// Alert queue capacity
    pub alert_queue_size: usize,
    /// Whether to mark outgoing messages compressible
    pub allow_compression: bool,
    /// DHT enabled
    pub enable_dht: bool,
    /// UDP port for the DHT
    pub dht_port: u16,
    /// Index servers; the first is the master, the rest are slaves
    pub servers: Vec<ServerParameters>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            client_name: "rust-ed2k".to_string(),
            listen_port: 4662,
            peer_timeout: 120,
            peer_connect_timeout: 7,
            block_request_timeout: 30,
            max_failcount: 3,
            min_reconnect_time: 60,
            connection_speed: 6,
            connections_limit: 200,
            half_open_limit: default_half_open_limit(),
            upload_slots: 8,
            download_rate_limit: 0,
            upload_rate_limit: 0,
            tick_interval: 100,
            max_peerlist_size: 4000,
            max_outstanding_requests: 3,
            file_pool_size: 40,
            max_queued_disk_bytes: 16 * 1024 * 1024,
            max_queued_disk_bytes_low_watermark: 4 * 1024 * 1024,
            ignore_resume_timestamps: false,
            alert_queue_size: 1000,
            allow_compression: true,
            enable_dht: true,
            dht_port: 4672,
            servers: Vec::new(),
        }
    }
}

/// Windows historically throttled half-open TCP connects; elsewhere the
/// backlog is plentiful.
fn default_half_open_limit() -> usize {
    if cfg!(windows) {
        8
    } else {
        50
    }
}

impl SessionSettings {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(anyhow::anyhow!("listen_port cannot be 0"));
        }

        if self.connections_limit == 0 {
            return Err(anyhow::anyhow!("connections_limit must be at least 1"));
        }

        if self.half_open_limit == 0 {
            return Err(anyhow::anyhow!("half_open_limit must be at least 1"));
        }

        if self.upload_slots == 0 {
            return Err(anyhow::anyhow!("upload_slots must be at least 1"));
        }

        if self.tick_interval == 0 || self.tick_interval > 1000 {
            return Err(anyhow::anyhow!("tick_interval must be in 1..=1000 ms"));
        }

        if self.max_queued_disk_bytes_low_watermark >= self.max_queued_disk_bytes {
            return Err(anyhow::anyhow!("disk low watermark must be below the high watermark"));
        }

        if self.client_name.is_empty() {
            return Err(anyhow::anyhow!("client_name cannot be empty"));
        }

        Ok(())
    }

    /// Peer inactivity timeout as a `Duration`.
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout)
    }

    /// Outbound connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout)
    }

    /// Block request timeout as a `Duration`.
    pub fn block_request_timeout(&self) -> Duration {
        Duration::from_secs(self.block_request_timeout)
    }

    /// Scheduler tick interval as a `Duration`.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }

    /// Reconnect delay for a peer with the given failcount.
    pub fn reconnect_delay(&self, failcount: u32) -> Duration {
        Duration::from_secs(self.min_reconnect_time * failcount.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = SessionSettings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let settings = SessionSettings {
            listen_port: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_watermark_ordering_enforced() {
        let settings = SessionSettings {
            max_queued_disk_bytes: 1024,
            max_queued_disk_bytes_low_watermark: 2048,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_reconnect_delay_scales_with_failcount() {
        let settings = SessionSettings::default();
        assert_eq!(settings.reconnect_delay(1) * 3, settings.reconnect_delay(3));
        // failcount zero behaves like one
        assert_eq!(settings.reconnect_delay(0), settings.reconnect_delay(1));
    }
}
