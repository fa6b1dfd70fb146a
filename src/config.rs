//! Configuration for the hub.
//!
//! This module defines every tunable used by [`CloudHub`](crate::CloudHub).
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON by the embedding process.
//!
//! # Quick Start
//!
//! ```rust
//! use cloudhub::config::HubConfig;
//!
//! let mut config = HubConfig::default();
//! config.quic.enabled = false;
//! config.queue.capacity = 512;
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! HubConfig
//! ├── websocket: WebSocketConfig    # Stream-over-TLS listener
//! ├── quic: QuicConfig              # Datagram-stream listener
//! ├── unix_socket: UnixSocketConfig # Local storage-driver pass-through
//! ├── credentials: CredentialConfig # Certificate bundle + tokens
//! ├── admission: AdmissionConfig    # Handshake limits
//! ├── queue: QueueConfig            # Per-node queue + dispatcher
//! ├── sync: SyncConfig              # Resync tracker + flush
//! └── store: SyncStoreConfig        # SQLite sync-record persistence
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! websocket:
//!   address: "0.0.0.0"
//!   port: 10000
//! quic:
//!   port: 10001
//!   max_incoming_streams: 10000
//! credentials:
//!   server_names: ["cloudhub.example.com", "10.0.0.12"]
//!   token_validity_sec: 43200
//! queue:
//!   capacity: 1024
//!   enqueue_timeout: "5s"
//! store:
//!   sqlite_path: "/var/lib/cloudhub/sync_records.db"
//! ```

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `CloudHub::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub quic: QuicConfig,
    #[serde(default)]
    pub unix_socket: UnixSocketConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub store: SyncStoreConfig,
}

impl HubConfig {
    /// Whether any network-facing listener is enabled.
    pub fn has_network_listener(&self) -> bool {
        self.websocket.enabled || self.quic.enabled
    }

    /// Minimal config for tests: no network listeners, in-memory store,
    /// short timeouts.
    pub fn for_testing() -> Self {
        Self {
            websocket: WebSocketConfig {
                enabled: false,
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                ..Default::default()
            },
            quic: QuicConfig {
                enabled: false,
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 0,
                ..Default::default()
            },
            unix_socket: UnixSocketConfig::default(),
            credentials: CredentialConfig::default(),
            admission: AdmissionConfig {
                admission_timeout: "500ms".to_string(),
                ..Default::default()
            },
            queue: QueueConfig {
                capacity: 64,
                enqueue_timeout: "200ms".to_string(),
                dispatcher_stop_timeout: "1s".to_string(),
                ..Default::default()
            },
            sync: SyncConfig {
                resync_interval_sec: 3600,
                cache_sync_timeout: "2s".to_string(),
                flush_interval: "100ms".to_string(),
                ..Default::default()
            },
            store: SyncStoreConfig::in_memory(),
        }
    }

    /// Reject configurations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(HubError::Config("queue.capacity must be > 0".into()));
        }
        if self.queue.max_in_flight == 0 {
            return Err(HubError::Config("queue.max_in_flight must be > 0".into()));
        }
        if self.quic.enabled && self.quic.max_incoming_streams == 0 {
            return Err(HubError::Config("quic.max_incoming_streams must be > 0".into()));
        }
        if !self.websocket.path.starts_with('/') {
            return Err(HubError::Config(format!(
                "websocket.path must start with '/', got {:?}",
                self.websocket.path
            )));
        }
        if self.credentials.token_validity_sec == 0 {
            return Err(HubError::Config("credentials.token_validity_sec must be > 0".into()));
        }
        if self.credentials.token_rotation_interval_sec > self.credentials.token_validity_sec {
            return Err(HubError::Config(format!(
                "token rotation interval ({}s) exceeds token validity ({}s)",
                self.credentials.token_rotation_interval_sec, self.credentials.token_validity_sec
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Listeners
// ═══════════════════════════════════════════════════════════════════════════════

/// Stream-over-TLS (WebSocket) listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_address")]
    pub address: IpAddr,

    #[serde(default = "default_websocket_port")]
    pub port: u16,

    /// The single upgrade path nodes connect to.
    #[serde(default = "default_websocket_path")]
    pub path: String,

    /// Budget for TCP accept → TLS → HTTP upgrade.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: String,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_address(),
            port: default_websocket_port(),
            path: default_websocket_path(),
            handshake_timeout: default_handshake_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl WebSocketConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn handshake_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.handshake_timeout, Duration::from_secs(10))
    }
}

/// Datagram-stream (QUIC) listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuicConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_address")]
    pub address: IpAddr,

    #[serde(default = "default_quic_port")]
    pub port: u16,

    /// Maximum concurrent bidirectional streams a node may open.
    #[serde(default = "default_max_incoming_streams")]
    pub max_incoming_streams: u32,

    #[serde(default = "default_quic_idle_timeout_sec")]
    pub idle_timeout_sec: u64,

    #[serde(default = "default_quic_keep_alive_sec")]
    pub keep_alive_sec: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_address(),
            port: default_quic_port(),
            max_incoming_streams: default_max_incoming_streams(),
            idle_timeout_sec: default_quic_idle_timeout_sec(),
            keep_alive_sec: default_quic_keep_alive_sec(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl QuicConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Local unix-domain socket for the storage-driver integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnixSocketConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    #[serde(default = "default_unix_socket_path")]
    pub path: String,
}

impl Default for UnixSocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_unix_socket_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_websocket_port() -> u16 {
    10000
}

fn default_quic_port() -> u16 {
    10001
}

fn default_websocket_path() -> String {
    "/".to_string()
}

fn default_handshake_timeout() -> String {
    "10s".to_string()
}

fn default_max_frame_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_max_incoming_streams() -> u32 {
    10_000
}

fn default_quic_idle_timeout_sec() -> u64 {
    30
}

fn default_quic_keep_alive_sec() -> u64 {
    10
}

fn default_unix_socket_path() -> String {
    "/var/lib/cloudhub/cloudhub.sock".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// CredentialConfig + AdmissionConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Certificate bundle and token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// DNS names / IPs placed in the server certificate SAN.
    #[serde(default = "default_server_names")]
    pub server_names: Vec<String>,

    /// Validity window of an issued token (seconds). Default 12h.
    #[serde(default = "default_token_validity_sec")]
    pub token_validity_sec: u64,

    /// How often the join token is reissued (seconds).
    #[serde(default = "default_token_rotation_interval_sec")]
    pub token_rotation_interval_sec: u64,

    /// Accept TLS clients without a certificate and require an admission
    /// token as their first frame instead.
    #[serde(default = "default_true")]
    pub allow_token_join: bool,
}

fn default_server_names() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

fn default_token_validity_sec() -> u64 {
    12 * 60 * 60
}

fn default_token_rotation_interval_sec() -> u64 {
    12 * 60 * 60
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            server_names: default_server_names(),
            token_validity_sec: default_token_validity_sec(),
            token_rotation_interval_sec: default_token_rotation_interval_sec(),
            allow_token_join: true,
        }
    }
}

impl CredentialConfig {
    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_sec)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.token_rotation_interval_sec)
    }
}

/// Limits applied between TLS accept and registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// How long a certificate-less connection has to present its token.
    #[serde(default = "default_admission_timeout")]
    pub admission_timeout: String,

    /// Maximum handshakes in progress at once (bulkhead).
    #[serde(default = "default_max_concurrent_handshakes")]
    pub max_concurrent_handshakes: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (reconnect storms)
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_admission_rate_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_admission_rate_burst")]
    pub rate_limit_burst: u32,
}

fn default_admission_timeout() -> String {
    "10s".to_string()
}

fn default_max_concurrent_handshakes() -> usize {
    1024
}

fn default_admission_rate_per_sec() -> u32 {
    500
}

fn default_admission_rate_burst() -> u32 {
    100
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            admission_timeout: default_admission_timeout(),
            max_concurrent_handshakes: default_max_concurrent_handshakes(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_admission_rate_per_sec(),
            rate_limit_burst: default_admission_rate_burst(),
        }
    }
}

impl AdmissionConfig {
    pub fn admission_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.admission_timeout, Duration::from_secs(10))
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig: per-node queue + dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum messages (pending + in flight) held per node.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Bounded wait for space before `Enqueue` fails with `QueueFull`.
    #[serde(default = "default_enqueue_timeout")]
    pub enqueue_timeout: String,

    /// Sent-but-unacknowledged messages allowed per node.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Close a connection that has sent nothing (not even keepalives) for this long.
    #[serde(default = "default_node_idle_timeout_sec")]
    pub node_idle_timeout_sec: u64,

    /// How long supersession waits for the previous dispatcher to exit.
    #[serde(default = "default_dispatcher_stop_timeout")]
    pub dispatcher_stop_timeout: String,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_enqueue_timeout() -> String {
    "5s".to_string()
}

fn default_max_in_flight() -> usize {
    16
}

fn default_node_idle_timeout_sec() -> u64 {
    90
}

fn default_dispatcher_stop_timeout() -> String {
    "5s".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            enqueue_timeout: default_enqueue_timeout(),
            max_in_flight: default_max_in_flight(),
            node_idle_timeout_sec: default_node_idle_timeout_sec(),
            dispatcher_stop_timeout: default_dispatcher_stop_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn enqueue_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.enqueue_timeout, Duration::from_secs(5))
    }

    pub fn node_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.node_idle_timeout_sec)
    }

    pub fn dispatcher_stop_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.dispatcher_stop_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfig: resync tracker + sync-record flushing
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often every known node is compared against desired state.
    #[serde(default = "default_resync_interval_sec")]
    pub resync_interval_sec: u64,

    /// Actual backoff = min(base * 2^consecutive_failures, max).
    #[serde(default = "default_backoff_base_sec")]
    pub backoff_base_sec: u64,

    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,

    /// Readiness gate budget for the object-store caches.
    #[serde(default = "default_cache_sync_timeout")]
    pub cache_sync_timeout: String,

    /// Debounce interval for persisting dirty sync records.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_resync_interval_sec() -> u64 {
    60
}

fn default_backoff_base_sec() -> u64 {
    5
}

fn default_backoff_max_sec() -> u64 {
    300 // 5 minutes
}

fn default_cache_sync_timeout() -> String {
    "60s".to_string()
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            resync_interval_sec: default_resync_interval_sec(),
            backoff_base_sec: default_backoff_base_sec(),
            backoff_max_sec: default_backoff_max_sec(),
            cache_sync_timeout: default_cache_sync_timeout(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_sec)
    }

    /// Calculate backoff duration for a given number of consecutive failures.
    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        let backoff_secs = self
            .backoff_base_sec
            .saturating_mul(2u64.saturating_pow(consecutive_failures));
        Duration::from_secs(backoff_secs.min(self.backoff_max_sec))
    }

    pub fn cache_sync_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.cache_sync_timeout, Duration::from_secs(60))
    }

    pub fn flush_interval_duration(&self) -> Duration {
        parse_duration_or(&self.flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncStoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SyncRecord persistence.
///
/// Records survive a hub restart so the tracker can tell which versions a
/// node already acknowledged before the in-memory queues were lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStoreConfig {
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for SyncStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "cloudhub_sync_records.db".to_string(),
            wal_mode: true,
        }
    }
}

impl SyncStoreConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

/// Parse a humantime duration, falling back when malformed.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
