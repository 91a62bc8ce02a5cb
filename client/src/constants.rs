use std::time::Duration;

pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";
pub const LOCAL_PROXY_BASE: &str = "http://localhost:3005";
pub const PROXY_PATH: &str = "/proxy";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(5000);

/// Drift (seconds) tolerated before a `sync` message forces a reseek
pub const SYNC_THRESHOLD: f64 = 0.5;
pub const FORCED_SYNC_THRESHOLD: f64 = 0.1;
pub const RATE_EPSILON: f64 = 0.01;

pub const HLS_MANIFEST_TIMEOUT: Duration = Duration::from_secs(8);
pub const NATIVE_READY_POLL: Duration = Duration::from_secs(5);
pub const PLAY_TIMEOUT: Duration = Duration::from_millis(3000);
pub const SEEK_SETTLE_TIMEOUT: Duration = Duration::from_millis(300);
pub const BUFFER_SEEK_TIMEOUT: Duration = Duration::from_millis(500);
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
pub const INTERACTION_SYNC_POLL: Duration = Duration::from_secs(1);
pub const PROXY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
