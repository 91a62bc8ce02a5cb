use std::{env, str::FromStr, time::Duration};

use crate::constants::*;

/// Policy values handed to the sync engine. Nothing in the engine decides
/// these on its own; every threshold and timeout is read from here.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Bound on one WebSocket handshake; a stalled one counts as a failure
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub sync_threshold: f64,
    pub forced_sync_threshold: f64,
    pub rate_epsilon: f64,
    pub hls_manifest_timeout: Duration,
    pub native_ready_poll: Duration,
    pub play_timeout: Duration,
    pub seek_settle_timeout: Duration,
    pub buffer_seek_timeout: Duration,
    pub metadata_timeout: Duration,
    pub interaction_sync_poll: Duration,
    pub proxy_probe_timeout: Duration,
    /// Origin the proxy endpoint is served from
    pub proxy_base: String,
    pub proxy_path: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: RECONNECT_DELAY,
            connect_timeout: CONNECT_TIMEOUT,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            sync_threshold: SYNC_THRESHOLD,
            forced_sync_threshold: FORCED_SYNC_THRESHOLD,
            rate_epsilon: RATE_EPSILON,
            hls_manifest_timeout: HLS_MANIFEST_TIMEOUT,
            native_ready_poll: NATIVE_READY_POLL,
            play_timeout: PLAY_TIMEOUT,
            seek_settle_timeout: SEEK_SETTLE_TIMEOUT,
            buffer_seek_timeout: BUFFER_SEEK_TIMEOUT,
            metadata_timeout: METADATA_TIMEOUT,
            interaction_sync_poll: INTERACTION_SYNC_POLL,
            proxy_probe_timeout: PROXY_PROBE_TIMEOUT,
            proxy_base: LOCAL_PROXY_BASE.to_string(),
            proxy_path: PROXY_PATH.to_string(),
        }
    }
}

impl SyncConfig {
    /// Build a config from defaults overridden by `TANDEM_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u32>("TANDEM_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v;
        }
        if let Some(v) = env_millis("TANDEM_RECONNECT_DELAY_MS") {
            config.reconnect_delay = v;
        }
        if let Some(v) = env_millis("TANDEM_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = v;
        }
        if let Some(v) = env_millis("TANDEM_HEARTBEAT_MS") {
            config.heartbeat_interval = v;
        }
        if let Some(v) = env_parse::<f64>("TANDEM_SYNC_THRESHOLD") {
            config.sync_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("TANDEM_FORCED_SYNC_THRESHOLD") {
            config.forced_sync_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("TANDEM_RATE_EPSILON") {
            config.rate_epsilon = v;
        }
        if let Some(v) = env_millis("TANDEM_HLS_TIMEOUT_MS") {
            config.hls_manifest_timeout = v;
        }
        if let Some(v) = env_millis("TANDEM_NATIVE_READY_MS") {
            config.native_ready_poll = v;
        }
        if let Some(v) = env_millis("TANDEM_PLAY_TIMEOUT_MS") {
            config.play_timeout = v;
        }
        if let Some(v) = env_millis("TANDEM_SEEK_TIMEOUT_MS") {
            config.seek_settle_timeout = v;
        }
        if let Some(v) = env_millis("TANDEM_BUFFER_SEEK_TIMEOUT_MS") {
            config.buffer_seek_timeout = v;
        }
        if let Some(v) = env_millis("TANDEM_METADATA_TIMEOUT_MS") {
            config.metadata_timeout = v;
        }
        if let Some(v) = env_millis("TANDEM_INTERACTION_POLL_MS") {
            config.interaction_sync_poll = v;
        }
        if let Some(v) = env_millis("TANDEM_PROXY_PROBE_TIMEOUT_MS") {
            config.proxy_probe_timeout = v;
        }
        if let Ok(base) = env::var("TANDEM_PROXY_BASE") {
            config.proxy_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(path) = env::var("TANDEM_PROXY_PATH") {
            if !path.is_empty() {
                config.proxy_path = path;
            }
        }

        config
    }

    /// Threshold in effect for a `sync` reconciliation
    pub fn threshold(&self, forced: bool) -> f64 {
        if forced {
            self.forced_sync_threshold
        } else {
            self.sync_threshold
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {key}: {raw:?}");
            None
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_selection() {
        let config = SyncConfig::default();
        assert_eq!(config.threshold(false), 0.5);
        assert_eq!(config.threshold(true), 0.1);
    }

    #[test]
    fn test_defaults_match_policy_values() {
        let config = SyncConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.hls_manifest_timeout, Duration::from_secs(8));
        assert_eq!(config.native_ready_poll, Duration::from_secs(5));
        assert_eq!(config.proxy_base, "http://localhost:3005");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_every_policy_value_reads_from_env() {
        for (key, value) in [
            ("TANDEM_CONNECT_TIMEOUT_MS", "2500"),
            ("TANDEM_RATE_EPSILON", "0.05"),
            ("TANDEM_BUFFER_SEEK_TIMEOUT_MS", "750"),
            ("TANDEM_METADATA_TIMEOUT_MS", "4000"),
            ("TANDEM_INTERACTION_POLL_MS", "2000"),
            ("TANDEM_PROXY_PROBE_TIMEOUT_MS", "1500"),
            ("TANDEM_SYNC_THRESHOLD", "not-a-number"),
        ] {
            env::set_var(key, value);
        }

        let config = SyncConfig::from_env();

        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.rate_epsilon, 0.05);
        assert_eq!(config.buffer_seek_timeout, Duration::from_millis(750));
        assert_eq!(config.metadata_timeout, Duration::from_secs(4));
        assert_eq!(config.interaction_sync_poll, Duration::from_secs(2));
        assert_eq!(config.proxy_probe_timeout, Duration::from_millis(1500));
        assert_eq!(config.sync_threshold, 0.5);
    }
}
