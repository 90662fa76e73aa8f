//! Environment configuration (§6, §11). Mirrors the teacher's
//! `STUDIOCOMMAND_BIND`-style `env::var().unwrap_or_else(...)` pattern, but
//! typed and collected into one struct constructed once at startup.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub universe_count: u16,
    pub refresh_rate_hz: f64,
    pub idle_rate_hz: f64,
    pub high_rate_window: Duration,
    pub artnet_enabled: bool,
    pub artnet_broadcast: Option<Ipv4Addr>,
    pub artnet_port: u16,
    pub drift_threshold: Option<Duration>,
    pub drift_warning_throttle: Duration,
    pub preview_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub operation_timeout: Duration,
    pub cue_cache_ttl: Duration,
    pub playback_status_throttle: Duration,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            universe_count: 4,
            refresh_rate_hz: 44.0,
            idle_rate_hz: 1.0,
            high_rate_window: Duration::from_millis(2000),
            artnet_enabled: true,
            artnet_broadcast: None,
            artnet_port: 6454,
            drift_threshold: Some(Duration::from_millis(10)),
            drift_warning_throttle: Duration::from_millis(1000),
            preview_timeout: Duration::from_millis(1_800_000),
            shutdown_timeout: Duration::from_millis(10_000),
            operation_timeout: Duration::from_millis(5_000),
            cue_cache_ttl: Duration::from_secs(5 * 60),
            playback_status_throttle: Duration::from_millis(100),
            bind_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {v:?}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("invalid boolean for {key}: {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads recognized options from the process environment (§6). Invalid
    /// values fail fast — this is the only place startup aborts outright.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let universe_count = env_or("DMX_UNIVERSE_COUNT", defaults.universe_count)?;
        let refresh_rate_hz = env_or("DMX_REFRESH_RATE", defaults.refresh_rate_hz)?;
        let idle_rate_hz = env_or("DMX_IDLE_RATE", defaults.idle_rate_hz)?;
        let high_rate_window_ms: u64 = env_or(
            "DMX_HIGH_RATE_DURATION",
            defaults.high_rate_window.as_millis() as u64,
        )?;
        let artnet_enabled = env_bool("ARTNET_ENABLED", defaults.artnet_enabled)?;

        let artnet_broadcast = match std::env::var("ARTNET_BROADCAST") {
            Ok(v) => Some(
                v.parse::<Ipv4Addr>()
                    .with_context(|| format!("invalid ARTNET_BROADCAST: {v:?}"))?,
            ),
            Err(_) => None,
        };
        if artnet_enabled && artnet_broadcast.is_none() {
            bail!("ARTNET_BROADCAST is required when ARTNET_ENABLED is true");
        }

        let drift_threshold_ms: u64 = env_or("DMX_DRIFT_THRESHOLD", 10)?;
        let drift_threshold = if drift_threshold_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(drift_threshold_ms))
        };

        let preview_timeout_ms: u64 = env_or(
            "PREVIEW_TIMEOUT_MS",
            defaults.preview_timeout.as_millis() as u64,
        )?;
        let shutdown_timeout_ms: u64 = env_or(
            "SHUTDOWN_TIMEOUT_MS",
            defaults.shutdown_timeout.as_millis() as u64,
        )?;
        let operation_timeout_ms: u64 = env_or(
            "OPERATION_TIMEOUT_MS",
            defaults.operation_timeout.as_millis() as u64,
        )?;

        let bind_addr = std::env::var("LACYLIGHTS_BIND").unwrap_or(defaults.bind_addr);

        Ok(Config {
            universe_count,
            refresh_rate_hz,
            idle_rate_hz,
            high_rate_window: Duration::from_millis(high_rate_window_ms),
            artnet_enabled,
            artnet_broadcast,
            artnet_port: 6454,
            drift_threshold,
            drift_warning_throttle: defaults.drift_warning_throttle,
            preview_timeout: Duration::from_millis(preview_timeout_ms),
            shutdown_timeout: Duration::from_millis(shutdown_timeout_ms),
            operation_timeout: Duration::from_millis(operation_timeout_ms),
            cue_cache_ttl: defaults.cue_cache_ttl,
            playback_status_throttle: defaults.playback_status_throttle,
            bind_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = Config::default();
        assert_eq!(c.universe_count, 4);
        assert_eq!(c.refresh_rate_hz, 44.0);
        assert_eq!(c.idle_rate_hz, 1.0);
        assert_eq!(c.high_rate_window, Duration::from_millis(2000));
        assert_eq!(c.preview_timeout, Duration::from_millis(1_800_000));
    }
}
