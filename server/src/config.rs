//! Server configuration

use crate::sink::DurationAdjustment;
use shared::DEFAULT_PORT;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CSV_PATH: &str = "gaze_log.csv";
pub const DEFAULT_MAX_CLIENTS: usize = 64;

/// Opt-in eviction of card records that never complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRecordPolicy {
    /// Incomplete records untouched for longer than this are dropped
    pub max_age: Duration,
    /// How often the store is swept
    pub sweep_interval: Duration,
}

impl StaleRecordPolicy {
    /// Sweeps four times per `max_age`, but no more than once a second and
    /// at least once a minute.
    pub fn new(max_age: Duration) -> Self {
        let sweep_interval = (max_age / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        Self {
            max_age,
            sweep_interval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    pub csv_path: PathBuf,
    pub max_clients: usize,
    pub adjustment: DurationAdjustment,
    /// None keeps incomplete records forever
    pub stale_records: Option<StaleRecordPolicy>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            csv_path: PathBuf::from(DEFAULT_CSV_PATH),
            max_clients: DEFAULT_MAX_CLIENTS,
            adjustment: DurationAdjustment::default(),
            stale_records: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8765");
        assert_eq!(config.csv_path, PathBuf::from("gaze_log.csv"));
        assert_eq!(config.adjustment.condition, "Carl condition");
        assert_eq!(config.adjustment.offset_secs, 2.0);
        assert!(config.stale_records.is_none());
    }

    #[test]
    fn test_stale_sweep_interval_bounds() {
        assert_eq!(
            StaleRecordPolicy::new(Duration::from_secs(2)).sweep_interval,
            Duration::from_secs(1)
        );
        assert_eq!(
            StaleRecordPolicy::new(Duration::from_secs(120)).sweep_interval,
            Duration::from_secs(30)
        );
        assert_eq!(
            StaleRecordPolicy::new(Duration::from_secs(3600)).sweep_interval,
            Duration::from_secs(60)
        );
    }
}
