use std::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{make_heading_characteristic_uuid, make_headset_service_uuid, DEFAULT_LINGER_TIMEOUT, DEFAULT_SCAN_WINDOW, MIN_LINGER_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// How long (milliseconds) a connected headset may stay quiet before the session lingers.
    pub linger_timeout_ms: u64,
    /// How long (milliseconds) to scan before reporting the headsets that were found.
    pub scan_window_ms: u64,
    /// Number of heading samples to retain for replay; 0 disables the replay log.
    pub heading_replay_capacity: usize,
    pub service_uuid: Uuid,
    pub heading_characteristic_uuid: Uuid,
    pub log_level: String,
}

impl Config {
    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// `linger_timeout_ms`, raised to MIN_LINGER_TIMEOUT if it is shorter.
    pub fn linger_timeout(&self) -> Duration {
        Duration::from_millis(self.linger_timeout_ms.max(MIN_LINGER_TIMEOUT))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            linger_timeout_ms: DEFAULT_LINGER_TIMEOUT,
            scan_window_ms: DEFAULT_SCAN_WINDOW,
            heading_replay_capacity: 0,
            service_uuid: make_headset_service_uuid(),
            heading_characteristic_uuid: make_heading_characteristic_uuid(),
            log_level: String::from("info"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"lingerTimeoutMs": 500, "logLevel": "debug"}"#).unwrap();

        assert_eq!(config.linger_timeout_ms, 500);
        assert_eq!(config.scan_window_ms, DEFAULT_SCAN_WINDOW);
        assert_eq!(config.service_uuid, make_headset_service_uuid());
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let config = Config { log_level: String::from("chatty"), ..Config::default() };
        assert_eq!(config.log_level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn linger_timeout_has_a_floor() {
        let config = Config { linger_timeout_ms: 0, ..Config::default() };
        assert_eq!(config.linger_timeout(), Duration::from_millis(MIN_LINGER_TIMEOUT));

        let config = Config { linger_timeout_ms: 1000, ..Config::default() };
        assert_eq!(config.linger_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"headingReplayCapacity\":0"));
        assert!(json.contains("\"headingCharacteristicUuid\""));
    }
}
