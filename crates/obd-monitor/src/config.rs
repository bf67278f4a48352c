//! Monitor configuration

use obd_protocol::config::load_with_prefix;
use obd_protocol::pid::codes;
use obd_protocol::{ObdError, SessionConfig};
use obd_scheduler::PollerConfig;
use serde::{Deserialize, Serialize};

/// Settings for one monitor run, read from an optional file plus
/// `OBD_MONITOR_*` environment variables (`OBD_MONITOR_SESSION__COMMAND_TIMEOUT_MS`
/// for nested keys)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Serial device of the adapter (default: /dev/ttyUSB0)
    pub device: String,
    /// Serial baud rate; the protocol's usual rate when unset
    pub baud_rate: Option<u32>,
    /// PID codes to poll (default: RPM, speed, coolant temperature)
    pub pids: Vec<String>,
    /// Log level for stderr output (default: info)
    pub log_level: String,
    /// Talk to the built-in simulated adapter instead of a device
    pub mock: bool,
    pub poller: PollerConfig,
    pub session: SessionConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: None,
            pids: vec![
                codes::RPM.to_string(),
                codes::SPEED.to_string(),
                codes::COOLANT_TEMP.to_string(),
            ],
            log_level: "info".to_string(),
            mock: false,
            poller: PollerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: Option<&str>) -> Result<Self, ObdError> {
        load_with_prefix(path, "OBD_MONITOR")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::ObdProtocol;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.pids, vec!["0C", "0D", "05"]);
        assert_eq!(config.poller.target_interval_ms, 200);
        assert!(!config.mock);
    }

    #[test]
    fn test_load_nested_sections() {
        let dir = std::env::temp_dir().join(format!("obd-monitor-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("monitor.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "device = \"/dev/rfcomm0\"").unwrap();
        writeln!(file, "pids = [\"0C\", \"11\"]").unwrap();
        writeln!(file, "mock = true").unwrap();
        writeln!(file, "[poller]").unwrap();
        writeln!(file, "target_interval_ms = 100").unwrap();
        writeln!(file, "[session]").unwrap();
        writeln!(file, "protocol = \"iso9141_2\"").unwrap();

        let config = MonitorConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.device, "/dev/rfcomm0");
        assert_eq!(config.pids, vec!["0C", "11"]);
        assert!(config.mock);
        assert_eq!(config.poller.target_interval_ms, 100);
        assert_eq!(config.poller.response_timeout_ms, 2000);
        assert_eq!(config.session.protocol, ObdProtocol::Iso9141_2);
        assert_eq!(config.log_level, "info");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
