use anyhow::{Context, Result};
use rtubms_lib::protection::Thresholds;
use rtubms_lib::sample::Conversion;
use rtubms_lib::slave::{CrcErrorPolicy, SlaveConfig};
use serde::Deserialize;
use std::time::Duration;

/// Slave configuration as read from the YAML file. Missing keys fall back
/// to the library defaults.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    slave_address: u8,
    thresholds: Thresholds,
    conversion: Conversion,
    #[serde(with = "humantime_serde")]
    poll_interval: Duration,
    /// `null` waits forever for the rest of a frame
    #[serde(with = "humantime_serde")]
    byte_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    settle_time: Duration,
    #[serde(with = "humantime_serde")]
    transmit_timeout: Duration,
    crc_error_policy: CrcErrorPolicy,
    sensor_error_is_fault: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let SlaveConfig {
            slave_address,
            thresholds,
            conversion,
            poll_interval,
            byte_timeout,
            settle_time,
            transmit_timeout,
            crc_error_policy,
            sensor_error_is_fault,
        } = SlaveConfig::default();
        Self {
            slave_address,
            thresholds,
            conversion,
            poll_interval,
            byte_timeout,
            settle_time,
            transmit_timeout,
            crc_error_policy,
            sensor_error_is_fault,
        }
    }
}

impl Settings {
    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let settings: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(settings)
    }

    pub fn into_slave_config(self) -> SlaveConfig {
        SlaveConfig {
            slave_address: self.slave_address,
            thresholds: self.thresholds,
            conversion: self.conversion,
            poll_interval: self.poll_interval,
            byte_timeout: self.byte_timeout,
            settle_time: self.settle_time,
            transmit_timeout: self.transmit_timeout,
            crc_error_policy: self.crc_error_policy,
            sensor_error_is_fault: self.sensor_error_is_fault,
        }
    }
}
