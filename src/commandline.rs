use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the battery monitor slave on the serial port, fed by a simulated battery pack
    Serve {
        /// YAML configuration file for the slave (thresholds, timing, conversion)
        #[arg(long)]
        config: Option<String>,
        /// Slave address to answer to (e.g., 1 or 0x01), overrides the configuration file
        #[arg(long, short, value_parser = maybe_hex::<u8>)]
        address: Option<u8>,
        /// Cycle interval (e.g., "100ms"), overrides the configuration file
        #[arg(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
        /// Drive the transceiver's driver enable with the RTS line
        #[arg(long, action)]
        rts_direction: bool,
        /// Seed for the simulated battery pack
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Read all input registers of a slave once and show the decoded samples
    Read {
        /// Address of the slave to query (e.g., 1 or 0x01)
        #[arg(long, short, value_parser = maybe_hex::<u8>, default_value = "1")]
        address: u8,
    },
    /// Run in daemon mode, periodically polling a slave and outputting the samples
    Daemon {
        /// Output destination for samples
        #[command(subcommand)]
        output: DaemonOutput,
        /// Address of the slave to query (e.g., 1 or 0x01)
        #[arg(long, short, value_parser = maybe_hex::<u8>, default_value = "1")]
        address: u8,
        /// Interval between two polls (e.g., "2s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "2s")]
        interval: Duration,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read samples and print them to the standard output (console).
    Console,
    /// Continuously read samples and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "MODBUS RTU battery monitor slave and poller"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations when polling a slave (e.g., "100ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "500ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between two requests when polling a slave (e.g., "50ms", "100ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "15ms")]
    pub delay: Duration,

    /// Number of retries for failed requests
    #[arg(long, default_value = "3")]
    pub retries: u8,
}
