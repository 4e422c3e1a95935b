use anyhow::{Context, Result};
use log::{error, info, warn};
use rtubms_lib::protection::{self, Thresholds};
use rtubms_lib::serialport::RtuMaster;
use rtubms_lib::SampleSet;
use serde_json::json;

use crate::{commandline, mqtt};

fn to_json_value(samples: &SampleSet, thresholds: &Thresholds) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(samples)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "protection".to_string(),
            serde_json::to_value(protection::evaluate(samples, thresholds, true))?,
        );
    }
    Ok(value)
}

fn publish_simple_format(
    publisher: &mqtt::MqttPublisher,
    base_topic: &str,
    value: &serde_json::Value,
) {
    fn publish_recursive(publisher: &mqtt::MqttPublisher, topic: &str, val: &serde_json::Value) {
        let payload = match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    publish_recursive(publisher, &format!("{topic}/{k}"), v);
                }
                return;
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    publish_recursive(publisher, &format!("{topic}/{i}"), v);
                }
                return;
            }
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => return,
        };
        if let Err(e) = publisher.publish(topic, &payload) {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    }
    publish_recursive(publisher, base_topic, value);
}

fn publish(
    publisher: &mqtt::MqttPublisher,
    format: &commandline::MqttFormat,
    value: serde_json::Value,
) {
    match format {
        commandline::MqttFormat::Json => {
            let payload = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "samples": value,
            });
            match serde_json::to_string(&payload) {
                Ok(json_payload) => {
                    info!("MQTT output: Attempting to publish data: {json_payload}");
                    if let Err(e) = publisher.publish(publisher.topic(), &json_payload) {
                        error!("Failed to publish data to MQTT: {e:?}");
                    }
                }
                Err(e) => error!("Failed to serialize data to JSON string: {e}"),
            }
        }
        commandline::MqttFormat::Simple => {
            publish_simple_format(publisher, publisher.topic(), &value)
        }
    }
}

pub fn run(
    mut master: RtuMaster,
    slave: u8,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
) -> Result<()> {
    info!("Starting daemon mode: slave={slave:02X}, output={output:?}, interval={interval:?}");
    let thresholds = Thresholds::default();

    let mqtt_publisher = match &output {
        commandline::DaemonOutput::Mqtt { config_file, .. } => {
            let config = mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let publisher = mqtt::MqttPublisher::new(config)
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully.");
            Some(publisher)
        }
        commandline::DaemonOutput::Console => None,
    };

    loop {
        match master.get_samples(slave) {
            Ok(samples) => match &output {
                commandline::DaemonOutput::Console => {
                    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                    println!("Cell voltages: {:?} mV", samples.cell_voltages);
                    println!("Current: {} mA", samples.current);
                    println!("Temperatures: {:?} °C", samples.temperatures);
                    if let Some(cause) = protection::check(&samples, &thresholds, true) {
                        println!("Protection: Fault ({cause})");
                    } else {
                        println!("Protection: Normal");
                    }
                    println!("--------------------------");
                }
                commandline::DaemonOutput::Mqtt { format, .. } => {
                    match (&mqtt_publisher, to_json_value(&samples, &thresholds)) {
                        (Some(publisher), Ok(value)) => publish(publisher, format, value),
                        (Some(_), Err(e)) => error!("Failed to serialize samples: {e}"),
                        (None, _) => warn!(
                            "MQTT output selected, but publisher is not initialized. Skipping publish."
                        ),
                    }
                }
            },
            Err(e) => error!("Error reading slave {slave:02X}: {e}"),
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_value_carries_protection() {
        let samples = SampleSet {
            cell_voltages: [3400, 3700, 3395, 3405],
            current: 2000,
            temperatures: [25, 26],
        };
        let value = to_json_value(&samples, &Thresholds::default()).unwrap();
        assert_eq!(value["cell_voltages"][1], 3700);
        assert_eq!(value["current"], 2000);
        assert_eq!(value["protection"], "Fault");
    }
}
