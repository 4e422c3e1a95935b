//! Threshold based discharge protection.
//!
//! The decision is recomputed from the latest [`SampleSet`] every cycle,
//! nothing is latched between cycles.

use crate::hal::{BmsHal, OutputLine};
use crate::sample::SampleSet;
use std::fmt;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "protocol_serde", serde(default))]
pub struct Thresholds {
    pub max_cell_millivolts: i16,
    pub max_discharge_milliamps: i16,
    pub min_celsius: i16,
    pub max_celsius: i16,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_cell_millivolts: 3650,
            max_discharge_milliamps: 10_000,
            min_celsius: -20,
            max_celsius: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum ProtectionState {
    Normal,
    Fault,
}

impl ProtectionState {
    pub fn is_fault(&self) -> bool {
        *self == ProtectionState::Fault
    }
}

/// First violated limit found, in register order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    SensorError,
    CellOvervoltage { cell: usize, millivolts: i16 },
    Overcurrent { milliamps: i16 },
    Temperature { sensor: usize, celsius: i16 },
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultCause::SensorError => write!(f, "Sensor read error"),
            FaultCause::CellOvervoltage { cell, millivolts } => {
                write!(f, "Cell #{cell} over voltage ({millivolts}mV)")
            }
            FaultCause::Overcurrent { milliamps } => {
                write!(f, "Discharge over current ({milliamps}mA)")
            }
            FaultCause::Temperature { sensor, celsius } => {
                write!(f, "Temperature sensor #{sensor} out of range ({celsius}°C)")
            }
        }
    }
}

/// Returns the reason to trip, if any. Limits are exclusive: a value exactly
/// at a threshold is still acceptable.
pub fn check(
    samples: &SampleSet,
    thresholds: &Thresholds,
    sensor_error_is_fault: bool,
) -> Option<FaultCause> {
    if sensor_error_is_fault && samples.has_sensor_error() {
        return Some(FaultCause::SensorError);
    }
    if let Some((cell, &millivolts)) = samples
        .cell_voltages
        .iter()
        .enumerate()
        .find(|&(_, &mv)| mv > thresholds.max_cell_millivolts)
    {
        return Some(FaultCause::CellOvervoltage { cell, millivolts });
    }
    if samples.current > thresholds.max_discharge_milliamps {
        return Some(FaultCause::Overcurrent {
            milliamps: samples.current,
        });
    }
    samples
        .temperatures
        .iter()
        .enumerate()
        .find(|&(_, &c)| c < thresholds.min_celsius || c > thresholds.max_celsius)
        .map(|(sensor, &celsius)| FaultCause::Temperature { sensor, celsius })
}

pub fn evaluate(
    samples: &SampleSet,
    thresholds: &Thresholds,
    sensor_error_is_fault: bool,
) -> ProtectionState {
    match check(samples, thresholds, sensor_error_is_fault) {
        Some(_) => ProtectionState::Fault,
        None => ProtectionState::Normal,
    }
}

/// Drives the complementary outputs. The line being released is switched
/// first so both paths are never enabled together.
pub fn apply<H: BmsHal + ?Sized>(hal: &mut H, state: ProtectionState) {
    match state {
        ProtectionState::Normal => {
            hal.set_output(OutputLine::Fault, false);
            hal.set_output(OutputLine::Primary, true);
        }
        ProtectionState::Fault => {
            hal.set_output(OutputLine::Primary, false);
            hal.set_output(OutputLine::Fault, true);
        }
    }
}
