use crate::hal::SensorSource;
use crate::protocol::REGISTER_COUNT;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

pub const CELL_COUNT: usize = 4;
pub const TEMPERATURE_SENSOR_COUNT: usize = 2;
/// Value stored for a channel that could not be read.
pub const SENSOR_ERROR: i16 = -999;
pub const ADC_FULL_SCALE: u16 = 4095;

const T0_KELVIN: f64 = 298.15;
const ZERO_CELSIUS_KELVIN: f64 = 273.15;

/// Logical ADC channel selector. Multiplexing onto physical inputs is
/// the business of the [`SensorSource`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub enum Channel {
    Cell(u8),
    Current,
    Temperature(u8),
}

impl Channel {
    /// Acquisition order, identical to the register order.
    pub const ALL: [Channel; REGISTER_COUNT] = [
        Channel::Cell(0),
        Channel::Cell(1),
        Channel::Cell(2),
        Channel::Cell(3),
        Channel::Current,
        Channel::Temperature(0),
        Channel::Temperature(1),
    ];
}

/// Analog front end parameters used to turn raw 12-bit counts into
/// millivolts, milliamps and degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "protocol_serde", serde(default))]
pub struct Conversion {
    pub reference_millivolts: u32,
    /// Ratio of the resistive divider in front of each cell input, 1 when
    /// the cell is wired straight to the ADC.
    pub cell_divider: u32,
    pub shunt_milliohms: u32,
    pub thermistor_beta: f64,
    pub thermistor_r25_ohms: f64,
    pub series_resistor_ohms: f64,
}

impl Default for Conversion {
    fn default() -> Self {
        Self {
            reference_millivolts: 3300,
            cell_divider: 1,
            shunt_milliohms: 1,
            thermistor_beta: 3435.0,
            thermistor_r25_ohms: 100_000.0,
            series_resistor_ohms: 10_000.0,
        }
    }
}

impl Conversion {
    pub fn millivolts(&self, raw: u16) -> i16 {
        let mv = u32::from(raw.min(ADC_FULL_SCALE)) * self.reference_millivolts
            / u32::from(ADC_FULL_SCALE);
        i16::try_from(mv).unwrap_or(i16::MAX)
    }

    pub fn cell_millivolts(&self, raw: u16) -> i16 {
        let mv = i64::from(self.millivolts(raw)) * i64::from(self.cell_divider.max(1));
        i16::try_from(mv).unwrap_or(i16::MAX)
    }

    /// Shunt voltage to current, saturated to the register range.
    pub fn milliamps(&self, raw: u16) -> i16 {
        let mv = i64::from(self.millivolts(raw));
        let ma = mv * 1000 / i64::from(self.shunt_milliohms.max(1));
        ma.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
    }

    /// NTC divider reading to degrees Celsius using the Beta equation
    /// `1/T = 1/T0 + (1/B) * ln(R/R25)`, truncated toward zero.
    /// Both rails (open or shorted sensor) read as [`SENSOR_ERROR`].
    pub fn celsius(&self, raw: u16) -> i16 {
        if raw == 0 || raw >= ADC_FULL_SCALE {
            return SENSOR_ERROR;
        }
        let vref = f64::from(self.reference_millivolts) / 1000.0;
        let v_out = f64::from(raw) * vref / f64::from(ADC_FULL_SCALE);
        let r_th = self.series_resistor_ohms * v_out / (vref - v_out);
        let temp_k = 1.0
            / ((1.0 / T0_KELVIN) + (1.0 / self.thermistor_beta) * (r_th / self.thermistor_r25_ohms).ln());
        (temp_k - ZERO_CELSIUS_KELVIN) as i16
    }
}

/// Snapshot of all measured battery quantities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct SampleSet {
    /// mV
    pub cell_voltages: [i16; CELL_COUNT],
    /// mA, positive while discharging
    pub current: i16,
    /// °C or [`SENSOR_ERROR`]
    pub temperatures: [i16; TEMPERATURE_SENSOR_COUNT],
}

impl SampleSet {
    /// Samples every channel once and replaces the stored values.
    /// Channels reporting no data are stored as [`SENSOR_ERROR`].
    pub fn refresh<S: SensorSource + ?Sized>(&mut self, source: &mut S, conversion: &Conversion) {
        for channel in Channel::ALL {
            let raw = source.read_channel(channel);
            if raw.is_none() {
                log::warn!("{}", crate::Error::SensorRead { channel });
            }
            match channel {
                Channel::Cell(n) => {
                    self.cell_voltages[usize::from(n)] =
                        raw.map_or(SENSOR_ERROR, |raw| conversion.cell_millivolts(raw))
                }
                Channel::Current => {
                    self.current = raw.map_or(SENSOR_ERROR, |raw| conversion.milliamps(raw))
                }
                Channel::Temperature(n) => {
                    self.temperatures[usize::from(n)] =
                        raw.map_or(SENSOR_ERROR, |raw| conversion.celsius(raw))
                }
            }
        }
        log::trace!("samples: {self:?}");
    }

    pub fn has_sensor_error(&self) -> bool {
        self.to_registers().contains(&SENSOR_ERROR)
    }

    /// Register order: cell0..cell3, current, temp0, temp1.
    pub fn to_registers(&self) -> [i16; REGISTER_COUNT] {
        let [c0, c1, c2, c3] = self.cell_voltages;
        let [t0, t1] = self.temperatures;
        [c0, c1, c2, c3, self.current, t0, t1]
    }

    pub fn from_registers(registers: &[i16; REGISTER_COUNT]) -> Self {
        Self {
            cell_voltages: [registers[0], registers[1], registers[2], registers[3]],
            current: registers[4],
            temperatures: [registers[5], registers[6]],
        }
    }
}
