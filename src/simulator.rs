//! Simulated battery pack feeding the slave when it runs on a host.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtubms_lib::hal::SensorSource;
use rtubms_lib::sample::{Channel, Conversion, ADC_FULL_SCALE, CELL_COUNT, TEMPERATURE_SENSOR_COUNT};
use std::time::{Duration, Instant};

const NOMINAL_CELL_MILLIVOLTS: f64 = 3400.0;
const NOMINAL_MILLIAMPS: f64 = 2000.0;
const NOMINAL_CELSIUS: f64 = 25.0;
/// Chance per update to start an injected fault.
const FAULT_PROBABILITY: f64 = 1.0 / 600.0;
const FAULT_DURATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
enum Injected {
    CellOvervoltage(usize),
    Overcurrent,
    Overtemperature(usize),
    Undertemperature(usize),
}

#[derive(Debug)]
pub struct SimulatedPack {
    rng: StdRng,
    conversion: Conversion,
    cell_millivolts: [f64; CELL_COUNT],
    milliamps: f64,
    celsius: [f64; TEMPERATURE_SENSOR_COUNT],
    fault: Option<(Injected, Instant)>,
}

impl SimulatedPack {
    /// Cells sit above the ADC reference, without a `cell_divider` in
    /// `conversion` they read as the reference voltage.
    pub fn new(conversion: Conversion, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            conversion,
            cell_millivolts: [NOMINAL_CELL_MILLIVOLTS; CELL_COUNT],
            milliamps: NOMINAL_MILLIAMPS,
            celsius: [NOMINAL_CELSIUS; TEMPERATURE_SENSOR_COUNT],
            fault: None,
        }
    }

    /// Random walk around the nominal operating point.
    fn update(&mut self) {
        for mv in self.cell_millivolts.iter_mut() {
            *mv = (*mv + self.rng.gen_range(-5.0..=5.0)).clamp(3300.0, 3500.0);
        }
        self.milliamps = (self.milliamps + self.rng.gen_range(-100.0..=100.0)).clamp(0.0, 5000.0);
        for celsius in self.celsius.iter_mut() {
            *celsius = (*celsius + self.rng.gen_range(-0.2..=0.2)).clamp(15.0, 35.0);
        }

        match self.fault {
            Some((fault, since)) if since.elapsed() >= FAULT_DURATION => {
                log::info!("Simulated {fault:?} over");
                self.fault = None;
            }
            Some(_) => {}
            None if self.rng.gen_bool(FAULT_PROBABILITY) => {
                let fault = match self.rng.gen_range(0..4) {
                    0 => Injected::CellOvervoltage(self.rng.gen_range(0..CELL_COUNT)),
                    1 => Injected::Overcurrent,
                    2 => Injected::Overtemperature(self.rng.gen_range(0..TEMPERATURE_SENSOR_COUNT)),
                    _ => Injected::Undertemperature(self.rng.gen_range(0..TEMPERATURE_SENSOR_COUNT)),
                };
                log::info!("Simulating {fault:?}");
                self.fault = Some((fault, Instant::now()));
            }
            None => {}
        }
    }

    fn cell_millivolts(&self, cell: usize) -> f64 {
        match self.fault {
            Some((Injected::CellOvervoltage(n), _)) if n == cell => 3700.0,
            _ => self.cell_millivolts[cell],
        }
    }

    fn milliamps(&self) -> f64 {
        match self.fault {
            Some((Injected::Overcurrent, _)) => 12_000.0,
            _ => self.milliamps,
        }
    }

    fn celsius(&self, sensor: usize) -> f64 {
        match self.fault {
            Some((Injected::Overtemperature(n), _)) if n == sensor => 45.0,
            Some((Injected::Undertemperature(n), _)) if n == sensor => -25.0,
            _ => self.celsius[sensor],
        }
    }

    fn millivolts_to_raw(&self, millivolts: f64) -> u16 {
        let raw = millivolts * f64::from(ADC_FULL_SCALE) / f64::from(self.conversion.reference_millivolts);
        raw.round().clamp(0.0, f64::from(ADC_FULL_SCALE)) as u16
    }

    /// Inverse of the Beta equation followed by the divider.
    fn celsius_to_raw(&self, celsius: f64) -> u16 {
        let t = celsius + 273.15;
        let t0 = 298.15;
        let r_th = self.conversion.thermistor_r25_ohms
            * (self.conversion.thermistor_beta * (1.0 / t - 1.0 / t0)).exp();
        let raw = f64::from(ADC_FULL_SCALE) * r_th / (r_th + self.conversion.series_resistor_ohms);
        // the rails are reserved for open and shorted sensors
        raw.round().clamp(1.0, f64::from(ADC_FULL_SCALE - 1)) as u16
    }
}

impl SensorSource for SimulatedPack {
    fn read_channel(&mut self, channel: Channel) -> Option<u16> {
        let raw = match channel {
            Channel::Cell(n) => {
                // one step per acquisition round
                if n == 0 {
                    self.update();
                }
                let divider = f64::from(self.conversion.cell_divider.max(1));
                self.millivolts_to_raw(self.cell_millivolts(usize::from(n)) / divider)
            }
            Channel::Current => {
                let shunt_millivolts =
                    self.milliamps() * f64::from(self.conversion.shunt_milliohms) / 1000.0;
                self.millivolts_to_raw(shunt_millivolts)
            }
            Channel::Temperature(n) => self.celsius_to_raw(self.celsius(usize::from(n))),
        };
        Some(raw)
    }
}
