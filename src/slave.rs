//! Main cycle of the slave: sample, decide, then serve a pending MODBUS frame.

use crate::hal::BmsHal;
use crate::protection::{self, ProtectionState, Thresholds};
use crate::protocol::{Request, Response, DEFAULT_SLAVE_ADDRESS, REQUEST_LENGTH};
use crate::receiver::{FrameReceiver, FrameState};
use crate::sample::{Conversion, SampleSet};
use crate::Error;
use std::time::Duration;

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

/// What to do with an address matched frame whose CRC does not check out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "protocol_serde", serde(rename_all = "kebab-case"))]
pub enum CrcErrorPolicy {
    /// Reset the receiver like any other invalid frame.
    Recover,
    /// Drop the frame and just listen again.
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlaveConfig {
    pub slave_address: u8,
    pub thresholds: Thresholds,
    pub conversion: Conversion,
    pub poll_interval: Duration,
    /// Upper bound for each synchronous byte read, `None` blocks forever.
    pub byte_timeout: Option<Duration>,
    /// Receiver off time of the recovery path.
    pub settle_time: Duration,
    pub transmit_timeout: Duration,
    pub crc_error_policy: CrcErrorPolicy,
    pub sensor_error_is_fault: bool,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            slave_address: DEFAULT_SLAVE_ADDRESS,
            thresholds: Thresholds::default(),
            conversion: Conversion::default(),
            poll_interval: Duration::from_millis(100),
            byte_timeout: Some(Duration::from_millis(50)),
            settle_time: Duration::from_millis(10),
            transmit_timeout: Duration::from_millis(100),
            crc_error_policy: CrcErrorPolicy::Recover,
            sensor_error_is_fault: true,
        }
    }
}

/// Result of one main cycle iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No frame was pending.
    Idle,
    Responded,
    /// Frame discarded, receiver left running.
    Dropped,
    /// Receiver reset through the recovery path.
    Recovered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlaveStats {
    pub cycles: u64,
    pub responses: u64,
    pub crc_errors: u64,
    pub unsupported_requests: u64,
    pub address_mismatches: u64,
    pub receive_errors: u64,
    pub transmit_errors: u64,
    pub fault_transitions: u64,
}

/// Explicit context of the slave, owned by the main loop. The only state
/// shared with the interrupt handler lives in the [`FrameReceiver`].
pub struct Slave<'r, H: BmsHal> {
    config: SlaveConfig,
    hal: H,
    receiver: &'r FrameReceiver,
    samples: SampleSet,
    protection: Option<ProtectionState>,
    stats: SlaveStats,
}

impl<'r, H: BmsHal> Slave<'r, H> {
    pub fn new(config: SlaveConfig, hal: H, receiver: &'r FrameReceiver) -> Self {
        if config.slave_address != receiver.slave_address() {
            log::warn!(
                "Receiver address {:02X} differs from configured {:02X}, using receiver",
                receiver.slave_address(),
                config.slave_address
            );
        }
        Self {
            config,
            hal,
            receiver,
            samples: SampleSet::default(),
            protection: None,
            stats: SlaveStats::default(),
        }
    }

    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    /// `None` until the first cycle ran.
    pub fn protection(&self) -> Option<ProtectionState> {
        self.protection
    }

    pub fn stats(&self) -> &SlaveStats {
        &self.stats
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// Puts the transceiver into receive mode and arms the receive interrupt.
    pub fn start(&mut self) {
        log::debug!(
            "Listening as slave {:02X}",
            self.receiver.slave_address()
        );
        self.hal.set_tx_enable(false);
        self.hal.set_receiver(true);
        self.hal.set_receive_interrupt(true);
    }

    /// Runs the cycle forever at the configured cadence.
    pub fn run(&mut self) -> ! {
        self.start();
        loop {
            self.poll_once();
            self.hal.sleep(self.config.poll_interval);
        }
    }

    /// One iteration: refresh samples, drive the protection outputs, then
    /// service whatever the interrupt handler signalled.
    pub fn poll_once(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;
        self.samples.refresh(&mut self.hal, &self.config.conversion);
        self.control_outputs();

        match self.receiver.state() {
            FrameState::Idle => CycleOutcome::Idle,
            FrameState::FramePending => self.service_frame(),
            FrameState::AddressMismatch => {
                self.stats.address_mismatches += 1;
                log::debug!("Frame for another slave, resetting receiver");
                self.recover();
                CycleOutcome::Recovered
            }
        }
    }

    fn control_outputs(&mut self) {
        let cause = protection::check(
            &self.samples,
            &self.config.thresholds,
            self.config.sensor_error_is_fault,
        );
        let state = match cause {
            Some(_) => ProtectionState::Fault,
            None => ProtectionState::Normal,
        };
        if self.protection != Some(state) {
            match cause {
                Some(cause) => log::warn!("Protection tripped: {cause}"),
                None => log::info!("Protection cleared, discharge path enabled"),
            }
            if self.protection.is_some() {
                self.stats.fault_transitions += 1;
            }
            self.protection = Some(state);
        }
        protection::apply(&mut self.hal, state);
    }

    fn read_frame(&mut self) -> Result<[u8; REQUEST_LENGTH], Error> {
        let mut frame = [0; REQUEST_LENGTH];
        // the address byte was consumed by the interrupt handler
        frame[0] = self.receiver.slave_address();
        for byte in frame.iter_mut().skip(1) {
            *byte = self.hal.read_byte(self.config.byte_timeout)?;
        }
        log::trace!("receive_frame: {frame:02X?}");
        Ok(frame)
    }

    fn service_frame(&mut self) -> CycleOutcome {
        let frame = match self.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.receive_errors += 1;
                log::warn!("Incomplete frame ({err}), resetting receiver");
                self.recover();
                return CycleOutcome::Recovered;
            }
        };

        match Request::decode(&frame).and_then(|request| request.validate()) {
            Ok(()) => {
                self.respond();
                self.listen();
                CycleOutcome::Responded
            }
            Err(Error::CrcMismatch { .. }) => {
                self.stats.crc_errors += 1;
                match self.config.crc_error_policy {
                    CrcErrorPolicy::Drop => {
                        self.listen();
                        CycleOutcome::Dropped
                    }
                    CrcErrorPolicy::Recover => {
                        self.recover();
                        CycleOutcome::Recovered
                    }
                }
            }
            Err(err) => {
                self.stats.unsupported_requests += 1;
                log::debug!("Rejected frame: {err}");
                self.recover();
                CycleOutcome::Recovered
            }
        }
    }

    /// Transmits the current samples. The driver stays enabled until the
    /// hardware reports the last byte clocked out.
    fn respond(&mut self) {
        let tx_buffer = Response::new(self.receiver.slave_address(), &self.samples).encode();
        log::trace!("write bytes: {tx_buffer:02X?}");

        self.hal.set_tx_enable(true);
        let result = tx_buffer
            .iter()
            .try_for_each(|&byte| self.hal.write_byte(byte))
            .and_then(|_| self.hal.wait_transmit_complete(self.config.transmit_timeout));
        self.hal.set_tx_enable(false);

        match result {
            Ok(()) => self.stats.responses += 1,
            Err(err) => {
                self.stats.transmit_errors += 1;
                log::error!("Cannot transmit response: {err}");
            }
        }
    }

    /// End of a serviced frame: back to idle, interrupt armed again.
    fn listen(&mut self) {
        self.receiver.clear();
        self.hal.set_receive_interrupt(true);
    }

    /// Flushes whatever is left on the line by cycling the receiver, then
    /// returns to listening.
    fn recover(&mut self) {
        self.hal.set_receiver(false);
        self.hal.sleep(self.config.settle_time);
        self.hal.set_receiver(true);
        self.listen();
    }
}
