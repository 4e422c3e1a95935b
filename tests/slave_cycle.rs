use rtubms_lib::hal::{BmsHal, OutputLine, SensorSource};
use rtubms_lib::protection::ProtectionState;
use rtubms_lib::protocol::{crc16, Request, Response, RESPONSE_LENGTH};
use rtubms_lib::sample::{Channel, Conversion, SENSOR_ERROR};
use rtubms_lib::slave::{CrcErrorPolicy, CycleOutcome};
use rtubms_lib::{Error, FrameReceiver, FrameState, Slave, SlaveConfig};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// --- Mock HAL: a simulated RS-485 bus plus ADC ---
#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Output(OutputLine, bool),
    TxEnable(bool),
    Receiver(bool),
    Interrupt(bool),
    Write(u8),
    TransmitComplete,
    Sleep(Duration),
}

struct MockHal {
    receiver: Arc<FrameReceiver>,
    raw: [Option<u16>; 7],
    rx_queue: VecDeque<u8>,
    receiver_on: bool,
    tx_enabled: bool,
    outputs: [bool; 2],
    events: Vec<Event>,
}

impl MockHal {
    fn new(receiver: Arc<FrameReceiver>) -> Self {
        Self {
            receiver,
            // cells 3400/3410/3395/3405 mV, 2000 mA, 25/26 °C with `conversion()`
            raw: [
                Some(3400),
                Some(3410),
                Some(3395),
                Some(3405),
                Some(2),
                Some(3722),
                Some(3709),
            ],
            rx_queue: VecDeque::new(),
            receiver_on: false,
            tx_enabled: false,
            outputs: [false; 2],
            events: Vec::new(),
        }
    }

    /// Puts `frame` on the wire. The first byte that finds the interrupt
    /// armed goes to the handler, everything else lands in the receive queue.
    fn deliver(&mut self, frame: &[u8]) {
        if !self.receiver_on {
            return;
        }
        for &byte in frame {
            if self.receiver.on_byte_received(byte).is_none() {
                self.rx_queue.push_back(byte);
            }
        }
    }

    fn written(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Write(byte) => Some(*byte),
                _ => None,
            })
            .collect()
    }

    fn position(&self, wanted: Event) -> Option<usize> {
        self.events.iter().position(|event| *event == wanted)
    }

    fn receiver_was_cycled(&self) -> bool {
        self.position(Event::Receiver(false)).is_some()
    }
}

impl SensorSource for MockHal {
    fn read_channel(&mut self, channel: Channel) -> Option<u16> {
        let index = Channel::ALL.iter().position(|c| *c == channel).unwrap();
        self.raw[index]
    }
}

impl BmsHal for MockHal {
    fn set_output(&mut self, line: OutputLine, high: bool) {
        let index = match line {
            OutputLine::Primary => 0,
            OutputLine::Fault => 1,
        };
        self.outputs[index] = high;
        assert!(
            !(self.outputs[0] && self.outputs[1]),
            "both output lines enabled"
        );
        self.events.push(Event::Output(line, high));
    }

    fn set_receive_interrupt(&mut self, enable: bool) {
        self.receiver.set_interrupt_enabled(enable);
        self.events.push(Event::Interrupt(enable));
    }

    fn set_receiver(&mut self, enable: bool) {
        if !enable {
            self.rx_queue.clear();
        }
        self.receiver_on = enable;
        self.events.push(Event::Receiver(enable));
    }

    fn set_tx_enable(&mut self, enable: bool) {
        self.tx_enabled = enable;
        self.events.push(Event::TxEnable(enable));
    }

    fn read_byte(&mut self, _timeout: Option<Duration>) -> Result<u8, Error> {
        self.rx_queue.pop_front().ok_or(Error::Timeout)
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), Error> {
        assert!(self.tx_enabled, "byte written with the driver disabled");
        self.events.push(Event::Write(byte));
        Ok(())
    }

    fn wait_transmit_complete(&mut self, _timeout: Duration) -> Result<(), Error> {
        self.events.push(Event::TransmitComplete);
        Ok(())
    }

    fn sleep(&mut self, duration: Duration) {
        self.events.push(Event::Sleep(duration));
    }
}

/// Conversion where one count is one millivolt.
fn conversion() -> Conversion {
    Conversion {
        reference_millivolts: 4095,
        ..Conversion::default()
    }
}

fn config() -> SlaveConfig {
    SlaveConfig {
        conversion: conversion(),
        ..SlaveConfig::default()
    }
}

fn started(config: SlaveConfig, receiver: &Arc<FrameReceiver>) -> Slave<'_, MockHal> {
    let mut slave = Slave::new(config, MockHal::new(receiver.clone()), receiver);
    slave.start();
    slave.hal_mut().events.clear();
    slave
}

fn request(address: u8, start: u16, quantity: u16) -> [u8; 8] {
    Request::read_input_registers(address, start, quantity).encode()
}

#[test]
fn valid_request_gets_full_register_map() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);

    slave.hal_mut().deliver(&request(0x01, 0, 7));
    assert_eq!(receiver.state(), FrameState::FramePending);
    assert!(!receiver.interrupt_enabled());

    assert_eq!(slave.poll_once(), CycleOutcome::Responded);
    assert_eq!(
        slave.hal().written(),
        vec![
            0x01, 0x04, 0x0E, 0x0D, 0x48, 0x0D, 0x52, 0x0D, 0x43, 0x0D, 0x4D, 0x07, 0xD0, 0x00,
            0x19, 0x00, 0x1A, 0xDF, 0x35
        ]
    );
    assert_eq!(receiver.state(), FrameState::Idle);
    assert!(receiver.interrupt_enabled());
    assert!(!slave.hal().receiver_was_cycled());
    assert_eq!(slave.stats().responses, 1);
}

#[test]
fn response_decodes_to_current_samples() {
    let receiver = Arc::new(FrameReceiver::new(0x11));
    let mut slave = started(
        SlaveConfig {
            slave_address: 0x11,
            ..config()
        },
        &receiver,
    );
    slave.hal_mut().raw[1] = Some(3700);
    slave.hal_mut().raw[6] = None;

    slave.hal_mut().deliver(&request(0x11, 0, 7));
    assert_eq!(slave.poll_once(), CycleOutcome::Responded);

    let written = slave.hal().written();
    assert_eq!(written.len(), RESPONSE_LENGTH);
    assert_eq!(written[2], 14);
    let crc = crc16(&written[..RESPONSE_LENGTH - 2]);
    assert_eq!(written[RESPONSE_LENGTH - 2..], crc.to_le_bytes());

    let samples = Response::decode(&written, 0x11).unwrap().samples();
    assert_eq!(samples, *slave.samples());
    assert_eq!(samples.cell_voltages[1], 3700);
    assert_eq!(samples.temperatures[1], SENSOR_ERROR);
}

#[test]
fn driver_enabled_only_around_transmission() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    slave.hal_mut().deliver(&request(0x01, 0, 7));
    slave.poll_once();

    let hal = slave.hal();
    let enable = hal.position(Event::TxEnable(true)).unwrap();
    let first_write = hal.events.iter().position(|e| matches!(e, Event::Write(_))).unwrap();
    let last_write = hal.events.iter().rposition(|e| matches!(e, Event::Write(_))).unwrap();
    let complete = hal.position(Event::TransmitComplete).unwrap();
    let disable = hal.position(Event::TxEnable(false)).unwrap();
    assert!(enable < first_write);
    assert!(last_write < complete);
    assert!(complete < disable);
    assert!(!hal.tx_enabled);
}

#[test]
fn short_quantity_still_served_in_full() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    slave.hal_mut().deliver(&request(0x01, 3, 2));
    assert_eq!(slave.poll_once(), CycleOutcome::Responded);
    assert_eq!(slave.hal().written().len(), RESPONSE_LENGTH);
}

#[test]
fn too_many_registers_is_not_answered() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    slave.hal_mut().deliver(&request(0x01, 0, 8));

    assert_eq!(slave.poll_once(), CycleOutcome::Recovered);
    assert!(slave.hal().written().is_empty());
    assert!(slave.hal().receiver_was_cycled());
    assert!(slave
        .hal()
        .events
        .contains(&Event::Sleep(Duration::from_millis(10))));
    assert_eq!(receiver.state(), FrameState::Idle);
    assert!(receiver.interrupt_enabled());
    assert_eq!(slave.stats().unsupported_requests, 1);
}

#[test]
fn other_function_is_not_answered() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    let frame = Request {
        function: 0x03,
        ..Request::read_input_registers(0x01, 0, 7)
    }
    .encode();
    slave.hal_mut().deliver(&frame);

    assert_eq!(slave.poll_once(), CycleOutcome::Recovered);
    assert!(slave.hal().written().is_empty());
    assert!(slave.hal().receiver_was_cycled());
}

#[test]
fn foreign_frame_is_flushed() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    slave.hal_mut().deliver(&request(0x02, 0, 7));
    assert_eq!(receiver.state(), FrameState::AddressMismatch);

    assert_eq!(slave.poll_once(), CycleOutcome::Recovered);
    assert!(slave.hal().written().is_empty());
    assert!(slave.hal().rx_queue.is_empty());
    assert_eq!(receiver.state(), FrameState::Idle);
    assert_eq!(slave.stats().address_mismatches, 1);

    // the next frame for us is served normally
    slave.hal_mut().deliver(&request(0x01, 0, 7));
    assert_eq!(slave.poll_once(), CycleOutcome::Responded);
}

#[test]
fn crc_error_dropped_without_reset() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(
        SlaveConfig {
            crc_error_policy: CrcErrorPolicy::Drop,
            ..config()
        },
        &receiver,
    );
    let mut frame = request(0x01, 0, 7);
    frame[7] ^= 0xFF;
    slave.hal_mut().deliver(&frame);

    assert_eq!(slave.poll_once(), CycleOutcome::Dropped);
    assert!(slave.hal().written().is_empty());
    assert!(!slave.hal().receiver_was_cycled());
    assert_eq!(receiver.state(), FrameState::Idle);
    assert!(receiver.interrupt_enabled());
    assert_eq!(slave.stats().crc_errors, 1);
}

#[test]
fn crc_error_recovers_by_default() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    let mut frame = request(0x01, 0, 7);
    frame[3] = 0x01;
    slave.hal_mut().deliver(&frame);

    assert_eq!(slave.poll_once(), CycleOutcome::Recovered);
    assert!(slave.hal().written().is_empty());
    assert!(slave.hal().receiver_was_cycled());
    assert_eq!(slave.stats().crc_errors, 1);
}

#[test]
fn truncated_frame_times_out() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    slave.hal_mut().deliver(&request(0x01, 0, 7)[..4]);

    assert_eq!(slave.poll_once(), CycleOutcome::Recovered);
    assert!(slave.hal().written().is_empty());
    assert_eq!(receiver.state(), FrameState::Idle);
    assert_eq!(slave.stats().receive_errors, 1);
}

#[test]
fn idle_cycle_only_samples() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);

    assert_eq!(slave.poll_once(), CycleOutcome::Idle);
    assert!(slave.hal().written().is_empty());
    assert_eq!(slave.samples().cell_voltages, [3400, 3410, 3395, 3405]);
    assert_eq!(slave.samples().current, 2000);
    assert_eq!(slave.samples().temperatures, [25, 26]);
    assert_eq!(slave.protection(), Some(ProtectionState::Normal));
    assert_eq!(slave.hal().outputs, [true, false]);
}

#[test]
fn protection_follows_latest_samples() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    slave.poll_once();

    // 12 A discharge
    slave.hal_mut().raw[4] = Some(12);
    slave.hal_mut().events.clear();
    slave.poll_once();
    assert_eq!(slave.protection(), Some(ProtectionState::Fault));
    assert_eq!(slave.hal().outputs, [false, true]);
    let release = slave
        .hal()
        .position(Event::Output(OutputLine::Primary, false))
        .unwrap();
    let engage = slave
        .hal()
        .position(Event::Output(OutputLine::Fault, true))
        .unwrap();
    assert!(release < engage);

    // no latching
    slave.hal_mut().raw[4] = Some(2);
    slave.poll_once();
    assert_eq!(slave.protection(), Some(ProtectionState::Normal));
    assert_eq!(slave.hal().outputs, [true, false]);
    assert_eq!(slave.stats().fault_transitions, 2);
}

#[test]
fn sensor_error_policy() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(config(), &receiver);
    slave.hal_mut().raw[0] = None;
    slave.poll_once();
    assert_eq!(slave.samples().cell_voltages[0], SENSOR_ERROR);
    assert_eq!(slave.protection(), Some(ProtectionState::Fault));

    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = started(
        SlaveConfig {
            sensor_error_is_fault: false,
            ..config()
        },
        &receiver,
    );
    slave.hal_mut().raw[0] = None;
    slave.poll_once();
    assert_eq!(slave.protection(), Some(ProtectionState::Normal));
}

#[test]
fn start_arms_receiver() {
    let receiver = Arc::new(FrameReceiver::new(0x01));
    let mut slave = Slave::new(config(), MockHal::new(receiver.clone()), &receiver);
    assert!(!receiver.interrupt_enabled());
    slave.start();
    assert!(receiver.interrupt_enabled());
    assert!(slave.hal().receiver_on);
    assert!(!slave.hal().tx_enabled);
    assert_eq!(
        slave.hal().events,
        vec![
            Event::TxEnable(false),
            Event::Receiver(true),
            Event::Interrupt(true)
        ]
    );
}
