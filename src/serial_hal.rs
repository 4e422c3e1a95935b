//! [`BmsHal`] for running the slave on a host with a USB to RS-485 adapter.
//!
//! A background thread plays the role of the byte received interrupt: while
//! the interrupt is armed it reads single bytes and hands them to the
//! [`FrameReceiver`]. Once the handler masked itself the thread stays away
//! from the port and the main cycle reads the rest of the frame.

use crate::hal::{BmsHal, OutputLine, SensorSource};
use crate::protocol::BAUD_RATE;
use crate::receiver::FrameReceiver;
use crate::sample::Channel;
use crate::Error;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const LISTEN_POLL: Duration = Duration::from_millis(2);
/// Read timeout standing in for "forever".
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(3600);

pub struct SerialHal<S: SensorSource> {
    serial: Box<dyn serialport::SerialPort>,
    sensors: S,
    receiver: Arc<FrameReceiver>,
    receiver_enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    rts_direction: bool,
    outputs: [bool; 2],
}

impl<S: SensorSource> SerialHal<S> {
    /// Opens `port` with 8N1 framing. With `rts_direction` the RTS line
    /// drives the transceiver's driver enable, otherwise the adapter is
    /// expected to switch direction on its own.
    pub fn open(
        port: &str,
        receiver: Arc<FrameReceiver>,
        sensors: S,
        rts_direction: bool,
    ) -> Result<Self, serialport::Error> {
        let serial = serialport::new(port, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(LISTEN_POLL)
            .open()?;
        let listen_port = serial.try_clone()?;

        let receiver_enabled = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let listener = std::thread::Builder::new()
            .name("rx-interrupt".into())
            .spawn({
                let receiver = receiver.clone();
                let receiver_enabled = receiver_enabled.clone();
                let stop = stop.clone();
                move || listen(listen_port, &receiver, &receiver_enabled, &stop)
            })?;

        Ok(Self {
            serial,
            sensors,
            receiver,
            receiver_enabled,
            stop,
            listener: Some(listener),
            rts_direction,
            outputs: [false; 2],
        })
    }

    /// Current level of the primary and fault lines.
    pub fn outputs(&self) -> (bool, bool) {
        (self.outputs[0], self.outputs[1])
    }

    pub fn sensors_mut(&mut self) -> &mut S {
        &mut self.sensors
    }
}

fn listen(
    mut port: Box<dyn serialport::SerialPort>,
    receiver: &FrameReceiver,
    receiver_enabled: &AtomicBool,
    stop: &AtomicBool,
) {
    let mut byte = [0u8; 1];
    while !stop.load(Ordering::Acquire) {
        if !(receiver.interrupt_enabled() && receiver_enabled.load(Ordering::Acquire)) {
            std::thread::sleep(LISTEN_POLL);
            continue;
        }
        match port.read(&mut byte) {
            Ok(1) => {
                if let Some(state) = receiver.on_byte_received(byte[0]) {
                    log::trace!("rx interrupt: byte={:02X} state={state:?}", byte[0]);
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                log::error!("Serial listener failed: {err}");
                std::thread::sleep(LISTEN_POLL);
            }
        }
    }
}

impl<S: SensorSource> Drop for SerialHal<S> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

impl<S: SensorSource> SensorSource for SerialHal<S> {
    fn read_channel(&mut self, channel: Channel) -> Option<u16> {
        self.sensors.read_channel(channel)
    }
}

impl<S: SensorSource> BmsHal for SerialHal<S> {
    fn set_output(&mut self, line: OutputLine, high: bool) {
        let index = match line {
            OutputLine::Primary => 0,
            OutputLine::Fault => 1,
        };
        if self.outputs[index] != high {
            log::debug!("Output {line:?} -> {}", if high { "high" } else { "low" });
            self.outputs[index] = high;
        }
    }

    fn set_receive_interrupt(&mut self, enable: bool) {
        self.receiver.set_interrupt_enabled(enable);
    }

    fn set_receiver(&mut self, enable: bool) {
        if enable {
            // anything that arrived while "off" is discarded
            if let Err(err) = self.serial.clear(serialport::ClearBuffer::Input) {
                log::warn!("Cannot clear input buffer: {err}");
            }
        }
        self.receiver_enabled.store(enable, Ordering::Release);
    }

    fn set_tx_enable(&mut self, enable: bool) {
        if self.rts_direction {
            if let Err(err) = self.serial.write_request_to_send(enable) {
                log::warn!("Cannot switch RTS: {err}");
            }
        }
    }

    fn read_byte(&mut self, timeout: Option<Duration>) -> Result<u8, Error> {
        self.serial
            .set_timeout(timeout.unwrap_or(BLOCKING_TIMEOUT))
            .map_err(|err| Error::Io(err.into()))?;
        let mut byte = [0u8; 1];
        loop {
            match self.serial.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    if timeout.is_some() {
                        return Err(Error::Timeout);
                    }
                }
                Err(err) => return Err(Error::Io(err)),
            }
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), Error> {
        Ok(self.serial.write_all(&[byte])?)
    }

    /// The OS driver offers no transmit-complete flag, flushing waits for
    /// the output queue to drain.
    fn wait_transmit_complete(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(self.serial.flush()?)
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
