//! Blocking MODBUS master for polling a battery slave over a serial port.
//!
//! # Example
//!
//! ```no_run
//! use rtubms_lib::serialport::RtuMaster;
//!
//! let mut master = RtuMaster::new("/dev/ttyUSB0").unwrap();
//! let samples = master.get_samples(0x01).unwrap();
//! println!("Cells: {:?} mV", samples.cell_voltages);
//! ```

use crate::protocol::*;
use crate::sample::SampleSet;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct RtuMaster {
    serial: Box<dyn serialport::SerialPort>,
    last_execution: Instant,
    delay: Duration,
    retries: u8,
}

impl RtuMaster {
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: serialport::new(port, BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()?,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
            retries: 3,
        })
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self.serial.bytes_to_read()?;
            if pending > 0 {
                log::trace!("Got {} pending bytes", pending);
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self.serial.read(buf.as_mut_slice())?;
                log::trace!("Read {} pending bytes", received);
            } else {
                break;
            }
        }
        self.serial_await_delay();

        log::trace!("write bytes: {tx_buffer:02X?}");
        self.serial.write_all(tx_buffer)?;
        Ok(())
    }

    fn receive_bytes(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut rx_buffer = vec![0; size];

        let result = self.serial.read_exact(&mut rx_buffer);
        self.last_execution = Instant::now();
        result.map_err(|err| match err.kind() {
            std::io::ErrorKind::TimedOut => Error::Protocol(crate::Error::Timeout),
            _ => Error::Io(err),
        })?;

        log::trace!("receive_bytes: {:02X?}", rx_buffer);
        Ok(rx_buffer)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok(self.serial.set_timeout(timeout)?)
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    /// Number of additional attempts after a failed exchange.
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    fn exchange(&mut self, slave: u8) -> Result<Response> {
        let request = Request::read_input_registers(slave, 0, REGISTER_COUNT as u16);
        self.send_bytes(&request.encode())?;
        let reply = self.receive_bytes(Response::reply_size())?;
        Ok(Response::decode(&reply, slave)?)
    }

    /// Reads the full input register map of `slave`.
    pub fn read_input_registers(&mut self, slave: u8) -> Result<Response> {
        for t in 0..self.retries {
            match self.exchange(slave) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    log::trace!("Failed try {} of {}, repeating ({err})", t + 1, self.retries);
                }
            }
        }
        self.exchange(slave)
    }

    pub fn get_samples(&mut self, slave: u8) -> Result<SampleSet> {
        Ok(self.read_input_registers(slave)?.samples())
    }
}
