//! Provides an asynchronous MODBUS master for polling a battery slave
//! using Tokio and the `tokio-serial` crate for serial communication.
//!
//! # Example
//!
//! ```ignore
//! use rtubms_lib::tokio_serial_async::{RtuMaster, Error};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut master = RtuMaster::new("/dev/ttyUSB0")?;
//!     master.set_timeout(Duration::from_millis(500))?;
//!
//!     let samples = master.get_samples(0x01).await?;
//!     println!("Samples: {:?}", samples);
//!     Ok(())
//! }
//! ```

use crate::protocol::*;
use crate::sample::SampleSet;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// Errors specific to the asynchronous Tokio serial port client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error originating from frame encoding or decoding.
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::Error),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
    /// An error indicating that a Tokio timeout elapsed during an I/O operation.
    #[error("Tokio timeout elapsed: {0}")]
    TokioElapsed(#[from] tokio::time::error::Elapsed),
}

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

/// Asynchronous counterpart of [`crate::serialport::RtuMaster`].
#[derive(Debug)]
pub struct RtuMaster {
    serial: tokio_serial::SerialStream,
    last_execution: Instant,
    io_timeout: Duration, // Timeout for individual I/O operations
    delay: Duration,      // Delay between requests
    retries: u8,
}

impl RtuMaster {
    /// Opens `port` at 9600 baud, 8N1.
    ///
    /// The stream is registered with the current Tokio reactor, so this must
    /// be called from within a runtime.
    pub fn new(port: &str) -> Result<Self> {
        Ok(Self {
            serial: tokio_serial::new(port, BAUD_RATE)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
            io_timeout: Duration::from_secs(5),
            retries: 3,
        })
    }

    /// sets the number of retries for a failed exchange
    pub fn set_retry(&mut self, n_retries: u8) {
        self.retries = n_retries;
    }

    async fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            tokio::time::sleep(time_until_delay_reached).await;
        }
    }

    async fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // A reply to a previous, timed out request must not be taken as the
        // reply to this one.
        loop {
            let pending = self.serial.bytes_to_read()?;
            log::trace!("got {pending} pending bytes");
            if pending > 0 {
                let mut buf: Vec<u8> = vec![0; 64];
                let received =
                    tokio::time::timeout(self.io_timeout, self.serial.read(buf.as_mut_slice()))
                        .await??;
                log::trace!("{received} pending bytes consumed");
            } else {
                break;
            }
        }
        self.serial_await_delay().await;

        log::trace!("write bytes: {tx_buffer:02X?}");
        tokio::time::timeout(self.io_timeout, self.serial.write_all(tx_buffer)).await??;
        Ok(())
    }

    async fn receive_bytes(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut rx_buffer = vec![0; size];

        log::trace!("read {size} bytes");
        let result =
            tokio::time::timeout(self.io_timeout, self.serial.read_exact(&mut rx_buffer)).await;
        self.last_execution = Instant::now();
        result??;

        log::trace!("receive_bytes: {rx_buffer:02X?}");
        Ok(rx_buffer)
    }

    async fn exchange(&mut self, slave: u8) -> Result<Response> {
        let request = Request::read_input_registers(slave, 0, REGISTER_COUNT as u16);
        self.send_bytes(&request.encode()).await?;
        let reply = self.receive_bytes(Response::reply_size()).await?;
        Ok(Response::decode(&reply, slave)?)
    }

    /// Sets the timeout for individual I/O operations (read/write) on the serial port.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
        Ok(())
    }

    /// Sets the minimum delay between two requests, never below [`MINIMUM_DELAY`].
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    /// Reads the full input register map of `slave`, retrying failed exchanges.
    pub async fn read_input_registers(&mut self, slave: u8) -> Result<Response> {
        log::trace!("read input registers of slave {slave:02X}");
        for t in 0..self.retries {
            match self.exchange(slave).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    log::trace!("Failed try {} of {}, repeating ({err})", t + 1, self.retries);
                }
            }
        }
        self.exchange(slave).await
    }

    pub async fn get_samples(&mut self, slave: u8) -> Result<SampleSet> {
        Ok(self.read_input_registers(slave).await?.samples())
    }
}
