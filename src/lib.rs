#![cfg_attr(docsrs, feature(doc_cfg))]
//! # rtubms_lib
//!
//! Slave side of a MODBUS RTU "read input registers" link for a 4 cell
//! battery monitor, together with the threshold based protection decision
//! that gates the discharge path.
//!
//! The core ([`slave::Slave`]) never touches hardware directly, everything
//! goes through the [`hal::BmsHal`] trait. The only state shared with the
//! byte received interrupt is the signal inside [`receiver::FrameReceiver`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `rtubms` command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** master and the host side slave HAL using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** master using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` support for the protocol data structures.

/// Contains error types for the library.
mod error;
/// Hardware abstraction consumed by the slave core.
pub mod hal;
pub mod protection;
/// MODBUS RTU framing and CRC.
pub mod protocol;
pub mod receiver;
pub mod sample;
pub mod slave;

pub use error::Error;
pub use protection::{ProtectionState, Thresholds};
pub use receiver::{FrameReceiver, FrameState};
pub use sample::SampleSet;
pub use slave::{Slave, SlaveConfig};

/// Synchronous MODBUS master.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Slave HAL on top of a host serial port.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serial_hal;

/// Asynchronous MODBUS master.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
