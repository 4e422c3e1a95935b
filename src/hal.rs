use crate::sample::Channel;
use crate::Error;
use std::time::Duration;

/// Provider of raw ADC samples.
pub trait SensorSource {
    /// Returns a 12-bit sample (0..=4095) for `channel`, or `None` when the
    /// channel is inactive or the conversion failed.
    fn read_channel(&mut self, channel: Channel) -> Option<u16>;
}

/// The two complementary digital outputs driven by the protection decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine {
    /// Normal discharge path enabled.
    Primary,
    /// Protective (fault) path enabled.
    Fault,
}

/// Everything the slave core needs from the target. Real targets implement
/// it on top of their peripheral crates, tests substitute a simulated bus.
pub trait BmsHal: SensorSource {
    fn set_output(&mut self, line: OutputLine, high: bool);

    /// Enables or disables the byte received interrupt. Implementations
    /// must mirror the state into the [`crate::receiver::FrameReceiver`]
    /// their interrupt handler calls.
    fn set_receive_interrupt(&mut self, enable: bool);

    /// Switches the UART receiver itself on or off. Bytes arriving while
    /// the receiver is off are lost.
    fn set_receiver(&mut self, enable: bool);

    /// Set the RS-485 driver enable pin (High = TX, Low = RX).
    fn set_tx_enable(&mut self, enable: bool);

    /// Blocking read of the next received byte. `None` waits forever.
    fn read_byte(&mut self, timeout: Option<Duration>) -> Result<u8, Error>;

    /// Queues one byte for transmission, blocking while the transmit
    /// register is occupied.
    fn write_byte(&mut self, byte: u8) -> Result<(), Error>;

    /// Blocks until the last byte has been fully clocked out on the wire.
    fn wait_transmit_complete(&mut self, timeout: Duration) -> Result<(), Error>;

    fn sleep(&mut self, duration: Duration);
}
