use crate::sample::Channel;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reply came from another slave than the one addressed.
    #[error("Address mismatch - expected={expected:#04X} received={received:#04X}")]
    AddressMismatch { expected: u8, received: u8 },
    /// Address and CRC were fine, but the function code or the register
    /// quantity is not served by this slave.
    #[error("Unsupported request - function={function:#04X} quantity={quantity}")]
    UnsupportedRequest { function: u8, quantity: u16 },
    #[error("CRC mismatch - calculated={calculated:#06X} received={received:#06X}")]
    CrcMismatch { calculated: u16, received: u16 },
    #[error("Sensor read error on channel {channel:?}")]
    SensorRead { channel: Channel },
    #[error("Invalid frame length - expected={expected} received={received}")]
    FrameLength { expected: usize, received: usize },
    /// Reply header does not match the request (master side).
    #[error("Unexpected reply - {0}")]
    UnexpectedReply(String),
    #[error("Timeout elapsed")]
    Timeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
