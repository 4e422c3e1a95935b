use crate::sample::SampleSet;
use crate::Error;
use crc::{Crc, CRC_16_MODBUS};

#[cfg(feature = "protocol_serde")]
use serde::{Deserialize, Serialize};

pub const DEFAULT_SLAVE_ADDRESS: u8 = 0x01;
/// MODBUS "read input registers", the only function served by the slave.
pub const READ_INPUT_REGISTERS: u8 = 0x04;
/// 4 cells + 1 current + 2 temperatures
pub const REGISTER_COUNT: usize = 7;
pub const REQUEST_LENGTH: usize = 8;
pub const RESPONSE_BYTES: usize = REGISTER_COUNT * 2;
pub const RESPONSE_LENGTH: usize = RESPONSE_BYTES + 5;

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(4);
pub const BAUD_RATE: u32 = 9600;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

fn append_crc(buffer: &mut [u8]) {
    let len = buffer.len();
    let crc = crc16(&buffer[..len - 2]).to_le_bytes();
    buffer[len - 2] = crc[0];
    buffer[len - 1] = crc[1];
}

fn validate_len(buffer: &[u8], expected: usize) -> std::result::Result<(), Error> {
    if buffer.len() != expected {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            expected,
            buffer.len()
        );
        return Err(Error::FrameLength {
            expected,
            received: buffer.len(),
        });
    }
    Ok(())
}

/// Checks the trailing CRC (low byte first) against the preceding bytes.
fn validate_checksum(buffer: &[u8]) -> std::result::Result<(), Error> {
    let len = buffer.len();
    let calculated = crc16(&buffer[..len - 2]);
    let received = u16::from_le_bytes([buffer[len - 2], buffer[len - 1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={:02X?}",
            calculated,
            received,
            buffer
        );
        return Err(Error::CrcMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

/// A decoded 8 byte query frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Request {
    pub address: u8,
    pub function: u8,
    pub start_address: u16,
    pub quantity: u16,
}

impl Request {
    pub fn read_input_registers(address: u8, start_address: u16, quantity: u16) -> Self {
        Self {
            address,
            function: READ_INPUT_REGISTERS,
            start_address,
            quantity,
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_LENGTH] {
        let mut tx_buffer = [0; REQUEST_LENGTH];
        tx_buffer[0] = self.address;
        tx_buffer[1] = self.function;
        tx_buffer[2..4].copy_from_slice(&self.start_address.to_be_bytes());
        tx_buffer[4..6].copy_from_slice(&self.quantity.to_be_bytes());
        append_crc(&mut tx_buffer);
        tx_buffer
    }

    /// Decodes a complete frame. Only the length and the CRC are checked here,
    /// see [`Request::validate`] for the field checks.
    pub fn decode(rx_buffer: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(rx_buffer, REQUEST_LENGTH)?;
        validate_checksum(rx_buffer)?;
        Ok(Self {
            address: rx_buffer[0],
            function: rx_buffer[1],
            start_address: u16::from_be_bytes([rx_buffer[2], rx_buffer[3]]),
            quantity: u16::from_be_bytes([rx_buffer[4], rx_buffer[5]]),
        })
    }

    /// Rejects anything but a read of at most [`REGISTER_COUNT`] input registers.
    /// The start address is not interpreted, the full register map is always served.
    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.function != READ_INPUT_REGISTERS || usize::from(self.quantity) > REGISTER_COUNT {
            log::warn!(
                "Unsupported request - function={:02X} quantity={}",
                self.function,
                self.quantity
            );
            return Err(Error::UnsupportedRequest {
                function: self.function,
                quantity: self.quantity,
            });
        }
        Ok(())
    }
}

/// Reply to a read input registers request carrying the full register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize, Deserialize))]
pub struct Response {
    pub address: u8,
    pub registers: [i16; REGISTER_COUNT],
}

impl Response {
    pub fn new(address: u8, samples: &SampleSet) -> Self {
        Self {
            address,
            registers: samples.to_registers(),
        }
    }

    pub fn reply_size() -> usize {
        RESPONSE_LENGTH
    }

    pub fn encode(&self) -> [u8; RESPONSE_LENGTH] {
        let mut tx_buffer = [0; RESPONSE_LENGTH];
        tx_buffer[0] = self.address;
        tx_buffer[1] = READ_INPUT_REGISTERS;
        tx_buffer[2] = RESPONSE_BYTES as u8;
        for (i, register) in self.registers.iter().enumerate() {
            tx_buffer[3 + 2 * i..5 + 2 * i].copy_from_slice(&register.to_be_bytes());
        }
        append_crc(&mut tx_buffer);
        tx_buffer
    }

    pub fn decode(rx_buffer: &[u8], expected_address: u8) -> std::result::Result<Self, Error> {
        validate_len(rx_buffer, Self::reply_size())?;
        validate_checksum(rx_buffer)?;
        if rx_buffer[0] != expected_address {
            return Err(Error::AddressMismatch {
                expected: expected_address,
                received: rx_buffer[0],
            });
        }
        if rx_buffer[1] != READ_INPUT_REGISTERS {
            return Err(Error::UnexpectedReply(format!(
                "function={:02X}",
                rx_buffer[1]
            )));
        }
        if usize::from(rx_buffer[2]) != RESPONSE_BYTES {
            return Err(Error::UnexpectedReply(format!(
                "byte count={} expected={}",
                rx_buffer[2], RESPONSE_BYTES
            )));
        }
        let mut registers = [0; REGISTER_COUNT];
        for (i, register) in registers.iter_mut().enumerate() {
            *register = i16::from_be_bytes([rx_buffer[3 + 2 * i], rx_buffer[4 + 2 * i]]);
        }
        Ok(Self {
            address: rx_buffer[0],
            registers,
        })
    }

    pub fn samples(&self) -> SampleSet {
        SampleSet::from_registers(&self.registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_of_reference_frame() {
        let frame = [0x01, 0x04, 0x00, 0x00, 0x00, 0x07];
        assert_eq!(crc16(&frame), 0xC8B1);
        assert_eq!(crc16(&frame), crc16(&frame));
        // Well known read holding register frame: 01 03 00 00 00 01 84 0A
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn request_encode_appends_crc_low_byte_first() {
        let frame = Request::read_input_registers(0x01, 0, 7).encode();
        assert_eq!(frame, [0x01, 0x04, 0x00, 0x00, 0x00, 0x07, 0xB1, 0xC8]);
    }

    #[test]
    fn request_decode_rejects_bad_crc() {
        let mut frame = Request::read_input_registers(0x01, 0, 7).encode();
        frame[7] ^= 0xFF;
        assert!(matches!(
            Request::decode(&frame),
            Err(Error::CrcMismatch {
                calculated: 0xC8B1,
                ..
            })
        ));
    }

    #[test]
    fn request_decode_rejects_short_frame() {
        assert!(matches!(
            Request::decode(&[0x01, 0x04, 0x00]),
            Err(Error::FrameLength {
                expected: 8,
                received: 3
            })
        ));
    }

    #[test]
    fn validate_quantity_and_function() {
        assert!(Request::read_input_registers(1, 0, 7).validate().is_ok());
        assert!(Request::read_input_registers(1, 0, 0).validate().is_ok());
        assert!(matches!(
            Request::read_input_registers(1, 0, 8).validate(),
            Err(Error::UnsupportedRequest {
                function: 0x04,
                quantity: 8
            })
        ));
        let mut request = Request::read_input_registers(1, 0, 7);
        request.function = 0x03;
        assert!(request.validate().is_err());
    }

    #[test]
    fn response_layout() {
        let samples = SampleSet {
            cell_voltages: [3400, 3410, 3395, 3405],
            current: 2000,
            temperatures: [25, 26],
        };
        let frame = Response::new(0x01, &samples).encode();
        assert_eq!(
            frame,
            [
                0x01, 0x04, 0x0E, 0x0D, 0x48, 0x0D, 0x52, 0x0D, 0x43, 0x0D, 0x4D, 0x07, 0xD0,
                0x00, 0x19, 0x00, 0x1A, 0xDF, 0x35
            ]
        );
    }

    #[test]
    fn response_decode_negative_values() {
        let samples = SampleSet {
            cell_voltages: [3300, 0, 1, 3650],
            current: -1500,
            temperatures: [-999, -20],
        };
        let frame = Response::new(0x11, &samples).encode();
        let decoded = Response::decode(&frame, 0x11).unwrap();
        assert_eq!(decoded.samples(), samples);
        assert!(matches!(
            Response::decode(&frame, 0x12),
            Err(Error::AddressMismatch {
                expected: 0x12,
                received: 0x11
            })
        ));
    }
}
