//! sd-spi-log - SD SPI command encoding
//!
//! Pure functions and constants for the SD command subset this crate speaks.
//! Nothing in here touches the bus; the [`sdcard`](crate::sdcard) module
//! owns the wire exchange.

use crate::block_device::BlockIdx;

/// GO_IDLE_STATE - reset the card into SPI mode
pub const CMD0: u8 = 0;
/// SEND_IF_COND - check voltage range, distinguishes v2 cards
pub const CMD8: u8 = 8;
/// READ_SINGLE_BLOCK
pub const CMD17: u8 = 17;
/// WRITE_BLOCK
pub const CMD24: u8 = 24;
/// APP_CMD - next command is application-specific
pub const CMD55: u8 = 55;
/// READ_OCR
pub const CMD58: u8 = 58;
/// SD_SEND_OP_COND - leave idle state, preceded by CMD55 each time
pub const ACMD41: u8 = 41;

/// CMD0 is sent before CRC checking can be disabled, so its CRC byte is fixed.
pub const CMD0_CRC: u8 = 0x95;
/// CRC byte for CMD8 with the standard 0x1AA argument.
pub const CMD8_CRC: u8 = 0x87;
/// CMD8 argument: 2.7-3.6V voltage window plus 0xAA check pattern.
pub const CMD8_CHECK_PATTERN: u32 = 0x1AA;
/// HCS bit in the ACMD41 argument, requests SDHC/SDXC operation.
pub const ACMD41_HCS: u32 = 0x4000_0000;

/// Token preceding the 512 data bytes of a single-block read or write.
pub const DATA_START_TOKEN: u8 = 0xFE;
/// Mask for the meaningful low bits of the write data-response token.
pub const DATA_RESPONSE_MASK: u8 = 0x1F;
/// Data-response value meaning "data accepted".
pub const DATA_RESPONSE_ACCEPTED: u8 = 0x05;

bitflags::bitflags! {
    /// R1 response bits. Bit 7 of a valid R1 is always zero, which is what
    /// makes `0xFF` an unambiguous "no response yet" byte on the wire.
    pub struct R1: u8 {
        const IDLE_STATE = 0x01;
        const ERASE_RESET = 0x02;
        const ILLEGAL_COMMAND = 0x04;
        const CRC_ERROR = 0x08;
        const ERASE_SEQUENCE_ERROR = 0x10;
        const ADDRESS_ERROR = 0x20;
        const PARAMETER_ERROR = 0x40;
    }
}

/// R1 value for a card sitting in the idle state (the expected CMD0 answer).
pub const R1_IDLE_STATE: u8 = 0x01;
/// R1 value for a fully initialized card.
pub const R1_READY_STATE: u8 = 0x00;

/// Compute the SD CRC7 over a command packet (polynomial x^7 + x^3 + 1,
/// MSB first), returning the final frame byte `(crc7 << 1) | 1` with the
/// end bit already ORed in.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut byte in data.iter().copied() {
        for _ in 0..8 {
            crc <<= 1;
            if ((byte & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            byte <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Build the 6-byte SD SPI command frame: start bits plus command index,
/// big-endian argument, CRC byte.
///
/// With `crc` set to `None` the CRC7 is computed over the first five bytes.
/// A `Some(raw)` byte is transmitted verbatim - once the card has CRC
/// checking disabled it is conventional to send `0xFF` instead of a real
/// checksum.
pub fn command_frame(command: u8, argument: u32, crc: Option<u8>) -> [u8; 6] {
    let mut frame = [
        0x40 | (command & 0x3F),
        (argument >> 24) as u8,
        (argument >> 16) as u8,
        (argument >> 8) as u8,
        argument as u8,
        0,
    ];
    frame[5] = match crc {
        Some(raw) => raw,
        None => crc7(&frame[0..5]),
    };
    frame
}

/// The Operating Conditions Register, as returned by CMD58. Four bytes,
/// most significant first.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Ocr(pub [u8; 4]);

impl Ocr {
    /// Card Capacity Status, OCR bit 30. Set for block-addressed
    /// (SDHC/SDXC) cards.
    pub fn card_capacity_status(&self) -> bool {
        (self.0[0] & 0x40) != 0
    }

    /// Derive the addressing mode this card expects for data commands.
    pub fn addressing_mode(&self) -> AddressingMode {
        if self.card_capacity_status() {
            AddressingMode::Block
        } else {
            AddressingMode::Byte
        }
    }
}

/// Whether CMD17/CMD24 arguments are sector numbers or byte offsets.
///
/// Derived once per card session from the OCR and carried on the
/// [`SdCard`](crate::SdCard) value - deliberately not process-wide state.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AddressingMode {
    /// Standard-capacity cards address data by byte offset.
    Byte,
    /// High-capacity cards address data by 512-byte sector number.
    Block,
}

impl AddressingMode {
    /// Translate a logical block address into the CMD17/CMD24 argument.
    pub fn block_argument(self, lba: BlockIdx) -> u32 {
        match self {
            AddressingMode::Block => lba.0,
            AddressingMode::Byte => lba.0 * 512,
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
