//! sd-spi-log - SD card protocol over SPI
//!
//! Implements the SD card init handshake and single-block data transfer on
//! some generic SPI interface.
//!
//! This is currently optimised for readability and debugability, not
//! performance.

mod bus;
use bus::{SdBus, MAX_R1_POLL_BYTES};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

use crate::block_device::{Block, BlockDevice, BlockIdx};
use crate::proto::{
    AddressingMode, Ocr, ACMD41, ACMD41_HCS, CMD0, CMD0_CRC, CMD17, CMD24, CMD55, CMD58, CMD8,
    CMD8_CHECK_PATTERN, CMD8_CRC, R1, R1_IDLE_STATE, R1_READY_STATE,
};

/// How often CMD55+ACMD41 is retried before the card is declared stuck in
/// idle. The card is allowed to take tens to hundreds of milliseconds here,
/// so this is the one loop in the stack that tolerates real-world latency.
const ACMD41_MAX_ATTEMPTS: u32 = 100;

/// Injected delay between ACMD41 attempts, in milliseconds.
const ACMD41_RETRY_DELAY_MS: u8 = 10;

/// Represents an SD card on an SPI bus. We need Chip Select to be separate
/// so we can clock out some bytes without Chip Select asserted (which is
/// what puts the card into SPI mode in the first place).
///
/// The addressing mode lives here, on the session value, rather than in any
/// process-wide state. It defaults to byte addressing and is re-derived from
/// the OCR whenever CMD58 runs.
pub struct SdCard<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: SPI,
    cs: CS,
    addressing: AddressingMode,
}

/// The possible errors `SdCard` can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Error {
    /// We got an error from the SPI peripheral
    Transport,
    /// Couldn't set a GPIO pin
    GpioError,
    /// No R1 response appeared for this command within the poll bound
    CommandTimeout(u8),
    /// The card answered a command with R1 error bits set
    CommandRejected(u8, u8),
    /// No data token appeared within the poll bound
    DataTokenTimeout,
    /// We got a token that is neither 0xFF nor the expected data token
    UnexpectedToken(u8),
    /// The card rejected the data we wrote (bad data-response token)
    WriteRejected(u8),
    /// The card stayed busy after a write for the whole poll bound
    TimeoutWaitNotBusy,
    /// CMD0 never produced the idle response
    CardNotFound,
    /// ACMD41 never left idle; carries the last R1 for diagnostics
    CardNotReady(u8),
    /// We got a bad response from Command 58
    Cmd58Error(u8),
}

impl<SPI, CS> SdCard<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create a new SD card interface using a raw SPI bus and a chip select
    /// pin. No bus traffic happens until a command method is called.
    pub fn new(spi: SPI, cs: CS) -> Self {
        SdCard {
            spi,
            cs,
            addressing: AddressingMode::Byte,
        }
    }

    /// Give the underlying peripherals back.
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// The addressing mode derived from the last CMD58, or the byte-mode
    /// default if CMD58 has not run yet.
    pub fn addressing_mode(&self) -> AddressingMode {
        self.addressing
    }

    /// Clock one byte with chip select deasserted.
    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Provide idle clocks (0xFF on MOSI) so the card can complete internal
    /// timing. Chip select state is whatever the caller left it at.
    fn idle_clocks(&mut self, count: u32) -> Result<(), Error> {
        for _ in 0..count {
            self.discard_byte()?;
        }
        Ok(())
    }

    /// Run a closure with chip select asserted.
    ///
    /// Chip select is always deasserted afterwards, even if the closure
    /// errors, and the card gets a couple of trailing clocks to release the
    /// data line cleanly.
    fn with_chip_select<F, T>(&mut self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut SdBus<SPI, CS>) -> Result<T, Error>,
    {
        let result = {
            let mut bus = SdBus::new(&mut self.spi, &mut self.cs)?;
            f(&mut bus)
        };
        let _ = self.idle_clocks(2);
        result
    }

    /// Send CMD0 (GO_IDLE_STATE) to force the card into SPI mode, and return
    /// the raw R1 response. The expected answer is `0x01` (idle).
    ///
    /// Provides the mandatory >= 74 idle clocks with chip select deasserted
    /// first, and uses the fixed CMD0 CRC because the card is still checking
    /// CRCs at this point.
    pub fn cmd0_go_idle<D>(&mut self, delay: &mut D) -> Result<u8, Error>
    where
        D: DelayMs<u8>,
    {
        trace!("CMD0 go idle");
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        delay.delay_ms(5);
        self.idle_clocks(10)?;

        let r1 = self.with_chip_select(|bus| {
            bus.receive()?;
            bus.send_command(CMD0, 0, Some(CMD0_CRC), MAX_R1_POLL_BYTES)
        })?;

        if r1 != R1_IDLE_STATE {
            warn!("CMD0 response: {:x}", r1);
        }
        Ok(r1)
    }

    /// Send CMD8 (SEND_IF_COND) and return the R1 response together with the
    /// 4-byte R7 payload.
    ///
    /// The payload is only clocked in when the card did not reject the
    /// command as illegal; an illegal-command response (`r1 == 0x05`) is a
    /// valid outcome meaning a v1 card, not a failure.
    pub fn cmd8_send_if_cond(&mut self) -> Result<(u8, [u8; 4]), Error> {
        trace!("CMD8 send interface condition");
        self.with_chip_select(|bus| {
            bus.receive()?;
            let r1 = bus.send_command(CMD8, CMD8_CHECK_PATTERN, Some(CMD8_CRC), MAX_R1_POLL_BYTES)?;

            let mut r7 = [0xFF; 4];
            if !R1::from_bits_truncate(r1).contains(R1::ILLEGAL_COMMAND) {
                for b in r7.iter_mut() {
                    *b = bus.receive()?;
                }
            }
            Ok((r1, r7))
        })
    }

    /// Repeatedly send CMD55 then ACMD41 (with the HCS bit set) until the
    /// card reports ready, deselecting and idle-clocking between attempts.
    ///
    /// Returns [`Error::CardNotReady`] with the last R1 if the card never
    /// leaves idle within the attempt bound. A missing response on one
    /// attempt is retried, not fatal - cards legitimately stay silent while
    /// their internal init is still running.
    pub fn acmd41_until_ready<D>(&mut self, delay: &mut D) -> Result<(), Error>
    where
        D: DelayMs<u8>,
    {
        let mut last_r1 = 0xFF;
        for attempt in 0..ACMD41_MAX_ATTEMPTS {
            trace!("ACMD41 attempt {}", attempt);
            self.cs.set_high().map_err(|_| Error::GpioError)?;
            self.idle_clocks(2)?;

            let result = self.with_chip_select(|bus| {
                bus.receive()?;
                bus.send_command(CMD55, 0, Some(0xFF), MAX_R1_POLL_BYTES)?;
                bus.receive()?;
                bus.send_command(ACMD41, ACMD41_HCS, Some(0xFF), MAX_R1_POLL_BYTES)
            });

            match result {
                Ok(R1_READY_STATE) => return Ok(()),
                Ok(r1) => last_r1 = r1,
                Err(Error::CommandTimeout(_)) => last_r1 = 0xFF,
                Err(e) => return Err(e),
            }

            delay.delay_ms(ACMD41_RETRY_DELAY_MS);
        }

        warn!("card never became ready, last R1 {:x}", last_r1);
        Err(Error::CardNotReady(last_r1))
    }

    /// Send CMD58 (READ_OCR), parse the OCR and update the session
    /// addressing mode from the CCS bit.
    ///
    /// An R1 of `0x00` or `0x01` both legally carry an OCR.
    pub fn cmd58_read_ocr(&mut self) -> Result<Ocr, Error> {
        trace!("CMD58 read OCR");
        let ocr = self.with_chip_select(|bus| {
            bus.receive()?;
            let r1 = bus.send_command(CMD58, 0, Some(0xFF), MAX_R1_POLL_BYTES)?;
            if r1 != R1_READY_STATE && r1 != R1_IDLE_STATE {
                return Err(Error::Cmd58Error(r1));
            }

            let mut bytes = [0xFF; 4];
            for b in bytes.iter_mut() {
                *b = bus.receive()?;
            }
            Ok(Ocr(bytes))
        })?;

        self.addressing = ocr.addressing_mode();
        debug!("OCR read, addressing mode {:?}", self.addressing);
        Ok(ocr)
    }

    /// Re-derive the addressing mode by issuing CMD58 again. The media
    /// driver calls this on INIT so a re-mounted volume never runs with a
    /// stale flag.
    pub fn refresh_addressing_mode(&mut self) -> Result<AddressingMode, Error> {
        self.cmd58_read_ocr()?;
        Ok(self.addressing)
    }

    /// Run the full init handshake: CMD0, CMD8, the ACMD41 readiness loop,
    /// then CMD58 for the addressing mode.
    ///
    /// Each step's failure is reported as-is; there are no retries across
    /// steps here. If the caller wants to power-cycle and try again, that
    /// policy lives above this crate.
    pub fn initialize<D>(&mut self, delay: &mut D) -> Result<(), Error>
    where
        D: DelayMs<u8>,
    {
        debug!("initializing card");
        let r1 = self.cmd0_go_idle(delay)?;
        if r1 != R1_IDLE_STATE {
            return Err(Error::CardNotFound);
        }

        let (r1, r7) = self.cmd8_send_if_cond()?;
        if R1::from_bits_truncate(r1).contains(R1::ILLEGAL_COMMAND) {
            debug!("CMD8 rejected, legacy v1 card");
        } else {
            debug!("v2 card, R7 check pattern {:x}", r7[3]);
        }

        self.acmd41_until_ready(delay)?;
        self.cmd58_read_ocr()?;
        debug!("card initialized");
        Ok(())
    }

    /// Read one 512-byte sector using CMD17.
    pub fn read_single_block(&mut self, lba: BlockIdx, block: &mut Block) -> Result<(), Error> {
        let argument = self.addressing.block_argument(lba);
        self.with_chip_select(|bus| {
            bus.receive()?;
            let r1 = bus.send_command(CMD17, argument, Some(0xFF), MAX_R1_POLL_BYTES)?;
            if r1 != R1_READY_STATE {
                return Err(Error::CommandRejected(CMD17, r1));
            }
            bus.read_data(&mut block.contents)
        })
    }

    /// Write one 512-byte sector using CMD24. Returns once the card has
    /// accepted the data and released its busy signalling, so a successful
    /// return means the write is committed.
    pub fn write_single_block(&mut self, lba: BlockIdx, block: &Block) -> Result<(), Error> {
        let argument = self.addressing.block_argument(lba);
        self.with_chip_select(|bus| {
            bus.receive()?;
            let r1 = bus.send_command(CMD24, argument, Some(0xFF), MAX_R1_POLL_BYTES)?;
            if r1 != R1_READY_STATE {
                return Err(Error::CommandRejected(CMD24, r1));
            }
            bus.receive()?;
            bus.write_data(&block.contents)
        })
    }
}

impl<SPI, CS> BlockDevice for SdCard<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    type Error = Error;

    /// Read one or more blocks, one CMD17 per sector. Multi-block commands
    /// are deliberately not used.
    fn read(&mut self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        for (i, block) in blocks.iter_mut().enumerate() {
            self.read_single_block(start_block_idx + i as u32, block)?;
        }
        Ok(())
    }

    /// Write one or more blocks, one CMD24 per sector.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Error> {
        for (i, block) in blocks.iter().enumerate() {
            self.write_single_block(start_block_idx + i as u32, block)?;
        }
        Ok(())
    }
}

impl<SPI, CS> crate::driver::MediaInit for SdCard<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// The media driver re-derives the addressing mode on every INIT.
    fn media_init(&mut self) -> Result<(), Error> {
        self.refresh_addressing_mode()?;
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
