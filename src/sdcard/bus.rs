use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

use crate::proto::{DATA_RESPONSE_ACCEPTED, DATA_RESPONSE_MASK, DATA_START_TOKEN};

use super::Error;

/// How many bytes we clock while polling for an R1 response.
pub(crate) const MAX_R1_POLL_BYTES: u32 = 100;

/// How many bytes we clock while waiting for a read data token.
///
/// The bound is denominated in bus byte-times (every poll iteration clocks
/// one byte), so it scales with the SPI clock rather than wall time.
pub(crate) const MAX_DATA_TOKEN_POLL_BYTES: u32 = 100_000;

/// How many bytes we clock while the card holds the line low after a write.
pub(crate) const MAX_BUSY_POLL_BYTES: u32 = 200_000;

/// A struct used to ensure that communication only occurs while chip select
/// is asserted.
///
/// Dropping the guard deasserts CS, so every exit path out of a card
/// transaction - early error returns included - leaves the card deselected.
/// A card left selected would leak into the next command on the shared bus.
pub(crate) struct SdBus<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
}

impl<'spi, 'cs, SPI, CS> Drop for SdBus<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs.set_high().ok();
    }
}

impl<'spi, 'cs, SPI, CS> SdBus<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS) -> Result<Self, Error> {
        cs.set_low().map_err(|_| Error::GpioError)?;
        Ok(Self { spi, cs })
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the card by clocking out an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Send a byte to the card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Transmit a 6-byte command frame, then poll for the R1 response.
    ///
    /// The first non-0xFF byte on the wire is the response (bit 7 of a valid
    /// R1 is always clear, so 0xFF cannot be a real answer). Clocking
    /// `max_poll_bytes` without seeing one is a timeout.
    pub fn send_command(
        &mut self,
        command: u8,
        argument: u32,
        crc: Option<u8>,
        max_poll_bytes: u32,
    ) -> Result<u8, Error> {
        let frame = crate::proto::command_frame(command, argument, crc);
        for b in frame.iter() {
            self.send(*b)?;
        }

        for _ in 0..max_poll_bytes {
            let response = self.receive()?;
            if response != 0xFF {
                return Ok(response);
            }
        }

        Err(Error::CommandTimeout(command))
    }

    /// Wait for the 0xFE data start token, then read exactly 512 data bytes
    /// plus the two CRC bytes (discarded - data CRC validation is not done
    /// at this layer).
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let token = self.wait_for_data_token()?;
        if token != DATA_START_TOKEN {
            return Err(Error::UnexpectedToken(token));
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }

        let _crc_hi = self.receive()?;
        let _crc_lo = self.receive()?;

        Ok(())
    }

    /// Send the data start token, 512 data bytes and two dummy CRC bytes,
    /// then check the data-response token and wait out the card's busy
    /// signalling.
    pub fn write_data(&mut self, buffer: &[u8]) -> Result<(), Error> {
        self.send(DATA_START_TOKEN)?;
        for &b in buffer.iter() {
            self.send(b)?;
        }
        self.send(0xFF)?;
        self.send(0xFF)?;

        let response = self.receive()?;
        if (response & DATA_RESPONSE_MASK) != DATA_RESPONSE_ACCEPTED {
            return Err(Error::WriteRejected(response));
        }

        self.wait_not_busy()
    }

    fn wait_for_data_token(&mut self) -> Result<u8, Error> {
        for _ in 0..MAX_DATA_TOKEN_POLL_BYTES {
            let token = self.receive()?;
            if token != 0xFF {
                return Ok(token);
            }
        }
        Err(Error::DataTokenTimeout)
    }

    /// Spin until the card releases the line (returns 0xFF), or the busy
    /// bound expires.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        for _ in 0..MAX_BUSY_POLL_BYTES {
            if self.receive()? == 0xFF {
                return Ok(());
            }
        }
        Err(Error::TimeoutWaitNotBusy)
    }
}
