//! Host-side tests for the SD protocol stack, driven through a scripted SPI
//! bus. No hardware involved: the bus double records every byte the driver
//! clocks out and plays back a canned sequence of response bytes, and the
//! chip-select double counts pin transitions so select/deselect pairing can
//! be audited on every exit path.

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use sd_spi_log::proto::AddressingMode;
use sd_spi_log::{BlockIdx, SdCard, SdCardError};

struct ScriptedSpi {
    /// Every byte the driver clocked out, in order.
    observed: Vec<u8>,
    /// Bytes the "card" answers with; 0xFF once exhausted, like a released
    /// MISO line.
    responses: VecDeque<u8>,
}

impl ScriptedSpi {
    fn new() -> Self {
        Self {
            observed: Vec::new(),
            responses: VecDeque::new(),
        }
    }

    /// Queue `count` idle response bytes (0xFF).
    fn idle(&mut self, count: usize) -> &mut Self {
        self.respond(&vec![0xFF; count])
    }

    fn respond(&mut self, bytes: &[u8]) -> &mut Self {
        self.responses.extend(bytes.iter().copied());
        self
    }
}

impl Transfer<u8> for ScriptedSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        for word in words.iter_mut() {
            self.observed.push(*word);
            *word = self.responses.pop_front().unwrap_or(0xFF);
        }
        Ok(words)
    }
}

#[derive(Debug)]
struct CsPin {
    is_high: bool,
    times_asserted: u32,
    times_deasserted: u32,
}

impl CsPin {
    fn new() -> Self {
        Self {
            is_high: true,
            times_asserted: 0,
            times_deasserted: 0,
        }
    }
}

impl OutputPin for CsPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        self.is_high = false;
        self.times_asserted += 1;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.is_high = true;
        self.times_deasserted += 1;
        Ok(())
    }
}

struct NoDelay;

impl DelayMs<u8> for NoDelay {
    fn delay_ms(&mut self, _ms: u8) {}
}

#[test]
fn cmd0_sends_frame_and_polls_for_r1() {
    let mut spi = ScriptedSpi::new();
    // 10 idle clock bytes, the selected gap byte, then the 6 frame bytes all
    // see a silent line...
    spi.idle(10 + 1 + 6);
    // ...the card stays quiet for three poll bytes and then answers idle.
    spi.respond(&[0xFF, 0xFF, 0xFF, 0x01]);

    let mut card = SdCard::new(spi, CsPin::new());
    let r1 = card.cmd0_go_idle(&mut NoDelay).unwrap();
    assert_eq!(r1, 0x01);

    let (spi, cs) = card.release();
    // Idle clocks, gap, frame, 4 poll bytes, 2 trailing clocks.
    let mut expected = vec![0xFF; 10];
    expected.push(0xFF);
    expected.extend_from_slice(&[0x40, 0x00, 0x00, 0x00, 0x00, 0x95]);
    expected.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
    expected.extend_from_slice(&[0xFF, 0xFF]);
    assert_eq!(spi.observed, expected);

    assert!(cs.is_high);
    assert_eq!(cs.times_asserted, 1);
}

#[test]
fn command_timeout_when_line_stays_silent() {
    // Nothing scripted at all: the line reads 0xFF forever.
    let mut card = SdCard::new(ScriptedSpi::new(), CsPin::new());
    let result = card.read_single_block(BlockIdx(0), &mut sd_spi_log::Block::new());
    assert_eq!(result, Err(SdCardError::CommandTimeout(17)));

    let (_spi, cs) = card.release();
    // The error path still deasserted chip select.
    assert!(cs.is_high);
    assert_eq!(cs.times_asserted, 1);
}

#[test]
fn read_single_block_happy_path() {
    let mut spi = ScriptedSpi::new();
    // Gap byte and frame see a silent line, R1 arrives on the first poll.
    spi.idle(1 + 6).respond(&[0x00]);
    // One quiet byte, then the data token, 512 data bytes, 2 CRC bytes.
    spi.respond(&[0xFF, 0xFE]);
    let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
    spi.respond(&data);
    spi.respond(&[0xAB, 0xCD]);

    let mut card = SdCard::new(spi, CsPin::new());
    let mut block = sd_spi_log::Block::new();
    card.read_single_block(BlockIdx(2), &mut block).unwrap();
    assert_eq!(&block.contents[..], &data[..]);

    let (spi, cs) = card.release();
    // Byte addressing is the pre-CMD58 default, so LBA 2 becomes byte
    // offset 1024 in the CMD17 argument.
    assert_eq!(&spi.observed[1..7], &[0x51, 0x00, 0x00, 0x04, 0x00, 0xFF]);
    assert!(cs.is_high);
    assert_eq!(cs.times_asserted, 1);
    assert_eq!(cs.times_deasserted, 1);
}

#[test]
fn cmd8_illegal_command_skips_r7_payload() {
    let mut spi = ScriptedSpi::new();
    // A v1 card rejects CMD8 as illegal; no R7 payload follows.
    spi.idle(1 + 6).respond(&[0x05]);

    let mut card = SdCard::new(spi, CsPin::new());
    let (r1, r7) = card.cmd8_send_if_cond().unwrap();
    assert_eq!(r1, 0x05);
    assert_eq!(r7, [0xFF; 4]);

    let (spi, cs) = card.release();
    // Gap, frame, one poll byte, two trailing clocks - and no payload reads.
    assert_eq!(spi.observed.len(), 1 + 6 + 1 + 2);
    assert!(cs.is_high);
}

#[test]
fn read_fails_on_unexpected_token() {
    let mut spi = ScriptedSpi::new();
    // R1 accepts the command, but the card then reports a data error token
    // instead of 0xFE.
    spi.idle(1 + 6).respond(&[0x00]).respond(&[0x08]);

    let mut card = SdCard::new(spi, CsPin::new());
    let result = card.read_single_block(BlockIdx(0), &mut sd_spi_log::Block::new());
    assert_eq!(result, Err(SdCardError::UnexpectedToken(0x08)));

    let (_spi, cs) = card.release();
    assert!(cs.is_high);
}

#[test]
fn write_single_block_happy_path() {
    let mut spi = ScriptedSpi::new();
    // Gap, frame, R1 on first poll, one gap byte before the data token.
    spi.idle(1 + 6).respond(&[0x00]).idle(1);
    // Token, 512 data bytes and 2 CRC bytes are clocked out against a
    // silent line, then the data-response token accepts and the card is
    // busy for two byte-times.
    spi.idle(1 + 512 + 2).respond(&[0xE5, 0x00, 0x00, 0xFF]);

    let mut block = sd_spi_log::Block::new();
    for (i, b) in block.contents.iter_mut().enumerate() {
        *b = i as u8;
    }

    let mut card = SdCard::new(spi, CsPin::new());
    card.write_single_block(BlockIdx(0), &block).unwrap();

    let (spi, cs) = card.release();
    // Frame, then after the R1 poll and gap byte the 0xFE token and data.
    assert_eq!(&spi.observed[1..7], &[0x58, 0x00, 0x00, 0x00, 0x00, 0xFF]);
    let token_at = 1 + 6 + 1 + 1;
    assert_eq!(spi.observed[token_at], 0xFE);
    assert_eq!(&spi.observed[token_at + 1..token_at + 513], &block.contents[..]);
    assert!(cs.is_high);
}

#[test]
fn write_rejected_data_response_is_an_error() {
    let mut spi = ScriptedSpi::new();
    // 0x0B in the low five bits means "CRC error" rather than accepted.
    spi.idle(1 + 6).respond(&[0x00]).idle(1 + 1 + 512 + 2);
    spi.respond(&[0x0B]);

    let mut card = SdCard::new(spi, CsPin::new());
    let result = card.write_single_block(BlockIdx(0), &sd_spi_log::Block::new());
    assert_eq!(result, Err(SdCardError::WriteRejected(0x0B)));

    let (_spi, cs) = card.release();
    assert!(cs.is_high);
}

#[test]
fn full_init_handshake_derives_block_addressing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut spi = ScriptedSpi::new();

    // CMD0: idle clocks, gap, frame, immediate idle answer, trailing clocks.
    spi.idle(10 + 1 + 6).respond(&[0x01]).idle(2);
    // CMD8: gap, frame, R1 idle, then the R7 payload echoing the check
    // pattern, trailing clocks.
    spi.idle(1 + 6)
        .respond(&[0x01, 0x00, 0x00, 0x01, 0xAA])
        .idle(2);
    // ACMD41 first attempt: inter-attempt idle clocks, gap, CMD55 frame and
    // its idle R1, gap byte, ACMD41 frame and a ready R1, trailing clocks.
    spi.idle(2 + 1 + 6)
        .respond(&[0x01])
        .idle(1 + 6)
        .respond(&[0x00])
        .idle(2);
    // CMD58: gap, frame, ready R1, an OCR with the CCS bit set, trailing
    // clocks.
    spi.idle(1 + 6)
        .respond(&[0x00, 0xC0, 0xFF, 0x80, 0x00])
        .idle(2);

    let mut card = SdCard::new(spi, CsPin::new());
    card.initialize(&mut NoDelay).unwrap();
    assert_eq!(card.addressing_mode(), AddressingMode::Block);

    let (spi, cs) = card.release();
    assert!(cs.is_high);
    assert_eq!(cs.times_asserted, 4);
    assert!(spi.responses.is_empty(), "script fully consumed");
}

#[test]
fn acmd41_reports_last_r1_when_card_never_readies() {
    let mut spi = ScriptedSpi::new();
    // Every attempt: the CMD55 and ACMD41 exchanges answer idle forever.
    for _ in 0..100 {
        spi.idle(2 + 1 + 6).respond(&[0x01]).idle(1 + 6).respond(&[0x01]).idle(2);
    }

    let mut card = SdCard::new(spi, CsPin::new());
    let result = card.acmd41_until_ready(&mut NoDelay);
    assert_eq!(result, Err(SdCardError::CardNotReady(0x01)));

    let (_spi, cs) = card.release();
    assert!(cs.is_high);
}
