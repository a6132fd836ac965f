//! # sd-spi-log
//!
//! > An SD-over-SPI block device driver with a rollover debug log core,
//! > written in Embedded Rust
//!
//! This crate brings an SD card up over a raw SPI bus, locates the usable
//! FAT partition, and exposes the card to a filesystem layer as a block
//! device. Next to that it carries a small log-structured write path which
//! appends debug records to an active file and archives the file once a
//! size threshold would be exceeded.
//!
//! Both halves are deliberately hardware-independent: the SD stack talks to
//! anything implementing the `embedded_hal` blocking SPI transfer and output
//! pin traits, and the log core talks to anything implementing
//! [`FileOps`](logfile::FileOps). That seam is the point of the design -
//! every operation can be replayed against a scripted bus or a fake
//! filesystem on a host machine, without real hardware.
//!
//! ```rust,ignore
//! let mut card = sd_spi_log::SdCard::new(spi, cs);
//! card.initialize(&mut delay)?;
//! let partition = sd_spi_log::volume::find_partition0(&mut card)?;
//! let mut driver = sd_spi_log::driver::VolumeDriver::new(card, partition);
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the
//! `defmt-log` feature you can configure this crate to log messages over
//! defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

pub mod block_device;
pub mod driver;
pub mod logfile;
pub mod proto;
pub mod sdcard;
pub mod volume;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::logfile::{FileOps, LogFile};
pub use crate::sdcard::Error as SdCardError;
pub use crate::sdcard::SdCard;
pub use crate::volume::PartitionInfo;

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
