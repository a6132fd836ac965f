//! sd-spi-log - Media driver request dispatch
//!
//! The surface a filesystem layer drives the card through. Requests carry
//! filesystem-relative logical sector numbers; the driver translates them to
//! physical LBAs using the partition offset discovered by
//! [`volume`](crate::volume) and performs the I/O one sector at a time.

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

use crate::block_device::{Block, BlockDevice, BlockIdx, MemoryBlockDevice};
use crate::volume::PartitionInfo;

/// Media that can (re)initialize itself when the filesystem opens it.
///
/// For an [`SdCard`](crate::SdCard) this re-derives the addressing mode via
/// CMD58; for host-test media it is a no-op.
pub trait MediaInit: BlockDevice {
    fn media_init(&mut self) -> Result<(), Self::Error>;
}

impl<'a> MediaInit for MemoryBlockDevice<'a> {
    fn media_init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A request from the filesystem layer.
///
/// Read and write requests address `count` consecutive logical sectors
/// starting at `logical_sector`, packed back-to-back in `buffer`. The boot
/// variants are the same operation, kept distinct because filesystem layers
/// issue them separately while mounting.
#[derive(Debug)]
pub enum DriverRequest<'a> {
    Init,
    Uninit,
    Read {
        logical_sector: u32,
        count: u32,
        buffer: &'a mut [u8],
    },
    BootRead {
        logical_sector: u32,
        count: u32,
        buffer: &'a mut [u8],
    },
    Write {
        logical_sector: u32,
        count: u32,
        buffer: &'a [u8],
    },
    BootWrite {
        logical_sector: u32,
        count: u32,
        buffer: &'a [u8],
    },
    Flush,
    Abort,
}

/// What a successfully dispatched request produced.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DriverResponse {
    /// Init succeeded; here is the volume geometry.
    Ready(MediaGeometry),
    /// The request completed.
    Done,
}

/// Volume geometry reported on INIT.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MediaGeometry {
    pub bytes_per_sector: u32,
    pub total_sectors: u32,
}

/// The status a failed request reports back.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DriverError {
    /// A sector transfer failed. The request stops at the first failing
    /// sector; retry policy belongs to the filesystem above.
    IoError,
    /// The request addressed sectors beyond the partition.
    OutOfRange,
    /// The buffer cannot hold `count` sectors.
    BufferTooSmall,
    /// This driver does not implement the request.
    NotImplemented,
}

/// Dispatches [`DriverRequest`]s against one partition of one block device.
pub struct VolumeDriver<D>
where
    D: MediaInit,
{
    device: D,
    partition: PartitionInfo,
}

impl<D> VolumeDriver<D>
where
    D: MediaInit,
{
    /// Bind a device and the partition the filesystem should see.
    pub fn new(device: D, partition: PartitionInfo) -> Self {
        Self { device, partition }
    }

    /// Give the underlying device back.
    pub fn release(self) -> D {
        self.device
    }

    /// The partition every logical sector is translated against.
    pub fn partition(&self) -> &PartitionInfo {
        &self.partition
    }

    fn range_check(&self, logical_sector: u32, count: u32) -> Result<(), DriverError> {
        let end = logical_sector
            .checked_add(count)
            .ok_or(DriverError::OutOfRange)?;
        if end > self.partition.sector_count.0 {
            warn!(
                "request for sectors {}..{} exceeds partition of {} sectors",
                logical_sector, end, self.partition.sector_count.0
            );
            return Err(DriverError::OutOfRange);
        }
        Ok(())
    }

    fn physical(&self, logical_sector: u32, i: u32) -> BlockIdx {
        self.partition.start_lba + (logical_sector + i)
    }

    fn read_sectors(
        &mut self,
        logical_sector: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<DriverResponse, DriverError> {
        self.range_check(logical_sector, count)?;
        if buffer.len() < count as usize * Block::LEN {
            return Err(DriverError::BufferTooSmall);
        }

        let mut block = Block::new();
        for i in 0..count {
            self.device
                .read(core::slice::from_mut(&mut block), self.physical(logical_sector, i))
                .map_err(|_e| DriverError::IoError)?;
            let offset = i as usize * Block::LEN;
            buffer[offset..offset + Block::LEN].copy_from_slice(&block.contents);
        }
        Ok(DriverResponse::Done)
    }

    fn write_sectors(
        &mut self,
        logical_sector: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<DriverResponse, DriverError> {
        self.range_check(logical_sector, count)?;
        if buffer.len() < count as usize * Block::LEN {
            return Err(DriverError::BufferTooSmall);
        }

        let mut block = Block::new();
        for i in 0..count {
            let offset = i as usize * Block::LEN;
            block
                .contents
                .copy_from_slice(&buffer[offset..offset + Block::LEN]);
            self.device
                .write(core::slice::from_ref(&block), self.physical(logical_sector, i))
                .map_err(|_e| DriverError::IoError)?;
        }
        Ok(DriverResponse::Done)
    }

    /// Dispatch one request.
    ///
    /// A single failing sector aborts the whole multi-sector request. Flush
    /// is a successful no-op because single-block writes already confirm
    /// completion synchronously; Abort and anything unrecognized report
    /// [`DriverError::NotImplemented`].
    pub fn handle(&mut self, request: DriverRequest) -> Result<DriverResponse, DriverError> {
        match request {
            DriverRequest::Init => {
                debug!("driver init");
                self.device.media_init().map_err(|_e| DriverError::IoError)?;
                Ok(DriverResponse::Ready(MediaGeometry {
                    bytes_per_sector: Block::LEN as u32,
                    total_sectors: self.partition.sector_count.0,
                }))
            }
            DriverRequest::Uninit => Ok(DriverResponse::Done),
            DriverRequest::Read {
                logical_sector,
                count,
                buffer,
            }
            | DriverRequest::BootRead {
                logical_sector,
                count,
                buffer,
            } => self.read_sectors(logical_sector, count, buffer),
            DriverRequest::Write {
                logical_sector,
                count,
                buffer,
            }
            | DriverRequest::BootWrite {
                logical_sector,
                count,
                buffer,
            } => self.write_sectors(logical_sector, count, buffer),
            DriverRequest::Flush => Ok(DriverResponse::Done),
            DriverRequest::Abort => Err(DriverError::NotImplemented),
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
