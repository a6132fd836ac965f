//! sd-spi-log - Volume location
//!
//! Figures out where the usable FAT volume lives on a freshly initialized
//! card: either behind partition 0 of an MBR, or - for "superfloppy" cards
//! formatted without a partition table - at LBA 0 itself.

use core::convert::TryInto;
use core::fmt::Debug;

use crate::block_device::{BlockCount, BlockDevice, BlockIdx};

/// Errors produced while locating a volume.
#[derive(Debug, PartialEq)]
pub enum Error<DeviceError>
where
    DeviceError: Debug,
{
    /// The underlying block device failed
    DeviceError(DeviceError),
    /// LBA 0 does not carry the 0x55AA signature
    InvalidMbrSignature,
}

impl<E> From<E> for Error<E>
where
    E: Debug,
{
    fn from(e: E) -> Self {
        Self::DeviceError(e)
    }
}

/// The type byte of an MBR partition entry, decoded for the FAT variants
/// seen in the wild.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum PartitionType {
    /// Marker for a FAT32 partition with CHS and LBA. What the macOS disk
    /// utility (and also SD-Card formatter?) use.
    Fat32ChsLba,
    /// Marker for a FAT32 partition. Sometimes also used for FAT16
    /// formatted partitions.
    Fat32Lba,
    /// Marker for a FAT16 partition with LBA. Seen on a Raspberry Pi SD card.
    Fat16Lba,
    /// Marker for a FAT16 partition. Seen on a card formatted with the
    /// official SD-Card formatter.
    Fat16,
    /// Anything else. Kept rather than rejected - the sector arithmetic
    /// works regardless, and whether the contents are mountable is the
    /// filesystem layer's call.
    Unknown(u8),
}

impl PartitionType {
    const FAT32_CHS_LBA: u8 = 0x0B;
    const FAT32_LBA: u8 = 0x0C;
    const FAT16_LBA: u8 = 0x0E;
    const FAT16: u8 = 0x06;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::FAT32_CHS_LBA => Self::Fat32ChsLba,
            Self::FAT32_LBA => Self::Fat32Lba,
            Self::FAT16_LBA => Self::Fat16Lba,
            Self::FAT16 => Self::Fat16,
            _ => Self::Unknown(value),
        }
    }
}

/// Where the usable volume starts and how many sectors it spans.
///
/// Every logical sector `L` a filesystem asks for satisfies
/// `physical = start_lba + L` with `L < sector_count`.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PartitionInfo {
    /// Partition type byte, decoded.
    pub ty: PartitionType,
    /// First physical sector of the volume.
    pub start_lba: BlockIdx,
    /// Length of the volume in sectors.
    pub sector_count: BlockCount,
}

/// The volume boot record as located on the card, with its signature bytes
/// for the caller to verify.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct VolumeBootSector {
    /// The sector that was treated as the VBR.
    pub lba: BlockIdx,
    /// Bytes 510 and 511 of that sector, 0x55 0xAA when valid.
    pub signature: [u8; 2],
}

const MBR_SIGNATURE_OFFSET: usize = 510;
const PARTITION_ENTRY0_OFFSET: usize = 446;
const ENTRY_TYPE_OFFSET: usize = 4;
const ENTRY_LBA_START_OFFSET: usize = 8;
const ENTRY_NUM_BLOCKS_OFFSET: usize = 12;

fn entry_u32(sector: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(sector[offset..offset + 4].try_into().expect("Infallible"))
}

fn has_boot_signature(sector: &[u8]) -> bool {
    sector[MBR_SIGNATURE_OFFSET] == 0x55 && sector[MBR_SIGNATURE_OFFSET + 1] == 0xAA
}

/// Read LBA 0 as an MBR and parse the first partition entry.
pub fn find_partition0<D>(device: &mut D) -> Result<PartitionInfo, Error<D::Error>>
where
    D: BlockDevice,
{
    let sector = device.read_block(BlockIdx(0))?;

    if !has_boot_signature(&*sector) {
        return Err(Error::InvalidMbrSignature);
    }

    let entry = &sector[PARTITION_ENTRY0_OFFSET..PARTITION_ENTRY0_OFFSET + 16];
    Ok(PartitionInfo {
        ty: PartitionType::from_u8(entry[ENTRY_TYPE_OFFSET]),
        start_lba: BlockIdx(entry_u32(entry, ENTRY_LBA_START_OFFSET)),
        sector_count: BlockCount(entry_u32(entry, ENTRY_NUM_BLOCKS_OFFSET)),
    })
}

/// Decide whether LBA 0 is itself a FAT volume boot record or an MBR, then
/// read the chosen VBR sector and report its signature bytes.
///
/// A first byte of 0xEB or 0xE9 is the jump instruction a FAT boot sector
/// starts with, which marks a superfloppy layout with no partition table.
pub fn locate_volume_boot_sector<D>(device: &mut D) -> Result<VolumeBootSector, Error<D::Error>>
where
    D: BlockDevice,
{
    let sector = device.read_block(BlockIdx(0))?;

    let lba = match sector[0] {
        0xEB | 0xE9 => BlockIdx(0),
        _ => find_partition0(device)?.start_lba,
    };

    let vbr = device.read_block(lba)?;
    Ok(VolumeBootSector {
        lba,
        signature: [vbr[MBR_SIGNATURE_OFFSET], vbr[MBR_SIGNATURE_OFFSET + 1]],
    })
}
