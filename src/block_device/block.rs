use core::ops::{Add, Deref, DerefMut};

/// A single 512-byte sector.
///
/// Kept as a named type rather than a bare array so callers pass buffers
/// around explicitly - there is deliberately no shared scratch sector
/// anywhere in this crate.
#[derive(Clone)]
pub struct Block {
    /// The 512 bytes in this sector.
    pub contents: [u8; Block::LEN],
}

impl Block {
    /// Every sector this crate handles is 512 bytes long.
    pub const LEN: usize = 512;

    /// A new all-zeroes sector.
    pub fn new() -> Block {
        Block {
            contents: [0u8; Self::LEN],
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Block {
    type Target = [u8; Block::LEN];
    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        writeln!(fmt, "Block:")?;
        for line in self.contents.chunks(32) {
            for b in line {
                write!(fmt, "{:02x}", b)?;
            }
            writeln!(fmt)?;
        }
        Ok(())
    }
}

/// The linear address of a sector on a block device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

/// A number of sectors.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockCount(pub u32);

impl Add<BlockCount> for BlockIdx {
    type Output = BlockIdx;
    fn add(self, rhs: BlockCount) -> BlockIdx {
        BlockIdx(self.0 + rhs.0)
    }
}

impl Add<u32> for BlockIdx {
    type Output = BlockIdx;
    fn add(self, rhs: u32) -> BlockIdx {
        BlockIdx(self.0 + rhs)
    }
}
