//! sd-spi-log - Block Device support
//!
//! Generic code for handling block devices.

mod block;
pub use block::*;

/// Represents a block device - a device which can read and write 512-byte
/// sectors. Only supports devices which are <= 2 TiB in size.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one or more blocks, starting at the given block index.
    fn read(&mut self, blocks: &mut [Block], start_block_idx: BlockIdx)
        -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;

    /// Read a single block into a fresh buffer.
    fn read_block(&mut self, block_idx: BlockIdx) -> Result<Block, Self::Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx)?;
        let [block] = blocks;
        Ok(block)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
    ) -> Result<(), Self::Error> {
        (*self).read(blocks, start_block_idx)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).write(blocks, start_block_idx)
    }
}

/// A block device backed by a borrowed byte slice. Used to exercise the
/// volume locator, driver dispatch and filesystem-facing code on a host.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a mut [u8],
}

/// Errors `MemoryBlockDevice` can generate.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MemoryDeviceError {
    /// An access fell outside of the backing slice.
    OutOfBounds,
}

impl<'a> MemoryBlockDevice<'a> {
    /// Wrap a byte slice. The slice length should be a multiple of
    /// [`Block::LEN`].
    pub fn new(memory: &'a mut [u8]) -> Self {
        Self { memory }
    }

    /// The number of whole blocks in the backing slice.
    pub fn num_blocks(&self) -> BlockCount {
        BlockCount((self.memory.len() / Block::LEN) as u32)
    }

    fn block_range(&self, block_idx: usize) -> Result<core::ops::Range<usize>, MemoryDeviceError> {
        let start = block_idx * Block::LEN;
        let end = start + Block::LEN;
        if end > self.memory.len() {
            return Err(MemoryDeviceError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    type Error = MemoryDeviceError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
    ) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter_mut().enumerate() {
            let range = self.block_range(start_block_idx.0 as usize + idx)?;
            block.contents.copy_from_slice(&self.memory[range]);
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter().enumerate() {
            let range = self.block_range(start_block_idx.0 as usize + idx)?;
            self.memory[range].copy_from_slice(&block.contents);
        }
        Ok(())
    }
}
