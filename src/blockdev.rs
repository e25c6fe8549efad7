/*
   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

      http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

use crate::error::BootError;

/// Narrow view of the boot eMMC. The raw driver lives below this trait;
/// everything in this crate reads and writes whole blocks through it.
pub trait BlockDevice {
    /// Size of one block in bytes. 512 on the devices we care about.
    fn block_size(&self) -> usize;

    /// Total number of blocks on the device.
    fn block_count(&self) -> u64;

    /// Read `count` blocks starting at absolute block `start` into `dst`.
    /// `dst` must hold exactly `count * block_size()` bytes.
    fn read_blocks(&mut self, start: u64, count: u64, dst: &mut [u8]) -> Result<(), BootError>;

    /// Write `count` blocks starting at absolute block `start` from `src`.
    fn write_blocks(&mut self, start: u64, count: u64, src: &[u8]) -> Result<(), BootError>;

    /// Enable power-on write protection for `length` bytes starting at
    /// byte offset `from`.
    fn power_on_write_protect(&mut self, from: u64, length: u64) -> Result<(), BootError>;
}

/// A named region of the device, as found in the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    /// First block of the partition.
    pub start: u64,
    /// Number of blocks the partition spans.
    pub blocks: u64,
}

/// Number of blocks needed to hold `bytes`, rounding up.
pub fn block_cnt(bytes: u64, block_size: usize) -> u64 {
    let blksz = block_size as u64;
    (bytes + blksz - 1) / blksz
}

/// Read `len` bytes from a partition, starting `offset_blocks` into it.
/// The read is block-granular; the returned buffer is truncated to `len`.
pub fn read_partition_bytes(
    dev: &mut dyn BlockDevice,
    part: &PartitionInfo,
    offset_blocks: u64,
    len: usize,
) -> Result<Vec<u8>, BootError> {
    let blksz = dev.block_size();
    let count = block_cnt(len as u64, blksz);
    if offset_blocks + count > part.blocks {
        return Err(BootError::Io);
    }
    let mut buf = vec![0u8; (count as usize) * blksz];
    dev.read_blocks(part.start + offset_blocks, count, &mut buf)?;
    buf.truncate(len);
    Ok(buf)
}

/// Write `src` to a partition starting `offset_blocks` into it, one block
/// per write call. The tail of the last block is zero-filled. Issuing
/// single-block writes bounds the damage of a mid-write power loss to
/// one block.
pub fn write_partition_bytes(
    dev: &mut dyn BlockDevice,
    part: &PartitionInfo,
    offset_blocks: u64,
    src: &[u8],
) -> Result<(), BootError> {
    let blksz = dev.block_size();
    let count = block_cnt(src.len() as u64, blksz);
    if offset_blocks + count > part.blocks {
        return Err(BootError::Io);
    }
    let mut padded = vec![0u8; (count as usize) * blksz];
    padded[..src.len()].copy_from_slice(src);
    for i in 0..count {
        let chunk = &padded[(i as usize) * blksz..(i as usize + 1) * blksz];
        dev.write_blocks(part.start + offset_blocks + i, 1, chunk)?;
    }
    Ok(())
}
