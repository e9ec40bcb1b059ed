//! ext2/3/4 block allocation from the group block bitmaps.
//!
//! Only the superblock and group descriptor table are parsed. Blocks owned by
//! no bitmap (the boot block, anything past the last group) count as used.

use std::io::{Read, Seek, SeekFrom};

use crate::error::{RecoveryError, Result};

const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_SIZE: usize = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const INCOMPAT_64BIT: u32 = 0x80;
const BG_BLOCK_UNINIT: u16 = 0x0002;
const MAX_LOG_BLOCK_SIZE: u32 = 6;

/// Allocation state of every block of an ext filesystem.
#[derive(Debug, Clone)]
pub struct BlockUsage {
    block_size: u64,
    first_data_block: u64,
    blocks_per_group: u64,
    total_blocks: u64,
    /// Per-group bitmap; `None` for groups flagged `BLOCK_UNINIT`.
    groups: Vec<Option<Vec<u8>>>,
}

impl BlockUsage {
    /// Parse the allocation bitmaps. `Ok(None)` when there is no ext superblock.
    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Option<Self>> {
        reader.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
        let mut sb = [0u8; SUPERBLOCK_SIZE];
        if read_full(reader, &mut sb)? < SUPERBLOCK_SIZE {
            return Ok(None);
        }
        if le16(&sb, 0x38) != EXT_MAGIC {
            return Ok(None);
        }

        let blocks_count_lo = le32(&sb, 0x04) as u64;
        let first_data_block = le32(&sb, 0x14) as u64;
        let log_block_size = le32(&sb, 0x18);
        let blocks_per_group = le32(&sb, 0x20) as u64;
        let feature_incompat = le32(&sb, 0x60);

        if log_block_size > MAX_LOG_BLOCK_SIZE {
            return Err(RecoveryError::corrupt(format!("ext: log_block_size {log_block_size} out of range")));
        }
        if blocks_per_group == 0 {
            return Err(RecoveryError::corrupt("ext: blocks_per_group is 0"));
        }
        let block_size = 1024u64 << log_block_size;
        let is_64bit = feature_incompat & INCOMPAT_64BIT != 0;
        let desc_size = if is_64bit { (le16(&sb, 0xFE) as usize).max(64) } else { 32 };
        let total_blocks = if is_64bit {
            ((le32(&sb, 0x150) as u64) << 32) | blocks_count_lo
        } else {
            blocks_count_lo
        };
        if total_blocks <= first_data_block {
            return Err(RecoveryError::corrupt(format!(
                "ext: {total_blocks} blocks with first data block {first_data_block}"
            )));
        }

        let group_count = (total_blocks - first_data_block).div_ceil(blocks_per_group) as usize;
        let mut gdt = vec![0u8; group_count * desc_size];
        reader.seek(SeekFrom::Start((first_data_block + 1) * block_size))?;
        reader
            .read_exact(&mut gdt)
            .map_err(|e| RecoveryError::corrupt(format!("ext: group descriptors unreadable: {e}")))?;

        let mut groups = Vec::with_capacity(group_count);
        for d in gdt.chunks_exact(desc_size) {
            let flags = le16(d, 0x12);
            if flags & BG_BLOCK_UNINIT != 0 {
                groups.push(None);
                continue;
            }
            let mut bitmap_block = le32(d, 0x00) as u64;
            if is_64bit && desc_size >= 64 {
                bitmap_block |= (le32(d, 0x20) as u64) << 32;
            }
            if bitmap_block >= total_blocks {
                return Err(RecoveryError::corrupt(format!("ext: block bitmap at {bitmap_block} past end")));
            }
            reader.seek(SeekFrom::Start(bitmap_block * block_size))?;
            let mut bitmap = vec![0u8; block_size as usize];
            reader
                .read_exact(&mut bitmap)
                .map_err(|e| RecoveryError::corrupt(format!("ext: block bitmap unreadable: {e}")))?;
            groups.push(Some(bitmap));
        }

        log::debug!(
            "ext: {total_blocks} blocks of {block_size} bytes, {group_count} groups"
        );
        Ok(Some(Self {
            block_size,
            first_data_block,
            blocks_per_group,
            total_blocks,
            groups,
        }))
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    pub fn is_block_used(&self, block: u64) -> bool {
        if block < self.first_data_block || block >= self.total_blocks {
            return true;
        }
        let rel = block - self.first_data_block;
        let group = (rel / self.blocks_per_group) as usize;
        let bit = rel % self.blocks_per_group;
        match self.groups.get(group) {
            Some(Some(bitmap)) => bitmap
                .get((bit / 8) as usize)
                .is_some_and(|byte| byte & (1u8 << (bit % 8)) != 0),
            Some(None) => false,
            None => true,
        }
    }

    /// True if any filesystem block overlapping `[offset, offset + len)` is allocated.
    pub fn is_range_used(&self, offset: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let first = offset / self.block_size;
        let last = (offset + len - 1) / self.block_size;
        (first..=last).any(|b| self.is_block_used(b))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn le32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}
