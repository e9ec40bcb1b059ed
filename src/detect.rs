//! Image format detection from leading bytes.

use std::io::Read;
use std::path::Path;

use crate::error::{RecoveryError, Result};
use crate::formats::sparse::SPARSE_HEADER_MAGIC;
use crate::formats::yaffs2::{self, ObjectType, ROOT_OBJECT_ID};
use crate::formats::{BackupMethod, ImageReader};

/// Bytes of decompressed content inspected.
pub const DETECT_WINDOW: usize = 8192;

const MBR_SIGNATURE_OFFSET: usize = 510;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];

const EXT_SUPERBLOCK_OFFSET: usize = 1024;
const EXT_MAGIC_OFFSET: usize = EXT_SUPERBLOCK_OFFSET + 0x38;
const EXT_MAGIC: u16 = 0xEF53;

/// Classify the image at `path`. Gzip-wrapped files are inspected after inflation.
pub fn detect_method(path: &Path) -> Result<BackupMethod> {
    let mut reader = ImageReader::open(path)?;
    let mut buf = Vec::with_capacity(DETECT_WINDOW);
    reader.by_ref().take(DETECT_WINDOW as u64).read_to_end(&mut buf)?;
    let method = classify(&buf).ok_or_else(|| RecoveryError::UnknownFormat(path.to_path_buf()))?;
    log::debug!("{}: detected {method}", path.display());
    Ok(method)
}

/// Classify a buffer of leading image bytes. First match wins.
pub fn classify(buf: &[u8]) -> Option<BackupMethod> {
    if read_u32(buf, 0) == Some(SPARSE_HEADER_MAGIC) {
        return Some(BackupMethod::Ext4SparseImage);
    }
    if buf.get(MBR_SIGNATURE_OFFSET..MBR_SIGNATURE_OFFSET + 2) == Some(&MBR_SIGNATURE[..]) {
        return Some(BackupMethod::RawDump);
    }
    if read_u16(buf, EXT_MAGIC_OFFSET) == Some(EXT_MAGIC) {
        return Some(BackupMethod::Ext4Image);
    }
    if looks_like_yaffs2(buf) {
        return Some(BackupMethod::SequentialLogImage);
    }
    None
}

fn looks_like_yaffs2(buf: &[u8]) -> bool {
    let Some((_, root)) = yaffs2::header_unit_at(buf, 0) else {
        return false;
    };
    if root.obj_type != ObjectType::Directory || root.parent_id != ROOT_OBJECT_ID || !root.name.is_empty() {
        return false;
    }
    match yaffs2::header_unit_at(buf, 1) {
        Some((_, child)) => child.parent_id == ROOT_OBJECT_ID && !child.name.is_empty(),
        None => false,
    }
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    buf.get(off..off + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::yaffs2::UNIT_SIZE;

    fn ext4_buf() -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[EXT_MAGIC_OFFSET..EXT_MAGIC_OFFSET + 2].copy_from_slice(&EXT_MAGIC.to_le_bytes());
        buf
    }

    #[test]
    fn test_mbr_wins_over_ext4() {
        let mut buf = ext4_buf();
        buf[510] = 0x55;
        buf[511] = 0xAA;
        assert_eq!(classify(&buf), Some(BackupMethod::RawDump));
    }

    #[test]
    fn test_ext4_magic_alone() {
        assert_eq!(classify(&ext4_buf()), Some(BackupMethod::Ext4Image));
    }

    #[test]
    fn test_sparse_magic_first() {
        let mut buf = ext4_buf();
        buf[..4].copy_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        buf[510] = 0x55;
        buf[511] = 0xAA;
        assert_eq!(classify(&buf), Some(BackupMethod::Ext4SparseImage));
    }

    #[test]
    fn test_short_buffers_are_unknown() {
        assert_eq!(classify(&[]), None);
        assert_eq!(classify(&[0x3a, 0xff]), None);
        assert_eq!(classify(&[0u8; 1081]), None);
        // a lone yaffs2 root header is not enough
        assert_eq!(classify(&[0xFFu8; UNIT_SIZE + 100]), None);
    }
}
