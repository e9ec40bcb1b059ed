//! Filesystem image construction.
//!
//! An [`ImageBuilder`] produces the image of a volume as a series of
//! block-aligned writes into an [`ImageSink`]. The sink is either the sparse
//! encoder or a flat writer, so one builder serves both ext4 backup methods.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{RecoveryError, Result};
use crate::formats::sparse::SparseWriter;
use crate::formats::{fraction, CHUNK_SIZE};
use crate::fs::ext::BlockUsage;
use crate::progress::Reporter;
use crate::volume::Volume;

/// Destination for image bytes written at non-decreasing offsets.
pub trait ImageSink {
    fn block_size(&self) -> u32;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Extend the image to `len` bytes.
    fn pad(&mut self, len: u64) -> Result<()>;
}

impl<W: Write> ImageSink for SparseWriter<W> {
    fn block_size(&self) -> u32 {
        SparseWriter::block_size(self)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.write(offset, data)
    }

    fn pad(&mut self, len: u64) -> Result<()> {
        SparseWriter::pad(self, len)
    }
}

/// Writes a plain image, zero-filling forward gaps.
///
/// The output may be a gzip stream, so it is never seeked.
pub struct FlatImageWriter<W: Write> {
    out: W,
    block_size: u32,
    cursor: u64,
}

impl<W: Write> FlatImageWriter<W> {
    pub fn new(out: W, block_size: u32) -> Self {
        Self {
            out,
            block_size,
            cursor: 0,
        }
    }

    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }

    fn fill_zeros(&mut self, mut len: u64) -> Result<()> {
        let zeros = vec![0u8; CHUNK_SIZE];
        while len > 0 {
            let n = len.min(zeros.len() as u64) as usize;
            self.out.write_all(&zeros[..n])?;
            len -= n as u64;
        }
        Ok(())
    }
}

impl<W: Write> ImageSink for FlatImageWriter<W> {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset < self.cursor {
            return Err(RecoveryError::NonMonotonicWrite {
                offset,
                cursor: self.cursor,
            });
        }
        self.fill_zeros(offset - self.cursor)?;
        self.out.write_all(data)?;
        self.cursor = offset + data.len() as u64;
        Ok(())
    }

    fn pad(&mut self, len: u64) -> Result<()> {
        if self.cursor > len {
            return Err(RecoveryError::NonMonotonicWrite {
                offset: len,
                cursor: self.cursor,
            });
        }
        self.fill_zeros(len - self.cursor)?;
        self.cursor = len;
        Ok(())
    }
}

/// Builds the filesystem image of a volume.
pub trait ImageBuilder {
    /// Emit `size` bytes of image for `volume` into `sink`.
    fn build(&self, volume: &Volume, size: u64, sink: &mut dyn ImageSink, reporter: &Reporter<'_>) -> Result<()>;
}

/// Copies the volume's block device.
///
/// Blocks the ext block bitmaps mark free become holes. Every other block is
/// copied, zero-filled or not. Without readable ext metadata the whole device
/// is copied.
pub struct BlockCopyBuilder;

impl ImageBuilder for BlockCopyBuilder {
    fn build(&self, volume: &Volume, size: u64, sink: &mut dyn ImageSink, reporter: &Reporter<'_>) -> Result<()> {
        let device = volume.device_path()?;
        let block = sink.block_size() as usize;
        if block == 0 {
            return Err(RecoveryError::InvalidArgument("zero block size".into()));
        }
        let mut file = File::open(device)?;
        let usage = match BlockUsage::read(&mut file) {
            Ok(Some(usage)) => Some(usage),
            Ok(None) => {
                log::debug!("{}: no ext superblock, copying every block", volume.name);
                None
            }
            Err(e) => {
                reporter.warn(format!("{}: cannot read block bitmaps, copying every block: {e}", volume.name));
                None
            }
        };
        file.seek(SeekFrom::Start(0))?;
        let mut input = file.take(size);
        // whole blocks per run, so non-final runs stay block-aligned
        let run_cap = (CHUNK_SIZE / block).max(1) * block;

        let mut run: Vec<u8> = Vec::with_capacity(run_cap);
        let mut run_start = 0u64;
        let mut offset = 0u64;
        let mut blk = vec![0u8; block];

        loop {
            let n = read_block(&mut input, &mut blk)?;
            if n == 0 {
                break;
            }
            let data = &blk[..n];
            let free = usage.as_ref().is_some_and(|u| !u.is_range_used(offset, n as u64));
            if free {
                if !run.is_empty() {
                    sink.write_at(run_start, &run)?;
                    run.clear();
                }
            } else {
                if run.is_empty() {
                    run_start = offset;
                }
                run.extend_from_slice(data);
                if run.len() >= run_cap {
                    sink.write_at(run_start, &run)?;
                    run.clear();
                }
            }
            offset += n as u64;
            reporter.progress(fraction(offset, size));
            if n < block {
                break;
            }
        }
        if !run.is_empty() {
            sink.write_at(run_start, &run)?;
        }
        sink.pad(size)?;
        log::debug!("{}: imaged {offset} of {size} bytes", volume.name);
        Ok(())
    }
}

fn read_block(input: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
