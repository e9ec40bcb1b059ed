//! Sparse ext4 image codec.
//!
//! A sparse image is a 28-byte header followed by chunks. Each chunk has a
//! 12-byte header and either `chunk_sz * blk_sz` bytes of payload (`Raw`) or
//! nothing (`DontCare`, a hole). All integers are little-endian. The image
//! checksum is a CRC-32 over every block of the expanded image, holes counted
//! as zeros.
//!
//! When compressed, only the chunk stream is gzip-wrapped. The header stays
//! in the clear at the start of the file so a raw scan always finds the magic.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use super::{fraction, CountingReader, ImageReader, ImageWriter, CHUNK_SIZE};
use crate::error::{RecoveryError, Result};
use crate::progress::Reporter;

pub const SPARSE_HEADER_MAGIC: u32 = 0xed26_ff3a;
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 0;
pub const SPARSE_HEADER_LEN: u16 = 28;
pub const CHUNK_HEADER_LEN: u16 = 12;

pub const CHUNK_TYPE_RAW: u16 = 0xcac1;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub blk_sz: u32,
    pub total_blks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    pub fn new(blk_sz: u32) -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            file_hdr_sz: SPARSE_HEADER_LEN,
            chunk_hdr_sz: CHUNK_HEADER_LEN,
            blk_sz,
            total_blks: 0,
            total_chunks: 0,
            image_checksum: 0,
        }
    }

    /// Parse and validate a header, skipping any extra declared header bytes.
    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let mut raw = [0u8; SPARSE_HEADER_LEN as usize];
        read_exact_or_corrupt(r, &mut raw, "sparse header")?;
        let mut c = io::Cursor::new(&raw[..]);

        let magic = c.read_u32::<LittleEndian>()?;
        if magic != SPARSE_HEADER_MAGIC {
            return Err(RecoveryError::corrupt(format!("bad sparse magic 0x{magic:08x}")));
        }
        let header = Self {
            major_version: c.read_u16::<LittleEndian>()?,
            minor_version: c.read_u16::<LittleEndian>()?,
            file_hdr_sz: c.read_u16::<LittleEndian>()?,
            chunk_hdr_sz: c.read_u16::<LittleEndian>()?,
            blk_sz: c.read_u32::<LittleEndian>()?,
            total_blks: c.read_u32::<LittleEndian>()?,
            total_chunks: c.read_u32::<LittleEndian>()?,
            image_checksum: c.read_u32::<LittleEndian>()?,
        };

        if header.major_version != MAJOR_VERSION {
            return Err(RecoveryError::corrupt(format!(
                "unsupported sparse major version {}",
                header.major_version
            )));
        }
        if header.file_hdr_sz < SPARSE_HEADER_LEN {
            return Err(RecoveryError::corrupt(format!(
                "sparse header size {} too small",
                header.file_hdr_sz
            )));
        }
        if header.chunk_hdr_sz < CHUNK_HEADER_LEN {
            return Err(RecoveryError::corrupt(format!(
                "chunk header size {} too small",
                header.chunk_hdr_sz
            )));
        }
        if header.blk_sz == 0 || header.blk_sz % 4 != 0 {
            return Err(RecoveryError::corrupt(format!("invalid block size {}", header.blk_sz)));
        }

        skip_bytes(r, u64::from(header.file_hdr_sz - SPARSE_HEADER_LEN))?;
        Ok(header)
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(SPARSE_HEADER_MAGIC)?;
        w.write_u16::<LittleEndian>(self.major_version)?;
        w.write_u16::<LittleEndian>(self.minor_version)?;
        w.write_u16::<LittleEndian>(self.file_hdr_sz)?;
        w.write_u16::<LittleEndian>(self.chunk_hdr_sz)?;
        w.write_u32::<LittleEndian>(self.blk_sz)?;
        w.write_u32::<LittleEndian>(self.total_blks)?;
        w.write_u32::<LittleEndian>(self.total_chunks)?;
        w.write_u32::<LittleEndian>(self.image_checksum)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub chunk_sz: u32,
    pub total_sz: u32,
}

impl ChunkHeader {
    fn read_from(r: &mut impl Read, declared_len: u16, index: u32) -> Result<Self> {
        let mut raw = [0u8; CHUNK_HEADER_LEN as usize];
        read_exact_or_corrupt(r, &mut raw, &format!("chunk {index} header"))?;
        let mut c = io::Cursor::new(&raw[..]);
        let chunk_type = c.read_u16::<LittleEndian>()?;
        let _reserved = c.read_u16::<LittleEndian>()?;
        let chunk_sz = c.read_u32::<LittleEndian>()?;
        let total_sz = c.read_u32::<LittleEndian>()?;
        skip_bytes(r, u64::from(declared_len - CHUNK_HEADER_LEN))?;
        Ok(Self {
            chunk_type,
            chunk_sz,
            total_sz,
        })
    }

    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.chunk_type)?;
        w.write_u16::<LittleEndian>(0)?;
        w.write_u32::<LittleEndian>(self.chunk_sz)?;
        w.write_u32::<LittleEndian>(self.total_sz)
    }
}

/// Chunk stream encoder.
///
/// Writes must arrive at block-aligned, non-decreasing offsets. Forward gaps
/// become `DontCare` chunks. The header is not written by the encoder itself;
/// see [`SparseWriter::begin`] and [`SparseImageFile`].
pub struct SparseWriter<W: Write> {
    out: W,
    block_size: u32,
    image_len: u64,
    cursor: u64,
    chunks: u32,
    blocks: u32,
    crc: Hasher,
}

impl<W: Write> SparseWriter<W> {
    pub fn new(out: W, block_size: u32, image_len: u64) -> Result<Self> {
        if block_size == 0 || block_size % 4 != 0 {
            return Err(RecoveryError::InvalidArgument(format!(
                "block size {block_size} is not a non-zero multiple of 4"
            )));
        }
        Ok(Self {
            out,
            block_size,
            image_len,
            cursor: 0,
            chunks: 0,
            blocks: 0,
            crc: Hasher::new(),
        })
    }

    /// Write a placeholder header to `out`, then encode chunks after it.
    pub fn begin(mut out: W, block_size: u32, image_len: u64) -> Result<Self> {
        SparseHeader::new(block_size).write_to(&mut out)?;
        Self::new(out, block_size, image_len)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Write `data` at byte `offset` of the expanded image.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset < self.cursor {
            return Err(RecoveryError::NonMonotonicWrite {
                offset,
                cursor: self.cursor,
            });
        }
        if offset % u64::from(self.block_size) != 0 {
            return Err(RecoveryError::Misaligned {
                offset,
                block_size: self.block_size,
            });
        }
        let data_blocks = self.blocks_for(data.len() as u64)?;
        let gap_blocks = self.blocks_for(offset - self.cursor)?;
        self.check_block_budget(gap_blocks, data_blocks)?;

        if gap_blocks > 0 {
            self.emit_dont_care(gap_blocks)?;
        }
        if data_blocks > 0 {
            self.emit_raw(data, data_blocks)?;
        }
        Ok(())
    }

    /// Extend the image to `len` bytes with a trailing hole.
    pub fn pad(&mut self, len: u64) -> Result<()> {
        let target = round_up(len, u64::from(self.block_size));
        if self.cursor > target {
            return Err(RecoveryError::NonMonotonicWrite {
                offset: len,
                cursor: self.cursor,
            });
        }
        let gap_blocks = self.blocks_for(target - self.cursor)?;
        self.check_block_budget(gap_blocks, 0)?;
        if gap_blocks > 0 {
            self.emit_dont_care(gap_blocks)?;
        }
        Ok(())
    }

    /// Pad to the declared image length and return the output with the final header.
    pub fn finish(mut self) -> Result<(W, SparseHeader)> {
        if self.cursor < round_up(self.image_len, u64::from(self.block_size)) {
            self.pad(self.image_len)?;
        }
        self.out.flush()?;
        let declared = self.blocks_for(self.image_len)?;
        let header = SparseHeader {
            total_blks: declared.max(self.blocks),
            total_chunks: self.chunks,
            image_checksum: self.crc.clone().finalize(),
            ..SparseHeader::new(self.block_size)
        };
        Ok((self.out, header))
    }

    fn blocks_for(&self, len: u64) -> Result<u32> {
        let blocks = len.div_ceil(u64::from(self.block_size));
        u32::try_from(blocks)
            .map_err(|_| RecoveryError::InvalidArgument(format!("{len} bytes exceed sparse block range")))
    }

    fn check_block_budget(&self, gap: u32, data: u32) -> Result<()> {
        self.blocks
            .checked_add(gap)
            .and_then(|b| b.checked_add(data))
            .map(|_| ())
            .ok_or_else(|| RecoveryError::InvalidArgument("sparse image exceeds block range".into()))
    }

    fn emit_dont_care(&mut self, blocks: u32) -> Result<()> {
        ChunkHeader {
            chunk_type: CHUNK_TYPE_DONT_CARE,
            chunk_sz: blocks,
            total_sz: u32::from(CHUNK_HEADER_LEN),
        }
        .write_to(&mut self.out)?;

        let len = u64::from(blocks) * u64::from(self.block_size);
        fold_zeros(&mut self.crc, len);
        self.cursor += len;
        self.blocks += blocks;
        self.chunks += 1;
        Ok(())
    }

    fn emit_raw(&mut self, data: &[u8], blocks: u32) -> Result<()> {
        let len = u64::from(blocks) * u64::from(self.block_size);
        let total_sz = u32::try_from(len + u64::from(CHUNK_HEADER_LEN))
            .map_err(|_| RecoveryError::InvalidArgument("raw chunk larger than 4 GiB".into()))?;
        ChunkHeader {
            chunk_type: CHUNK_TYPE_RAW,
            chunk_sz: blocks,
            total_sz,
        }
        .write_to(&mut self.out)?;

        self.out.write_all(data)?;
        self.crc.update(data);
        let pad = len - data.len() as u64;
        write_zeros(&mut self.out, pad)?;
        fold_zeros(&mut self.crc, pad);

        self.cursor += len;
        self.blocks += blocks;
        self.chunks += 1;
        Ok(())
    }
}

impl<W: Write + Seek> SparseWriter<W> {
    /// Finish and rewrite the header at the start of `out`.
    pub fn close(self) -> Result<(W, SparseHeader)> {
        let (mut out, header) = self.finish()?;
        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(0))?;
        header.write_to(&mut out)?;
        out.seek(SeekFrom::Start(end))?;
        Ok((out, header))
    }
}

/// A sparse image file on disk, optionally with a gzip-compressed body.
pub struct SparseImageFile {
    path: PathBuf,
    writer: SparseWriter<ImageWriter>,
}

impl SparseImageFile {
    pub fn create(path: &Path, block_size: u32, image_len: u64, compress: bool) -> Result<Self> {
        let mut file = File::create(path)?;
        SparseHeader::new(block_size).write_to(&mut file)?;
        let body = ImageWriter::from_file(file, compress);
        Ok(Self {
            path: path.to_path_buf(),
            writer: SparseWriter::new(body, block_size, image_len)?,
        })
    }

    pub fn writer(&mut self) -> &mut SparseWriter<ImageWriter> {
        &mut self.writer
    }

    /// Finalize the chunk stream, then rewrite the clear-text header.
    pub fn close(self) -> Result<SparseHeader> {
        let (body, header) = self.writer.finish()?;
        let mut file = body.finish()?;
        file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut file)?;
        file.sync_all()?;
        log::debug!(
            "{}: {} chunks, {} blocks, crc {:08x}",
            self.path.display(),
            header.total_chunks,
            header.total_blks,
            header.image_checksum
        );
        Ok(header)
    }
}

/// Outcome of decoding a sparse image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseRestoreReport {
    pub header: SparseHeader,
    pub blocks_written: u32,
    pub checksum: u32,
    /// Length of the expanded image, holes included.
    pub bytes_covered: u64,
}

impl SparseRestoreReport {
    pub fn block_count_matches(&self) -> bool {
        self.blocks_written == self.header.total_blks
    }

    pub fn checksum_matches(&self) -> bool {
        self.checksum == self.header.image_checksum
    }

    /// Post-hoc integrity mismatches, as human-readable lines.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.block_count_matches() {
            out.push(format!(
                "Wrote {} blocks, expected to write {} blocks",
                self.blocks_written, self.header.total_blks
            ));
        }
        if !self.checksum_matches() {
            out.push(format!(
                "Computed CRC32 of 0x{:08x}, expected 0x{:08x}",
                self.checksum, self.header.image_checksum
            ));
        }
        out
    }
}

/// Decode a chunk stream whose header has already been read.
///
/// Holes are skipped by seeking `out` forward; nothing is written there.
pub fn decode_chunks<R: Read, W: Write + Seek>(
    input: &mut R,
    header: &SparseHeader,
    out: &mut W,
    reporter: &Reporter<'_>,
) -> Result<SparseRestoreReport> {
    let blk = u64::from(header.blk_sz);
    let mut crc = Hasher::new();
    let mut blocks_written: u32 = 0;
    let mut covered: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];

    for index in 0..header.total_chunks {
        let chunk = ChunkHeader::read_from(input, header.chunk_hdr_sz, index)?;
        let len = u64::from(chunk.chunk_sz) * blk;

        match chunk.chunk_type {
            CHUNK_TYPE_RAW => {
                if u64::from(chunk.total_sz) != u64::from(header.chunk_hdr_sz) + len {
                    return Err(RecoveryError::corrupt(format!(
                        "raw chunk {index}: total size {} does not match {} blocks",
                        chunk.total_sz, chunk.chunk_sz
                    )));
                }
                let mut remaining = len;
                while remaining > 0 {
                    let n = remaining.min(buf.len() as u64) as usize;
                    read_exact_or_corrupt(input, &mut buf[..n], &format!("raw chunk {index}"))?;
                    out.write_all(&buf[..n])?;
                    crc.update(&buf[..n]);
                    remaining -= n as u64;
                }
            }
            CHUNK_TYPE_DONT_CARE => {
                if u64::from(chunk.total_sz) != u64::from(header.chunk_hdr_sz) {
                    return Err(RecoveryError::corrupt(format!(
                        "don't-care chunk {index}: unexpected total size {}",
                        chunk.total_sz
                    )));
                }
                let skip = i64::try_from(len)
                    .map_err(|_| RecoveryError::corrupt(format!("don't-care chunk {index} too large")))?;
                out.seek(SeekFrom::Current(skip))?;
                fold_zeros(&mut crc, len);
            }
            other => {
                return Err(RecoveryError::corrupt(format!(
                    "unknown chunk type 0x{other:04x} in chunk {index}"
                )));
            }
        }

        blocks_written = blocks_written.wrapping_add(chunk.chunk_sz);
        covered += len;
        reporter.progress(fraction(u64::from(index) + 1, u64::from(header.total_chunks)));
    }
    out.flush()?;

    Ok(SparseRestoreReport {
        header: *header,
        blocks_written,
        checksum: crc.finalize(),
        bytes_covered: covered,
    })
}

/// Decode a sparse image file (plain or with gzip body) onto `out`.
pub fn restore_file<W: Write + Seek>(
    path: &Path,
    out: &mut W,
    reporter: &Reporter<'_>,
) -> Result<SparseRestoreReport> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut raw = BufReader::with_capacity(CHUNK_SIZE, CountingReader::new(file));
    let header = SparseHeader::read_from(&mut raw)?;
    let mut body = ImageReader::from_buffered(raw, file_len)?;
    decode_chunks(&mut body, &header, out, reporter)
}

fn round_up(len: u64, block: u64) -> u64 {
    len.div_ceil(block) * block
}

fn fold_zeros(crc: &mut Hasher, mut len: u64) {
    let zeros = [0u8; 4096];
    while len > 0 {
        let n = len.min(zeros.len() as u64) as usize;
        crc.update(&zeros[..n]);
        len -= n as u64;
    }
}

fn write_zeros(w: &mut impl Write, mut len: u64) -> io::Result<()> {
    let zeros = [0u8; 4096];
    while len > 0 {
        let n = len.min(zeros.len() as u64) as usize;
        w.write_all(&zeros[..n])?;
        len -= n as u64;
    }
    Ok(())
}

fn skip_bytes(r: &mut impl Read, len: u64) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let copied = io::copy(&mut r.by_ref().take(len), &mut io::sink())?;
    if copied != len {
        return Err(RecoveryError::corrupt("truncated sparse header padding"));
    }
    Ok(())
}

fn read_exact_or_corrupt(r: &mut impl Read, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            RecoveryError::corrupt(format!("unexpected end of image in {what}"))
        } else {
            RecoveryError::Io(e)
        }
    })
}
