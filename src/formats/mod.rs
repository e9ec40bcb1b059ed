pub mod raw;
pub mod sparse;
pub mod yaffs2;

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;

use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::RecoveryError;

pub(crate) const CHUNK_SIZE: usize = 256 * 1024; // 256 KB I/O buffer

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// How a volume is captured into an image file.
///
/// Variant order is the detection tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackupMethod {
    Ext4Image,
    Ext4SparseImage,
    RawDump,
    SequentialLogImage,
}

impl BackupMethod {
    pub const ALL: [BackupMethod; 4] = [
        BackupMethod::Ext4Image,
        BackupMethod::Ext4SparseImage,
        BackupMethod::RawDump,
        BackupMethod::SequentialLogImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMethod::Ext4Image => "ext4 image",
            BackupMethod::Ext4SparseImage => "ext4 sparse image",
            BackupMethod::RawDump => "raw dump",
            BackupMethod::SequentialLogImage => "yaffs2 image",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            BackupMethod::Ext4Image => "ximg",
            BackupMethod::Ext4SparseImage => "simg",
            BackupMethod::RawDump => "img",
            BackupMethod::SequentialLogImage => "yimg",
        }
    }

    pub fn compressed_extension(&self) -> &'static str {
        match self {
            BackupMethod::Ext4Image => "ximg.gz",
            BackupMethod::Ext4SparseImage => "szimg",
            BackupMethod::RawDump => "img.gz",
            BackupMethod::SequentialLogImage => "yimg.gz",
        }
    }

    pub fn file_extension(&self, compress: bool) -> &'static str {
        if compress {
            self.compressed_extension()
        } else {
            self.extension()
        }
    }

    /// Short token used on the command line.
    pub fn token(&self) -> &'static str {
        match self {
            BackupMethod::Ext4Image => "ext4",
            BackupMethod::Ext4SparseImage => "sparse",
            BackupMethod::RawDump => "raw",
            BackupMethod::SequentialLogImage => "yaffs2",
        }
    }
}

impl fmt::Display for BackupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMethod {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupMethod::ALL
            .into_iter()
            .find(|m| m.token() == s || m.as_str() == s)
            .ok_or_else(|| RecoveryError::InvalidArgument(format!("unknown backup method: {s}")))
    }
}

/// Number of bytes consumed from the underlying (possibly compressed) source.
pub trait StreamPosition {
    fn consumed(&self) -> u64;
}

impl<T: AsRef<[u8]>> StreamPosition for io::Cursor<T> {
    fn consumed(&self) -> u64 {
        self.position()
    }
}

/// Counts bytes pulled from the inner reader.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

type RawSource = BufReader<CountingReader<File>>;

enum Source {
    Plain(RawSource),
    Gzip(MultiGzDecoder<RawSource>),
}

/// Image file reader that transparently inflates gzip-wrapped content.
pub struct ImageReader {
    source: Source,
    file_len: u64,
}

impl ImageReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Self::from_buffered(BufReader::with_capacity(CHUNK_SIZE, CountingReader::new(file)), file_len)
    }

    /// Sniff for gzip at the reader's current position.
    pub(crate) fn from_buffered(mut raw: RawSource, file_len: u64) -> io::Result<Self> {
        let compressed = raw.fill_buf()?.starts_with(&GZIP_MAGIC);
        let source = if compressed {
            Source::Gzip(MultiGzDecoder::new(raw))
        } else {
            Source::Plain(raw)
        };
        Ok(Self { source, file_len })
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.source, Source::Gzip(_))
    }

    /// Size of the file on disk, compressed or not.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }
}

impl Read for ImageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            Source::Plain(r) => r.read(buf),
            Source::Gzip(r) => r.read(buf),
        }
    }
}

impl StreamPosition for ImageReader {
    fn consumed(&self) -> u64 {
        match &self.source {
            Source::Plain(r) => r.get_ref().count() - r.buffer().len() as u64,
            Source::Gzip(r) => r.get_ref().get_ref().count(),
        }
    }
}

/// Image file writer, optionally gzip-compressed.
pub enum ImageWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl ImageWriter {
    pub fn create(path: &Path, compress: bool) -> io::Result<Self> {
        Ok(Self::from_file(File::create(path)?, compress))
    }

    /// Continue writing at the file's current position.
    pub fn from_file(file: File, compress: bool) -> Self {
        let out = BufWriter::with_capacity(CHUNK_SIZE, file);
        if compress {
            ImageWriter::Gzip(GzEncoder::new(out, Compression::default()))
        } else {
            ImageWriter::Plain(out)
        }
    }

    /// Finish the gzip stream if any and hand back the underlying file.
    pub fn finish(self) -> io::Result<File> {
        let out = match self {
            ImageWriter::Plain(w) => w,
            ImageWriter::Gzip(gz) => gz.finish()?,
        };
        out.into_inner().map_err(|e| e.into_error())
    }
}

impl Write for ImageWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ImageWriter::Plain(w) => w.write(buf),
            ImageWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ImageWriter::Plain(w) => w.flush(),
            ImageWriter::Gzip(w) => w.flush(),
        }
    }
}

/// Open a block device or image for in-place writing from offset 0.
pub(crate) fn open_target_for_writing(path: &Path) -> io::Result<File> {
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

/// Local progress fraction for `done` out of `total`.
pub(crate) fn fraction(done: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (done as f64 / total as f64).min(1.0) as f32
    }
}
