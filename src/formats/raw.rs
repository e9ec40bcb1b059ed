use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use super::{fraction, open_target_for_writing, ImageReader, ImageWriter, StreamPosition, CHUNK_SIZE};
use crate::error::Result;
use crate::progress::Reporter;

/// Copy `size` bytes of `device` into a (possibly compressed) image file.
///
/// Returns the number of bytes copied. A device shorter than `size` ends the
/// copy early.
pub fn dump(device: &Path, size: u64, output: &Path, compress: bool, reporter: &Reporter<'_>) -> Result<u64> {
    let mut input = File::open(device)?.take(size);
    let mut out = ImageWriter::create(output, compress)?;
    let copied = copy_with_progress(&mut input, &mut out, |done| fraction(done, size), reporter)?;
    out.finish()?.sync_all()?;
    Ok(copied)
}

/// Write an image file (plain or gzip) byte for byte onto `device`.
pub fn restore(image: &Path, device: &Path, reporter: &Reporter<'_>) -> Result<u64> {
    let mut input = ImageReader::open(image)?;
    let mut out = open_target_for_writing(device)?;
    let total = input.file_len();
    let mut written = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
        reporter.progress(fraction(input.consumed(), total));
    }
    out.sync_all()?;
    Ok(written)
}

fn copy_with_progress(
    input: &mut impl Read,
    out: &mut impl Write,
    progress: impl Fn(u64) -> f32,
    reporter: &Reporter<'_>,
) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        done += n as u64;
        reporter.progress(progress(done));
    }
    out.flush()?;
    Ok(done)
}
