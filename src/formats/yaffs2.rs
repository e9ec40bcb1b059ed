//! yaffs2 directory-tree images.
//!
//! An image is a flat run of units, each a 2048-byte chunk followed by a
//! 64-byte spare area holding the packed tags. A unit whose tag byte count
//! is [`HEADER_BYTE_COUNT`] carries an object header; file data follows its
//! header as consecutive data units. Object 1 is the root directory.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::lutimes;
use nix::sys::time::{TimeVal, TimeValLike};

use super::{fraction, StreamPosition};
use crate::error::{RecoveryError, Result};
use crate::progress::Reporter;

pub const CHUNK_DATA_SIZE: usize = 2048;
pub const SPARE_SIZE: usize = 64;
pub const UNIT_SIZE: usize = CHUNK_DATA_SIZE + SPARE_SIZE;

pub const ROOT_OBJECT_ID: u32 = 1;
const FIRST_USER_OBJECT_ID: u32 = 257;

/// Tag byte count marking an object header unit.
pub const HEADER_BYTE_COUNT: u32 = 0xFFFF;
const HEADER_CHUNK_FLAG: u32 = 0x8000_0000;
const SEQUENCE_NUMBER: u32 = 0x1000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_ALIAS_LEN: usize = 159;

const PROGRESS_INTERVAL: u64 = 20;

// Object header field offsets within the chunk payload.
const OH_TYPE: usize = 0;
const OH_PARENT: usize = 4;
const OH_SUM: usize = 8;
const OH_NAME: usize = 10;
const OH_NAME_LEN: usize = MAX_NAME_LEN + 1;
const OH_MODE: usize = 268;
const OH_UID: usize = 272;
const OH_GID: usize = 276;
const OH_ATIME: usize = 280;
const OH_MTIME: usize = 284;
const OH_CTIME: usize = 288;
const OH_FILE_SIZE: usize = 292;
const OH_EQUIVALENT: usize = 296;
const OH_ALIAS: usize = 300;
const OH_ALIAS_LEN: usize = MAX_ALIAS_LEN + 1;
const OH_RDEV: usize = 460;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Unknown,
    File,
    Symlink,
    Directory,
    HardLink,
    Special,
}

impl ObjectType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => ObjectType::File,
            2 => ObjectType::Symlink,
            3 => ObjectType::Directory,
            4 => ObjectType::HardLink,
            5 => ObjectType::Special,
            _ => ObjectType::Unknown,
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            ObjectType::Unknown => 0,
            ObjectType::File => 1,
            ObjectType::Symlink => 2,
            ObjectType::Directory => 3,
            ObjectType::HardLink => 4,
            ObjectType::Special => 5,
        }
    }
}

fn get_u32(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_cstr(buf: &[u8], off: usize, len: usize) -> Option<Vec<u8>> {
    let field = buf.get(off..off + len)?;
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    Some(field[..end].to_vec())
}

fn put_cstr(buf: &mut [u8], off: usize, len: usize, s: &[u8]) {
    let field = &mut buf[off..off + len];
    field.fill(0);
    field[..s.len()].copy_from_slice(s);
}

/// Packed tags from a unit's spare area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tags {
    pub sequence: u32,
    pub object_id: u32,
    pub chunk_id: u32,
    pub byte_count: u32,
}

impl Tags {
    pub fn parse(spare: &[u8]) -> Option<Self> {
        Some(Self {
            sequence: get_u32(spare, 0)?,
            object_id: get_u32(spare, 4)?,
            chunk_id: get_u32(spare, 8)?,
            byte_count: get_u32(spare, 12)?,
        })
    }

    pub fn header(object_id: u32, parent_id: u32) -> Self {
        Self {
            sequence: SEQUENCE_NUMBER,
            object_id,
            chunk_id: HEADER_CHUNK_FLAG | parent_id,
            byte_count: HEADER_BYTE_COUNT,
        }
    }

    pub fn data(object_id: u32, chunk_id: u32, byte_count: u32) -> Self {
        Self {
            sequence: SEQUENCE_NUMBER,
            object_id,
            chunk_id,
            byte_count,
        }
    }

    pub fn is_header(&self) -> bool {
        self.byte_count == HEADER_BYTE_COUNT
    }

    fn write_spare(&self, spare: &mut [u8]) {
        spare.fill(0xFF);
        put_u32(spare, 0, self.sequence);
        put_u32(spare, 4, self.object_id);
        put_u32(spare, 8, self.chunk_id);
        put_u32(spare, 12, self.byte_count);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub obj_type: ObjectType,
    pub parent_id: u32,
    pub name: Vec<u8>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub file_size: u32,
    pub equivalent_id: u32,
    pub alias: Vec<u8>,
    pub rdev: u32,
}

impl ObjectHeader {
    /// Decode the fixed little-endian layout. `None` if `payload` is too short.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        Some(Self {
            obj_type: ObjectType::from_u32(get_u32(payload, OH_TYPE)?),
            parent_id: get_u32(payload, OH_PARENT)?,
            name: get_cstr(payload, OH_NAME, OH_NAME_LEN)?,
            mode: get_u32(payload, OH_MODE)?,
            uid: get_u32(payload, OH_UID)?,
            gid: get_u32(payload, OH_GID)?,
            atime: get_u32(payload, OH_ATIME)?,
            mtime: get_u32(payload, OH_MTIME)?,
            ctime: get_u32(payload, OH_CTIME)?,
            file_size: get_u32(payload, OH_FILE_SIZE)?,
            equivalent_id: get_u32(payload, OH_EQUIVALENT)?,
            alias: get_cstr(payload, OH_ALIAS, OH_ALIAS_LEN)?,
            rdev: get_u32(payload, OH_RDEV)?,
        })
    }

    pub fn encode(&self) -> Result<[u8; CHUNK_DATA_SIZE]> {
        if self.name.len() > MAX_NAME_LEN {
            return Err(RecoveryError::InvalidArgument(format!(
                "name longer than {MAX_NAME_LEN} bytes: {}",
                String::from_utf8_lossy(&self.name)
            )));
        }
        if self.alias.len() > MAX_ALIAS_LEN {
            return Err(RecoveryError::InvalidArgument(format!(
                "symlink target longer than {MAX_ALIAS_LEN} bytes: {}",
                String::from_utf8_lossy(&self.alias)
            )));
        }
        let mut buf = [0xFFu8; CHUNK_DATA_SIZE];
        put_u32(&mut buf, OH_TYPE, self.obj_type.as_u32());
        put_u32(&mut buf, OH_PARENT, self.parent_id);
        buf[OH_SUM..OH_SUM + 2].copy_from_slice(&0xFFFFu16.to_le_bytes());
        put_cstr(&mut buf, OH_NAME, OH_NAME_LEN, &self.name);
        buf[OH_NAME + OH_NAME_LEN..OH_MODE].fill(0xFF);
        put_u32(&mut buf, OH_MODE, self.mode);
        put_u32(&mut buf, OH_UID, self.uid);
        put_u32(&mut buf, OH_GID, self.gid);
        put_u32(&mut buf, OH_ATIME, self.atime);
        put_u32(&mut buf, OH_MTIME, self.mtime);
        put_u32(&mut buf, OH_CTIME, self.ctime);
        put_u32(&mut buf, OH_FILE_SIZE, self.file_size);
        put_u32(&mut buf, OH_EQUIVALENT, self.equivalent_id);
        put_cstr(&mut buf, OH_ALIAS, OH_ALIAS_LEN, &self.alias);
        put_u32(&mut buf, OH_RDEV, self.rdev);
        Ok(buf)
    }
}

/// Decode the header unit at `index` of `buf`, if it is one.
pub fn header_unit_at(buf: &[u8], index: usize) -> Option<(Tags, ObjectHeader)> {
    let start = index * UNIT_SIZE;
    let unit = buf.get(start..start + UNIT_SIZE)?;
    let tags = Tags::parse(&unit[CHUNK_DATA_SIZE..])?;
    if !tags.is_header() {
        return None;
    }
    Some((tags, ObjectHeader::parse(&unit[..CHUNK_DATA_SIZE])?))
}

// ============================================================================
// Decode
// ============================================================================

/// Counts of objects materialized by a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub hard_links: u64,
    pub skipped: u64,
}

struct DeferredDir {
    path: PathBuf,
    header: ObjectHeader,
}

struct TreeRestorer<'a, 'r> {
    paths: HashMap<u32, PathBuf>,
    dirs: Vec<DeferredDir>,
    unit: Vec<u8>,
    units_read: u64,
    total_len: u64,
    summary: RestoreSummary,
    reporter: &'a Reporter<'r>,
}

/// Replay a yaffs2 unit stream into `dest`, which must already exist.
///
/// Nothing is rolled back on error; whatever was created stays on disk.
pub fn restore_tree<R: Read + StreamPosition>(
    input: &mut R,
    total_len: u64,
    dest: &Path,
    reporter: &Reporter<'_>,
) -> Result<RestoreSummary> {
    if !dest.is_dir() {
        return Err(RecoveryError::InvalidArgument(format!(
            "restore destination {} is not a directory",
            dest.display()
        )));
    }
    let mut restorer = TreeRestorer {
        paths: HashMap::from([(ROOT_OBJECT_ID, dest.to_path_buf())]),
        dirs: Vec::new(),
        unit: vec![0u8; UNIT_SIZE],
        units_read: 0,
        total_len,
        summary: RestoreSummary::default(),
        reporter,
    };
    restorer.run(input)?;
    Ok(restorer.summary)
}

impl TreeRestorer<'_, '_> {
    fn run<R: Read + StreamPosition>(&mut self, input: &mut R) -> Result<()> {
        while self.read_unit(input)? {
            let tags = self.tags()?;
            if !tags.is_header() {
                return Err(RecoveryError::corrupt(format!(
                    "unit {}: data chunk for object {} outside of a file",
                    self.units_read - 1,
                    tags.object_id
                )));
            }
            let header = ObjectHeader::parse(&self.unit[..CHUNK_DATA_SIZE])
                .ok_or_else(|| RecoveryError::corrupt("short object header"))?;
            self.process(input, tags.object_id, header)?;
        }

        // deepest first so restoring a child does not disturb its parent's times
        while let Some(dir) = self.dirs.pop() {
            self.apply_attributes(&dir.path, &dir.header);
        }
        self.reporter.progress(1.0);
        Ok(())
    }

    /// Read one unit. `false` at a clean end of stream.
    fn read_unit<R: Read + StreamPosition>(&mut self, input: &mut R) -> Result<bool> {
        let mut filled = 0;
        while filled < UNIT_SIZE {
            match input.read(&mut self.unit[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(false);
        }
        if filled < UNIT_SIZE {
            return Err(RecoveryError::corrupt(format!(
                "short read of {filled} bytes at unit {}",
                self.units_read
            )));
        }
        self.units_read += 1;
        if self.units_read % PROGRESS_INTERVAL == 0 {
            self.reporter.progress(fraction(input.consumed(), self.total_len));
        }
        Ok(true)
    }

    fn tags(&self) -> Result<Tags> {
        Tags::parse(&self.unit[CHUNK_DATA_SIZE..]).ok_or_else(|| RecoveryError::corrupt("short tags"))
    }

    fn process<R: Read + StreamPosition>(&mut self, input: &mut R, id: u32, header: ObjectHeader) -> Result<()> {
        if id == ROOT_OBJECT_ID {
            if let Some(root) = self.paths.get(&ROOT_OBJECT_ID) {
                self.dirs.push(DeferredDir {
                    path: root.clone(),
                    header,
                });
            }
            return Ok(());
        }

        let name = OsStr::from_bytes(&header.name);
        if header.name.is_empty() || header.name.contains(&b'/') || name == "." || name == ".." {
            return Err(RecoveryError::corrupt(format!(
                "object {id}: invalid name {:?}",
                name
            )));
        }
        let parent = self.paths.get(&header.parent_id).ok_or_else(|| {
            RecoveryError::corrupt(format!("object {id}: unknown parent {}", header.parent_id))
        })?;
        let path = parent.join(name);
        self.paths.insert(id, path.clone());

        match header.obj_type {
            ObjectType::File => {
                self.restore_file(input, id, &path, header.file_size)?;
                self.summary.files += 1;
            }
            ObjectType::Directory => {
                ensure_directory(&path)?;
                self.summary.directories += 1;
                self.dirs.push(DeferredDir { path, header });
                return Ok(());
            }
            ObjectType::Symlink => {
                remove_existing(&path)?;
                std::os::unix::fs::symlink(OsStr::from_bytes(&header.alias), &path)
                    .map_err(|e| io_at(e, &path))?;
                self.summary.symlinks += 1;
            }
            ObjectType::HardLink => {
                let target = self.paths.get(&header.equivalent_id).ok_or_else(|| {
                    RecoveryError::corrupt(format!(
                        "object {id}: hard link to unknown object {}",
                        header.equivalent_id
                    ))
                })?;
                remove_existing(&path)?;
                fs::hard_link(target, &path).map_err(|e| io_at(e, &path))?;
                self.summary.hard_links += 1;
            }
            ObjectType::Special | ObjectType::Unknown => {
                log::debug!("skipping special object {}", path.display());
                self.summary.skipped += 1;
                return Ok(());
            }
        }
        self.apply_attributes(&path, &header);
        Ok(())
    }

    fn restore_file<R: Read + StreamPosition>(&mut self, input: &mut R, id: u32, path: &Path, size: u32) -> Result<()> {
        remove_existing(path)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| io_at(e, path))?;
        let mut out = BufWriter::new(file);
        let mut remaining = u64::from(size);
        while remaining > 0 {
            if !self.read_unit(input)? {
                return Err(RecoveryError::corrupt(format!(
                    "{}: end of image with {remaining} bytes of data missing",
                    path.display()
                )));
            }
            let tags = self.tags()?;
            if tags.is_header() || tags.object_id != id {
                return Err(RecoveryError::corrupt(format!(
                    "{}: expected data chunk for object {id}, found object {}",
                    path.display(),
                    tags.object_id
                )));
            }
            let valid = tags.byte_count as usize;
            if valid == 0 || valid > CHUNK_DATA_SIZE {
                return Err(RecoveryError::corrupt(format!(
                    "{}: invalid data byte count {valid}",
                    path.display()
                )));
            }
            let n = remaining.min(valid as u64) as usize;
            out.write_all(&self.unit[..n])?;
            remaining -= n as u64;
        }
        out.flush()?;
        Ok(())
    }

    fn apply_attributes(&self, path: &Path, header: &ObjectHeader) {
        if let Err(e) = std::os::unix::fs::lchown(path, Some(header.uid), Some(header.gid)) {
            self.reporter.warn(format!("chown {}: {e}", path.display()));
        }
        if header.obj_type != ObjectType::Symlink {
            let perms = fs::Permissions::from_mode(header.mode & 0o7777);
            if let Err(e) = fs::set_permissions(path, perms) {
                self.reporter.warn(format!("chmod {}: {e}", path.display()));
            }
        }
        if let Err(e) = set_times(path, header.atime, header.mtime) {
            self.reporter.warn(format!("utime {}: {e}", path.display()));
        }
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path).map_err(|e| io_at(e, path)),
        _ => Ok(()),
    }
}

/// Make `path` a real directory. A symlink or file in the way is replaced.
fn ensure_directory(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => fs::remove_file(path).map_err(|e| io_at(e, path))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_at(e, path)),
    }
    fs::create_dir(path).map_err(|e| io_at(e, path))
}

fn io_at(e: io::Error, path: &Path) -> RecoveryError {
    RecoveryError::Io(io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

/// Set access and modification times without following symlinks.
fn set_times(path: &Path, atime: u32, mtime: u32) -> io::Result<()> {
    lutimes(
        path,
        &TimeVal::seconds(i64::from(atime)),
        &TimeVal::seconds(i64::from(mtime)),
    )
    .map_err(io::Error::from)
}

// ============================================================================
// Encode
// ============================================================================

/// Running counters for an encode, reported as object-count progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeProgress {
    pub total_objects: u64,
    pub processed_objects: u64,
    pub units_written: u64,
    pub data_bytes: u64,
}

struct TreeEncoder<'a, 'r, W: Write> {
    out: W,
    next_id: u32,
    inodes: HashMap<(u64, u64), u32>,
    exclude: Option<PathBuf>,
    progress: EncodeProgress,
    reporter: &'a Reporter<'r>,
}

/// Encode the tree under `src` as a yaffs2 unit stream.
///
/// `exclude` names a path to leave out, the output file or the folder holding it.
pub fn encode_tree<W: Write>(
    src: &Path,
    out: W,
    exclude: Option<&Path>,
    reporter: &Reporter<'_>,
) -> Result<(W, EncodeProgress)> {
    let meta = fs::symlink_metadata(src).map_err(|e| io_at(e, src))?;
    if !meta.is_dir() {
        return Err(RecoveryError::InvalidArgument(format!(
            "{} is not a directory",
            src.display()
        )));
    }
    let mut encoder = TreeEncoder {
        out,
        next_id: FIRST_USER_OBJECT_ID,
        inodes: HashMap::new(),
        exclude: exclude.map(Path::to_path_buf),
        progress: EncodeProgress {
            total_objects: count_entries(src, exclude)?,
            ..EncodeProgress::default()
        },
        reporter,
    };

    let root = header_from_metadata(ObjectType::Directory, ROOT_OBJECT_ID, Vec::new(), &meta);
    encoder.emit_header(ROOT_OBJECT_ID, &root)?;
    encoder.walk(src, ROOT_OBJECT_ID)?;
    encoder.out.flush()?;
    reporter.progress(1.0);
    Ok((encoder.out, encoder.progress))
}

fn count_entries(dir: &Path, exclude: Option<&Path>) -> Result<u64> {
    let mut count = 0;
    for entry in fs::read_dir(dir).map_err(|e| io_at(e, dir))? {
        let entry = entry?;
        let path = entry.path();
        if Some(path.as_path()) == exclude {
            continue;
        }
        count += 1;
        if entry.file_type()?.is_dir() {
            count += count_entries(&path, exclude)?;
        }
    }
    Ok(count)
}

fn header_from_metadata(obj_type: ObjectType, parent_id: u32, name: Vec<u8>, meta: &fs::Metadata) -> ObjectHeader {
    ObjectHeader {
        obj_type,
        parent_id,
        name,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        atime: meta.atime() as u32,
        mtime: meta.mtime() as u32,
        ctime: meta.ctime() as u32,
        file_size: 0,
        equivalent_id: 0,
        alias: Vec::new(),
        rdev: meta.rdev() as u32,
    }
}

impl<W: Write> TreeEncoder<'_, '_, W> {
    fn walk(&mut self, dir: &Path, parent_id: u32) -> Result<()> {
        let mut entries = fs::read_dir(dir)
            .map_err(|e| io_at(e, dir))?
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            if self.exclude.as_deref() == Some(path.as_path()) {
                continue;
            }
            let meta = fs::symlink_metadata(&path).map_err(|e| io_at(e, &path))?;
            let name = entry.file_name().as_bytes().to_vec();
            let id = self.allocate_id()?;
            let ft = meta.file_type();

            if !ft.is_dir() && meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(&first) = self.inodes.get(&key) {
                    let mut header = header_from_metadata(ObjectType::HardLink, parent_id, name, &meta);
                    header.equivalent_id = first;
                    self.emit_header(id, &header)?;
                    self.object_done();
                    continue;
                }
                self.inodes.insert(key, id);
            }

            if ft.is_dir() {
                let header = header_from_metadata(ObjectType::Directory, parent_id, name, &meta);
                self.emit_header(id, &header)?;
                self.object_done();
                self.walk(&path, id)?;
            } else if ft.is_file() {
                let size = u32::try_from(meta.len()).map_err(|_| {
                    RecoveryError::InvalidArgument(format!(
                        "{} is too large for a yaffs2 image",
                        path.display()
                    ))
                })?;
                let mut header = header_from_metadata(ObjectType::File, parent_id, name, &meta);
                header.file_size = size;
                self.emit_header(id, &header)?;
                self.emit_file_data(id, &path, size)?;
                self.object_done();
            } else if ft.is_symlink() {
                let target = fs::read_link(&path).map_err(|e| io_at(e, &path))?;
                let mut header = header_from_metadata(ObjectType::Symlink, parent_id, name, &meta);
                header.alias = target.as_os_str().as_bytes().to_vec();
                self.emit_header(id, &header)?;
                self.object_done();
            } else {
                let header = header_from_metadata(ObjectType::Special, parent_id, name, &meta);
                self.emit_header(id, &header)?;
                self.object_done();
            }
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> Result<u32> {
        let id = self.next_id;
        self.next_id = id
            .checked_add(1)
            .filter(|&n| n & HEADER_CHUNK_FLAG == 0)
            .ok_or_else(|| RecoveryError::InvalidArgument("too many objects for a yaffs2 image".into()))?;
        Ok(id)
    }

    fn object_done(&mut self) {
        self.progress.processed_objects += 1;
        if self.progress.processed_objects % PROGRESS_INTERVAL == 0 {
            self.reporter.progress(fraction(
                self.progress.processed_objects,
                self.progress.total_objects,
            ));
        }
    }

    fn emit_header(&mut self, id: u32, header: &ObjectHeader) -> Result<()> {
        let payload = header.encode()?;
        self.emit_unit(&payload, Tags::header(id, header.parent_id))
    }

    fn emit_file_data(&mut self, id: u32, path: &Path, size: u32) -> Result<()> {
        let mut file = File::open(path).map_err(|e| io_at(e, path))?.take(u64::from(size));
        let mut remaining = u64::from(size);
        let mut chunk_id: u32 = 1;
        let mut payload = [0xFFu8; CHUNK_DATA_SIZE];

        while remaining > 0 {
            let want = remaining.min(CHUNK_DATA_SIZE as u64) as usize;
            payload.fill(0xFF);
            file.read_exact(&mut payload[..want]).map_err(|e| io_at(e, path))?;
            self.emit_unit(&payload, Tags::data(id, chunk_id, want as u32))?;
            self.progress.data_bytes += want as u64;
            remaining -= want as u64;
            chunk_id += 1;
        }
        Ok(())
    }

    fn emit_unit(&mut self, payload: &[u8; CHUNK_DATA_SIZE], tags: Tags) -> Result<()> {
        let mut spare = [0u8; SPARE_SIZE];
        tags.write_spare(&mut spare);
        self.out.write_all(payload)?;
        self.out.write_all(&spare)?;
        self.progress.units_written += 1;
        Ok(())
    }
}
