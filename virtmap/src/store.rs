//! Append-only record stores.
//!
//! A store is a collection of numbered files in one directory, all sharing a filename
//! prefix. Records are framed as a `u32` length followed by the payload and are never
//! mutated in place; a write returns a [`DiskLocation`] that stays valid for the life
//! of the store. Files rotate once they exceed `max_file_size`, so the limit is soft:
//! the record that crosses it still lands in the old file.
//!
//! Every file starts with an 8-byte magic header. Besides catching foreign files on
//! recovery, this guarantees no record ever sits at offset 0, which is what lets the
//! all-zero location double as the "absent" sentinel in the indices.

use anyhow::{bail, ensure, Context, Result};
use parking_lot::RwLock;
use std::{
    fmt,
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

const FILE_MAGIC: [u8; 8] = *b"vmapsto1";
const FILE_HEADER_SIZE: u64 = 8;
const LENGTH_PREFIX_SIZE: u64 = 4;
const MAX_RECORD_PAYLOAD_SIZE: u32 = 1 << 30;

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// An opaque handle to a record inside a [`RecordStore`]: a file id packed with the
/// byte offset of the record within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskLocation(u64);

impl DiskLocation {
    /// The "no record" sentinel.
    pub const NULL: DiskLocation = DiskLocation(0);

    fn new(file_id: u32, offset: u64) -> Self {
        debug_assert!(offset <= OFFSET_MASK);
        DiskLocation(((file_id as u64) << OFFSET_BITS) | offset)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    fn file_id(&self) -> u32 {
        (self.0 >> OFFSET_BITS) as u32
    }

    fn offset(&self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

impl fmt::Display for DiskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "{}:{}", self.file_id(), self.offset())
        }
    }
}

struct OpenFile {
    file: File,
    len: u64,
}

struct Files {
    files: Vec<OpenFile>,
}

/// An append-only store of length-framed records.
pub struct RecordStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u64,
    inner: RwLock<Files>,
}

impl RecordStore {
    /// Open the store rooted at `dir`, recovering any existing files with the given
    /// prefix, or creating the first file if none exist.
    pub fn open(dir: &Path, prefix: &str, max_file_size: u64) -> Result<Self> {
        ensure!(
            max_file_size > FILE_HEADER_SIZE,
            "max file size too small: {}",
            max_file_size
        );
        // A record starting past the offset field would alias another location.
        ensure!(
            max_file_size <= OFFSET_MASK,
            "max file size exceeds the addressable offset range: {}",
            max_file_size
        );
        let store = RecordStore {
            dir: dir.to_owned(),
            prefix: prefix.to_owned(),
            max_file_size,
            inner: RwLock::new(Files { files: Vec::new() }),
        };
        let mut recovered = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading {:?}", dir))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = parse_file_id(name.to_str().unwrap_or(""), prefix) else {
                continue;
            };
            recovered.push(id);
        }
        recovered.sort_unstable();
        let mut files = store.inner.write();
        if recovered.is_empty() {
            files.files.push(store.create_file(0)?);
        } else {
            for (expected, id) in recovered.iter().copied().enumerate() {
                ensure!(
                    id as usize == expected,
                    "store {:?}/{} is missing file {}",
                    dir,
                    prefix,
                    expected
                );
                files.files.push(store.open_file(id)?);
            }
            tracing::debug!(
                dir = ?dir,
                prefix,
                file_count = files.files.len(),
                "recovered record store"
            );
        }
        drop(files);
        Ok(store)
    }

    /// Append a record and return its location.
    pub fn write(&self, payload: &[u8]) -> Result<DiskLocation> {
        ensure!(
            payload.len() <= MAX_RECORD_PAYLOAD_SIZE as usize,
            "record payload too large: {}",
            payload.len()
        );
        let mut inner = self.inner.write();
        let mut file_id = (inner.files.len() - 1) as u32;
        let frame_len = LENGTH_PREFIX_SIZE + payload.len() as u64;
        if inner.files[file_id as usize].len + frame_len > self.max_file_size
            && inner.files[file_id as usize].len > FILE_HEADER_SIZE
        {
            file_id += 1;
            let fresh = self.create_file(file_id)?;
            inner.files.push(fresh);
        }
        let open = &mut inner.files[file_id as usize];
        let offset = open.len;
        open.file
            .write_all_at(&(payload.len() as u32).to_le_bytes(), offset)?;
        open.file.write_all_at(payload, offset + LENGTH_PREFIX_SIZE)?;
        open.len += frame_len;
        Ok(DiskLocation::new(file_id, offset))
    }

    /// Read the record at the given location. Returns `None` if the location does not
    /// resolve to a well-framed record; callers treat that as corruption unless the
    /// location is independently known to be stale.
    pub fn read(&self, location: DiskLocation) -> Result<Option<Vec<u8>>> {
        if location.is_null() {
            return Ok(None);
        }
        let inner = self.inner.read();
        let Some(open) = inner.files.get(location.file_id() as usize) else {
            return Ok(None);
        };
        let offset = location.offset();
        if offset < FILE_HEADER_SIZE || offset + LENGTH_PREFIX_SIZE > open.len {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        open.file.read_exact_at(&mut len_bytes, offset)?;
        let payload_len = u32::from_le_bytes(len_bytes);
        if payload_len > MAX_RECORD_PAYLOAD_SIZE
            || offset + LENGTH_PREFIX_SIZE + payload_len as u64 > open.len
        {
            return Ok(None);
        }
        let mut payload = vec![0u8; payload_len as usize];
        open.file
            .read_exact_at(&mut payload, offset + LENGTH_PREFIX_SIZE)?;
        Ok(Some(payload))
    }

    /// The number of files currently in the store.
    pub fn file_count(&self) -> usize {
        self.inner.read().files.len()
    }

    fn file_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", self.prefix, id))
    }

    fn create_file(&self, id: u32) -> Result<OpenFile> {
        let path = self.file_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("creating {:?}", path))?;
        file.write_all_at(&FILE_MAGIC, 0)?;
        Ok(OpenFile {
            file,
            len: FILE_HEADER_SIZE,
        })
    }

    fn open_file(&self, id: u32) -> Result<OpenFile> {
        let path = self.file_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {:?}", path))?;
        let len = file.metadata()?.len();
        let mut magic = [0u8; 8];
        if len < FILE_HEADER_SIZE {
            bail!("store file {:?} is truncated", path);
        }
        file.read_exact_at(&mut magic, 0)?;
        ensure!(magic == FILE_MAGIC, "store file {:?} has a bad header", path);
        Ok(OpenFile { file, len })
    }
}

fn parse_file_id(name: &str, prefix: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('.')?;
    rest.parse().ok()
}
