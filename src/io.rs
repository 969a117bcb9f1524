//! Backing files for the log image: capacity policy, the three
//! durability modes, growth, truncation, and dirty-range flushing.
//!
//! The in-memory buffer is always the source of truth; the backing only
//! receives copies of changed byte ranges. In the mmap modes the copy
//! into the mapped region is the flush hint and the OS paces writeback;
//! in the blocking mode every commit writes and fsyncs the `.kvc` file,
//! and full rewrites go through a `.tmp` file and an atomic rename.

use crate::errinput;
use crate::error::Result;

use fs4::fs_std::FileExt as _;
use memmap2::MmapMut;
use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::ops::Range;
use std::path::{Path, PathBuf};

pub(crate) const PAGE_SIZE: usize = 4096;

/// Capacity doubles until it exceeds this, then grows linearly by it.
pub(crate) const DOUBLE_LIMIT: usize =
    if 2 * PAGE_SIZE > 16 << 10 { 2 * PAGE_SIZE } else { 16 << 10 };

/// Shrink the backing file when at least this much capacity sits unused
/// beyond the data end.
pub(crate) const TRUNCATE_THRESHOLD: usize =
    if 4 * PAGE_SIZE > 32 << 10 { 4 * PAGE_SIZE } else { 32 << 10 };

/// Payloads must stay below 256 MiB; the header packs the size in 28 bits.
pub(crate) const DATA_SIZE_LIMIT: usize = 1 << 28;

/// The size of the on-disk header: a packed size word and the checksum.
pub(crate) const DATA_START: usize = 12;

/// How the log image is kept durable. Fixed at open time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// A single memory-mapped image (`.kva`); the OS paces writeback.
    NonSync,
    /// Two memory-mapped images (`.kva` and `.kvb`) written in lockstep;
    /// a corrupt one is repaired from the other on open.
    DualFile,
    /// A plain file (`.kvc`) written and fsynced on every mutation; full
    /// rewrites go through `.tmp` and an atomic rename.
    SyncBlocking,
}

/// Computes the next buffer capacity able to hold `required` bytes.
pub(crate) fn new_capacity(current: usize, required: usize) -> Result<usize> {
    if required >= DATA_SIZE_LIMIT {
        return errinput!("data size {required} exceeds the 256 MiB limit");
    }
    let mut capacity = current.max(PAGE_SIZE);
    while capacity < required {
        if capacity <= DOUBLE_LIMIT {
            capacity *= 2;
        } else {
            capacity += DOUBLE_LIMIT;
        }
    }
    Ok(capacity)
}

fn round_page(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// One memory-mapped image file.
struct MapFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl MapFile {
    /// Opens and maps the file, extending it to at least one page. Takes
    /// an exclusive lock held until the store is closed. Returns the file
    /// together with its original byte content.
    fn open(path: PathBuf) -> Result<(Self, Vec<u8>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()?;
        let len = file.metadata()?.len() as usize;
        if len < PAGE_SIZE {
            file.set_len(PAGE_SIZE as u64)?;
        }
        // The file is exclusively locked, so nothing else truncates the
        // mapping out from under us.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let image = map[..len.min(map.len())].to_vec();
        Ok((Self { path, file, map }, image))
    }

    fn capacity(&self) -> usize {
        self.map.len()
    }

    fn resize(&mut self, capacity: usize) -> Result<()> {
        self.file.set_len(capacity as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    fn write(&mut self, image: &[u8], range: Range<usize>) {
        // If a growth remap failed the map may trail the buffer; write
        // what fits and let the next successful remap catch up.
        let end = range.end.min(self.map.len());
        if range.start < end {
            self.map[range.start..end].copy_from_slice(&image[range.start..end]);
        }
    }
}

/// The durable home of the log image.
pub(crate) enum Backing {
    Mmap { a: MapFile, b: Option<MapFile> },
    Blocking { path: PathBuf, tmp: PathBuf, file: File },
    /// No backing; used by the transient rewrite engine before adoption.
    Memory,
}

/// A freshly opened backing plus the images found on disk, in the order
/// they should be tried by recovery.
pub(crate) struct Opened {
    pub backing: Backing,
    pub image_a: Vec<u8>,
    pub image_b: Option<Vec<u8>>,
}

impl Backing {
    pub fn open(dir: &Path, name: &str, mode: Mode) -> Result<Opened> {
        fs::create_dir_all(dir)?;
        match mode {
            Mode::NonSync => {
                let (a, image_a) = MapFile::open(dir.join(format!("{name}.kva")))?;
                Ok(Opened { backing: Backing::Mmap { a, b: None }, image_a, image_b: None })
            }
            Mode::DualFile => {
                let (a, image_a) = MapFile::open(dir.join(format!("{name}.kva")))?;
                let (b, image_b) = MapFile::open(dir.join(format!("{name}.kvb")))?;
                Ok(Opened {
                    backing: Backing::Mmap { a, b: Some(b) },
                    image_a,
                    image_b: Some(image_b),
                })
            }
            Mode::SyncBlocking => {
                let path = dir.join(format!("{name}.kvc"));
                let tmp = dir.join(format!("{name}.tmp"));
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                file.try_lock_exclusive()?;
                let mut image_a = Vec::new();
                file.read_to_end(&mut image_a)?;
                let image_b = fs::read(&tmp).ok();
                Ok(Opened { backing: Backing::Blocking { path, tmp, file }, image_a, image_b })
            }
        }
    }

    /// Writes the header and the dirty range to the backing. The payload
    /// range goes first so the header's checksum never vouches for bytes
    /// that have not landed.
    pub fn commit(&mut self, image: &[u8], dirty: Range<usize>) -> Result<()> {
        match self {
            Backing::Mmap { a, b } => {
                a.write(image, dirty.clone());
                a.write(image, 0..DATA_START);
                if let Some(b) = b {
                    b.write(image, dirty);
                    b.write(image, 0..DATA_START);
                }
                Ok(())
            }
            Backing::Blocking { file, .. } => {
                file.seek(SeekFrom::Start(dirty.start as u64))?;
                file.write_all(&image[dirty])?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&image[..DATA_START])?;
                file.sync_data()?;
                Ok(())
            }
            Backing::Memory => Ok(()),
        }
    }

    /// Grows the backing to hold `capacity` bytes.
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        if let Backing::Mmap { a, b } = self {
            let capacity = round_page(capacity);
            if a.capacity() < capacity {
                a.resize(capacity)?;
            }
            if let Some(b) = b {
                if b.capacity() < capacity {
                    b.resize(capacity)?;
                }
            }
        }
        Ok(())
    }

    /// Replaces the full on-disk image with `image[..data_end]`, durably.
    pub fn rewrite(&mut self, image: &[u8], data_end: usize) -> Result<()> {
        match self {
            Backing::Mmap { a, b } => {
                for map in std::iter::once(&mut *a).chain(b.as_mut()) {
                    if map.capacity() < data_end {
                        map.resize(round_page(data_end))?;
                    }
                    map.write(image, 0..data_end);
                    map.map.flush()?;
                }
                Ok(())
            }
            Backing::Blocking { path, tmp, file } => {
                let mut tmp_file = File::create(&*tmp)?;
                tmp_file.write_all(&image[..data_end])?;
                tmp_file.sync_all()?;
                fs::rename(&*tmp, &*path)?;
                // The rename replaced the locked inode; reacquire on the
                // new one.
                let new_file = OpenOptions::new().read(true).write(true).open(&*path)?;
                new_file.try_lock_exclusive()?;
                *file = new_file;
                Ok(())
            }
            Backing::Memory => Ok(()),
        }
    }

    /// Shrinks the backing after garbage collection freed capacity.
    pub fn truncate(&mut self, capacity: usize, image: &[u8], data_end: usize) -> Result<()> {
        match self {
            Backing::Mmap { a, b } => {
                for map in std::iter::once(&mut *a).chain(b.as_mut()) {
                    if map.capacity() > capacity {
                        map.resize(capacity)?;
                    }
                }
                Ok(())
            }
            Backing::Blocking { .. } => self.rewrite(image, data_end),
            Backing::Memory => Ok(()),
        }
    }

    /// Blocks until the current image is durable.
    pub fn sync(&mut self) -> Result<()> {
        match self {
            Backing::Mmap { a, b } => {
                a.map.flush()?;
                if let Some(b) = b {
                    b.map.flush()?;
                }
                Ok(())
            }
            Backing::Blocking { file, .. } => Ok(file.sync_all()?),
            Backing::Memory => Ok(()),
        }
    }

    /// The paths of the image files, for logging.
    pub fn describe(&self) -> String {
        match self {
            Backing::Mmap { a, .. } => a.path.display().to_string(),
            Backing::Blocking { path, .. } => path.display().to_string(),
            Backing::Memory => "<memory>".to_string(),
        }
    }
}
