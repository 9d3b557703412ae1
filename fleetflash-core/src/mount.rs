//! Mounting a FAT partition inside a disk image without host mount privileges.
//!
//! Access goes through three nested handles, each released when it goes out
//! of scope:
//!
//! 1.  [`ImageFile`]: the image opened read-write.
//! 2.  [`AttachedDisk`]: the image with its partition table parsed.
//! 3.  [`MountedPartition`]: a FAT filesystem on one partition.
//!
//! Rust drops them innermost first, so a partition is always unmounted before
//! its disk is detached and the disk before the file is closed, on both the
//! success and the error path. [`with_partition`] wraps the whole sequence.
use crate::error::{Error, Result};
use fatfs::{FileSystem, FsOptions};
use gptman::GPT;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const SECTOR_SIZE: u64 = 512;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_TYPE_PROTECTIVE: u8 = 0xEE;

/// Which partition of an image to mount. Numbering starts at 1, matching
/// `/dev/sdX1`. The partition must hold a FAT filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionSpec {
    pub number: u32,
}

impl Default for PartitionSpec {
    /// The boot partition, which carries the device configuration.
    fn default() -> Self {
        Self { number: 1 }
    }
}

/// A partition's byte range within the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

/// Read/write/seek access restricted to one partition of the image.
///
/// Offsets are relative to the partition start; reads and writes are clipped
/// at its end and seeking before its start is an error.
#[derive(Debug)]
pub struct PartitionView<'a> {
    file: &'a mut File,
    start: u64,
    len: u64,
}

impl<'a> PartitionView<'a> {
    pub fn new(file: &'a mut File, start: u64, len: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(start))?;
        Ok(Self { file, start, len })
    }

    fn remaining(&mut self) -> io::Result<usize> {
        let position = self.file.stream_position()?;
        let end = self.start + self.len;
        let remaining = end.saturating_sub(position);
        Ok(usize::try_from(remaining).unwrap_or(usize::MAX))
    }
}

impl Read for PartitionView<'_> {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining()?;
        if buf.len() > remaining {
            buf = &mut buf[..remaining];
        }
        self.file.read(buf)
    }
}

impl Write for PartitionView<'_> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let remaining = self.remaining()?;
        if buf.len() > remaining {
            buf = &buf[..remaining];
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for PartitionView<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let relative = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => {
                let current = self.file.stream_position()? - self.start;
                current.checked_add_signed(delta)
            }
        };
        let relative = relative.ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, "seek before start of partition")
        })?;

        self.file.seek(SeekFrom::Start(self.start + relative))?;
        Ok(relative)
    }
}

/// The outermost handle: the image file opened read-write.
#[derive(Debug)]
pub struct ImageFile {
    file: File,
    path: PathBuf,
}

impl ImageFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::ImageAccess)?;
        debug!("Opened image {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Reads the partition table and presents the image as a disk.
    pub fn attach(&mut self) -> Result<AttachedDisk<'_>> {
        let partitions = read_partition_table(&mut self.file).map_err(Error::Attach)?;
        debug!(
            "Attached {} with {} partition(s)",
            self.path.display(),
            partitions.len()
        );
        Ok(AttachedDisk {
            file: &mut self.file,
            partitions,
        })
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_all() {
            warn!("Failed to sync {}: {}", self.path.display(), e);
        }
        debug!("Closed image {}", self.path.display());
    }
}

/// An image whose partition table has been read.
#[derive(Debug)]
pub struct AttachedDisk<'a> {
    file: &'a mut File,
    partitions: Vec<PartitionEntry>,
}

impl AttachedDisk<'_> {
    pub fn partitions(&self) -> &[PartitionEntry] {
        &self.partitions
    }

    /// Mounts the FAT filesystem on the partition named by `spec`.
    pub fn mount(&mut self, spec: PartitionSpec) -> Result<MountedPartition<'_>> {
        let entry = self
            .partitions
            .iter()
            .find(|p| p.number == spec.number)
            .copied()
            .ok_or_else(|| {
                Error::Mount(io::Error::new(
                    ErrorKind::NotFound,
                    format!("partition {} not found", spec.number),
                ))
            })?;

        let view = PartitionView::new(&mut *self.file, entry.offset, entry.len)
            .map_err(Error::Mount)?;
        let fs = FileSystem::new(view, FsOptions::new()).map_err(Error::Mount)?;
        debug!("Mounted partition {} ({} bytes)", entry.number, entry.len);
        Ok(MountedPartition {
            fs: Some(fs),
            number: entry.number,
        })
    }
}

impl Drop for AttachedDisk<'_> {
    fn drop(&mut self) {
        debug!("Detached disk");
    }
}

/// A mounted FAT filesystem. Paths are `/`-separated and relative to the
/// partition root.
pub struct MountedPartition<'a> {
    // Only `None` after an explicit unmount.
    fs: Option<FileSystem<PartitionView<'a>>>,
    number: u32,
}

impl<'a> MountedPartition<'a> {
    fn fs(&self) -> io::Result<&FileSystem<PartitionView<'a>>> {
        self.fs
            .as_ref()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "partition is unmounted"))
    }

    /// Writes `contents` to `path`, creating parent directories and replacing
    /// any existing file.
    pub fn write_file(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        let fs = self.fs()?;
        let path = path.trim_start_matches('/');

        let (parents, name) = path.rsplit_once('/').unwrap_or(("", path));

        let mut dir = fs.root_dir();
        for component in parents.split('/').filter(|c| !c.is_empty()) {
            dir = dir.create_dir(component)?;
        }

        let mut file = dir.create_file(name)?;
        file.write_all(contents)?;
        // `create_file` opens an existing file without truncating it.
        file.truncate()?;
        file.flush()
    }

    pub fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let fs = self.fs()?;
        let mut file = fs.root_dir().open_file(path.trim_start_matches('/'))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(contents)
    }

    pub fn exists(&self, path: &str) -> io::Result<bool> {
        let fs = self.fs()?;
        match fs.root_dir().open_file(path.trim_start_matches('/')) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Flushes the filesystem and reports any error, which a plain drop
    /// can only log.
    pub fn unmount(mut self) -> io::Result<()> {
        match self.fs.take() {
            Some(fs) => {
                fs.unmount()?;
                debug!("Unmounted partition {}", self.number);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for MountedPartition<'_> {
    fn drop(&mut self) {
        if let Some(fs) = self.fs.take() {
            match fs.unmount() {
                Ok(()) => debug!("Unmounted partition {}", self.number),
                Err(e) => warn!("Failed to unmount partition {}: {}", self.number, e),
            }
        }
    }
}

/// Opens `image`, mounts partition `spec` and runs `f` against it.
///
/// All three handles are released before returning, whether `f` succeeds or
/// not. If `f` succeeds the unmount is checked and a failure to flush the
/// filesystem is returned as [`Error::Mount`].
pub fn with_partition<T>(
    image: &Path,
    spec: PartitionSpec,
    f: impl FnOnce(&MountedPartition<'_>) -> Result<T>,
) -> Result<T> {
    let mut image = ImageFile::open(image)?;
    let mut disk = image.attach()?;
    let partition = disk.mount(spec)?;

    let value = f(&partition)?;
    partition.unmount().map_err(Error::Mount)?;
    Ok(value)
}

fn read_partition_table(file: &mut File) -> io::Result<Vec<PartitionEntry>> {
    let mut mbr = [0u8; SECTOR_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut mbr)?;

    if mbr[510..512] != MBR_SIGNATURE {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "no partition table signature",
        ));
    }

    let entries: Vec<&[u8]> = (0..4)
        .map(|i| {
            let at = MBR_TABLE_OFFSET + i * MBR_ENTRY_SIZE;
            &mbr[at..at + MBR_ENTRY_SIZE]
        })
        .collect();

    if entries.iter().any(|e| e[4] == MBR_TYPE_PROTECTIVE) {
        return read_gpt(file);
    }

    let partitions = entries
        .iter()
        .zip(1..)
        .filter(|(entry, _)| entry[4] != 0)
        .map(|(entry, number)| {
            let start_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
            let sectors = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]);
            PartitionEntry {
                number,
                offset: u64::from(start_lba) * SECTOR_SIZE,
                len: u64::from(sectors) * SECTOR_SIZE,
            }
        })
        .collect();
    Ok(partitions)
}

fn read_gpt(file: &mut File) -> io::Result<Vec<PartitionEntry>> {
    let gpt = GPT::find_from(file).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let sector_size = gpt.sector_size;

    gpt.iter()
        .filter(|(_, entry)| entry.is_used())
        .map(|(number, entry)| {
            let sectors = entry
                .ending_lba
                .checked_sub(entry.starting_lba)
                .and_then(|n| n.checked_add(1));
            let offset = entry.starting_lba.checked_mul(sector_size);
            let len = sectors.and_then(|n| n.checked_mul(sector_size));
            match (offset, len) {
                (Some(offset), Some(len)) => Ok(PartitionEntry {
                    number,
                    offset,
                    len,
                }),
                _ => Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("partition {number} has an invalid LBA range"),
                )),
            }
        })
        .collect()
}
