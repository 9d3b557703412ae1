//! Contains the logic for writing the cached image to a device.
//!
//! A write goes through these states:
//!
//! ```text
//! Idle -> Unmounting -> Opened -> Writing -> Done | Failed
//!      -> Closing -> SettledUnmount -> Success | Failure
//! ```
//!
//! Once the device is open, `Closing` and `SettledUnmount` run whatever
//! happened while writing: the device is closed, the writer waits for the
//! kernel to re-read the new partition table, and any volumes it auto-mounted
//! are unmounted again. The first failure decides the result.
use crate::context::ProvisionSettings;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform;
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::services::DiskUnmounter;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterState {
    Idle,
    Unmounting,
    Opened,
    Writing,
    Done,
    Failed,
    Closing,
    SettledUnmount,
    Success,
    Failure,
}

fn transition(state: &mut WriterState, next: WriterState) {
    debug!("Device writer: {:?} -> {:?}", state, next);
    *state = next;
}

/// An opened write target.
///
/// Implemented for the device [`File`]; anything else is a stand-in for tests.
pub(crate) trait Target: Read + Write + Seek {
    /// The probed size in bytes, if it can be determined.
    fn size(&self) -> Option<u64>;

    fn sync(&mut self) -> io::Result<()>;
}

impl Target for File {
    fn size(&self) -> Option<u64> {
        match platform::device_size(self) {
            Ok(size) if size > 0 => Some(size),
            Ok(_) => None,
            Err(e) => {
                debug!("Device size unavailable ({e})");
                None
            }
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// The outcome of a successful write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteSummary {
    pub device: PathBuf,
    pub bytes_written: u64,
    /// The capacity the image was checked against.
    pub capacity: u64,
    pub verified: bool,
}

impl fmt::Display for WriteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Wrote {} bytes to {}",
            self.bytes_written,
            self.device.display()
        )?;
        if self.verified {
            write!(f, " (verified)")?;
        }
        Ok(())
    }
}

/// Writes images to raw block devices.
pub struct DeviceWriter<'a> {
    unmounter: &'a dyn DiskUnmounter,
    settle_delay: Duration,
    declared_capacity: u64,
    progress_interval: Duration,
    verify: bool,
}

impl<'a> DeviceWriter<'a> {
    pub fn new(unmounter: &'a dyn DiskUnmounter, settings: &ProvisionSettings) -> Self {
        Self {
            unmounter,
            settle_delay: settings.settle_delay,
            declared_capacity: settings.declared_capacity,
            progress_interval: settings.progress_interval,
            verify: settings.verify,
        }
    }

    /// Writes `image` to `device` from offset zero.
    ///
    /// The device is unmounted first and opened with `O_SYNC`. Write progress
    /// goes to `on_write`; if verification is enabled the device is read back
    /// and hashed with progress going to `on_verify`.
    ///
    /// A failure to unmount or open the device stops immediately. After that,
    /// the device is always closed and unmounted again after the settle delay.
    /// If that final unmount fails after the write already failed, it is
    /// logged and the write error is returned.
    pub fn write(
        &self,
        image: &Path,
        device: &Device,
        on_write: &mut dyn ProgressReporter,
        on_verify: &mut dyn ProgressReporter,
    ) -> Result<WriteSummary> {
        let path = device.path.as_path();
        let mut state = WriterState::Idle;

        transition(&mut state, WriterState::Unmounting);
        self.unmount(path)?;

        let device_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.to_path_buf(),
                source,
            })?;
        transition(&mut state, WriterState::Opened);

        self.write_opened(image, path, device_file, state, on_write, on_verify)
    }

    /// Everything after the device is open. `target` is closed before the
    /// settle delay and the final unmount, whether the write succeeded or not.
    fn write_opened<T: Target>(
        &self,
        image: &Path,
        path: &Path,
        mut target: T,
        mut state: WriterState,
        on_write: &mut dyn ProgressReporter,
        on_verify: &mut dyn ProgressReporter,
    ) -> Result<WriteSummary> {
        transition(&mut state, WriterState::Writing);
        let result = self.write_and_verify(image, path, &mut target, on_write, on_verify);
        transition(
            &mut state,
            if result.is_ok() {
                WriterState::Done
            } else {
                WriterState::Failed
            },
        );

        transition(&mut state, WriterState::Closing);
        drop(target);
        thread::sleep(self.settle_delay);

        transition(&mut state, WriterState::SettledUnmount);
        let cleanup = self.unmount(path);

        let result = match (result, cleanup) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!("Ignoring cleanup failure after failed write: {cleanup}");
                Err(e)
            }
        };
        transition(
            &mut state,
            if result.is_ok() {
                WriterState::Success
            } else {
                WriterState::Failure
            },
        );

        if let Ok(summary) = &result {
            info!("{summary}");
        }
        result
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        self.unmounter
            .unmount_disk(path)
            .map_err(|source| Error::Unmount {
                path: path.to_path_buf(),
                source,
            })
    }

    /// The size the image must fit in: the probed device size, or the
    /// declared capacity when the target cannot be probed.
    fn capacity(&self, target: &impl Target) -> u64 {
        target.size().unwrap_or_else(|| {
            debug!("Using declared capacity of {} bytes", self.declared_capacity);
            self.declared_capacity
        })
    }

    fn write_and_verify(
        &self,
        image: &Path,
        device_path: &Path,
        device_file: &mut impl Target,
        on_write: &mut dyn ProgressReporter,
        on_verify: &mut dyn ProgressReporter,
    ) -> Result<WriteSummary> {
        let read_error = |source| Error::ImageRead {
            path: image.to_path_buf(),
            source,
        };
        let write_error = |source| Error::Write {
            path: device_path.to_path_buf(),
            source,
        };

        let mut image_file = File::open(image).map_err(read_error)?;
        let image_len = image_file.metadata().map_err(read_error)?.len();
        let capacity = self.capacity(&*device_file);

        let mut tracker = ProgressTracker::start(on_write, image_len, self.progress_interval);
        if image_len > capacity {
            return Err(Error::ImageTooLarge {
                path: device_path.to_path_buf(),
                image_len,
                capacity,
            });
        }

        info!(
            "Writing {} ({image_len} bytes) to {}",
            image.display(),
            device_path.display()
        );
        device_file.seek(SeekFrom::Start(0)).map_err(write_error)?;

        let mut buffer = vec![0u8; BUFFER_SIZE];
        while tracker.position() < image_len {
            let remaining = image_len - tracker.position();
            let to_read = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
            image_file
                .read_exact(&mut buffer[..to_read])
                .map_err(read_error)?;
            device_file
                .write_all(&buffer[..to_read])
                .map_err(write_error)?;
            tracker.advance(to_read as u64);
        }
        device_file.flush().map_err(write_error)?;
        device_file.sync().map_err(write_error)?;
        tracker.complete();

        if self.verify {
            self.verify(image, device_path, device_file, image_len, on_verify)?;
        }

        Ok(WriteSummary {
            device: device_path.to_path_buf(),
            bytes_written: image_len,
            capacity,
            verified: self.verify,
        })
    }

    /// Reads back the first `image_len` bytes of the device and compares
    /// their hash with the image.
    fn verify(
        &self,
        image: &Path,
        device_path: &Path,
        device_file: &mut impl Target,
        image_len: u64,
        on_verify: &mut dyn ProgressReporter,
    ) -> Result<()> {
        let image_error = |source| Error::ImageRead {
            path: image.to_path_buf(),
            source,
        };
        let device_error = |source| Error::DeviceRead {
            path: device_path.to_path_buf(),
            source,
        };

        let mut image_file = File::open(image).map_err(image_error)?;
        device_file
            .seek(SeekFrom::Start(0))
            .map_err(device_error)?;

        let mut tracker = ProgressTracker::start(on_verify, image_len, self.progress_interval);

        let mut image_hasher = Sha256::new();
        let mut device_hasher = Sha256::new();
        let mut image_buf = vec![0u8; BUFFER_SIZE];
        let mut device_buf = vec![0u8; BUFFER_SIZE];

        let mut remaining = image_len;
        while remaining > 0 {
            let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
            image_file
                .read_exact(&mut image_buf[..chunk])
                .map_err(image_error)?;
            device_file
                .read_exact(&mut device_buf[..chunk])
                .map_err(device_error)?;

            image_hasher.update(&image_buf[..chunk]);
            device_hasher.update(&device_buf[..chunk]);

            remaining -= chunk as u64;
            tracker.advance(chunk as u64);
        }

        if image_hasher.finalize() != device_hasher.finalize() {
            return Err(Error::Verification(device_path.to_path_buf()));
        }
        tracker.complete();
        Ok(())
    }
}
