//! Error types shared by every provisioning stage.
//!
//! Each stage fails fast with one of these variants and the orchestrator
//! forwards it untouched, so the variant a caller sees names the stage that
//! broke.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The cached image could not be opened for configuration.
    #[error("config write: image file inaccessible")]
    ImageAccess(#[source] io::Error),
    /// The image has no readable partition table, or the requested
    /// partition is not in it.
    #[error("config write: image attach failed")]
    Attach(#[source] io::Error),
    /// The partition exists but does not hold a FAT filesystem.
    #[error("config write: partition mount failed")]
    Mount(#[source] io::Error),
    #[error("config write: failed to write {path}")]
    ConfigWrite {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("config write: failed to write network profile {path}")]
    ProfileWrite {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("The selected drive {} was not found", .0.display())]
    DiskNotFound(PathBuf),
    #[error("Failed to unmount {}", .path.display())]
    Unmount {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    /// The cached image could not be read while writing it out.
    #[error("Failed to read image {}", .path.display())]
    ImageRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open {} for writing", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write image to {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Image is {image_len} bytes but {} only holds {capacity} bytes", .path.display())]
    ImageTooLarge {
        path: PathBuf,
        image_len: u64,
        capacity: u64,
    },
    /// The device could not be read back for verification.
    #[error("Failed to read back {}", .path.display())]
    DeviceRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Verification failed: hash mismatch on {}", .0.display())]
    Verification(PathBuf),

    #[error("Image download failed")]
    Download(#[source] io::Error),
    #[error("Image catalog request failed")]
    Catalog(#[source] anyhow::Error),
    #[error("Device configuration request failed")]
    ConfigService(#[source] anyhow::Error),
    #[error("Failed to list block devices")]
    Enumerate(#[source] anyhow::Error),

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}
