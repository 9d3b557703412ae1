use std::fmt;
use std::path::PathBuf;

/// A block device reported by a [`crate::services::DiskEnumerator`].
///
/// Only `path` takes part in validation; the other fields are metadata for
/// display. A `Device` returned by [`crate::validate::validate_disk`] is the
/// write target for the rest of the run.
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda").
    pub name: String,
    /// The total size of the device in gigabytes (GB).
    pub size_gb: f64,
    /// Whether the kernel flags the device as removable media.
    pub removable: bool,
    /// Whether the device holds the running system's root filesystem.
    pub system: bool,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl Device {
    /// A descriptor carrying nothing but a path, for callers that build
    /// device lists by hand.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path,
            name,
            size_gb: 0.0,
            removable: false,
            system: false,
            mount_point: String::new(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };
        let kind = if self.system {
            " [SYSTEM]"
        } else if self.removable {
            " [removable]"
        } else {
            ""
        };

        write!(
            f,
            "{:<15} {:.1} GB {}{}",
            self.path.display(),
            self.size_gb,
            mount_info,
            kind
        )
    }
}
