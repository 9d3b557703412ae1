use crate::device::Device;
use crate::services::{DiskEnumerator, DiskUnmounter};
use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use nix::ioctl_read;
use nix::mount::{MntFlags, umount2};
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to flag the system drive.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Whether `partition` (e.g. `/dev/sdb1`, `/dev/mmcblk0p2`) lives on `disk`.
fn is_partition_of(partition: &Path, disk: &Path) -> bool {
    partition == disk || get_parent_device_path(partition) == disk
}

/// Mounted volumes as (device, mount point) pairs.
fn mounted_volumes() -> Vec<(PathBuf, PathBuf)> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .map(|disk| {
            (
                PathBuf::from("/dev/").join(disk.name()),
                disk.mount_point().to_path_buf(),
            )
        })
        .collect()
}

/// Scans for all block devices on a Linux system.
///
/// Devices are discovered by iterating through `/sys/block`. Loop devices and
/// devices reporting a size of zero (such as empty card readers) are skipped.
/// The device holding `/` is kept but flagged as [`Device::system`].
pub fn list_block_devices() -> Result<Vec<Device>> {
    let volumes = mounted_volumes();
    let system_disk_parent = volumes
        .iter()
        .find(|(_, mount_point)| mount_point == Path::new("/"))
        .map(|(device, _)| get_parent_device_path(device));

    let mut devices = Vec::new();
    let block_dir = fs::read_dir("/sys/block").context("Failed to read /sys/block")?;

    for entry in block_dir.filter_map(Result::ok) {
        let device_name = entry.file_name().to_string_lossy().to_string();
        let device_path = PathBuf::from("/dev/").join(&device_name);

        if device_name.starts_with("loop") {
            continue;
        }

        let size_sectors = read_sys_file(&device_name, "size")
            .and_then(|s| {
                s.parse::<u64>()
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
            })
            .unwrap_or(0);

        if size_sectors == 0 {
            continue;
        }

        let removable = read_sys_file(&device_name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        let size_gb = (size_sectors * 512) as f64 / (1024.0 * 1024.0 * 1024.0);

        let mount_point = volumes
            .iter()
            .find(|(device, mount_point)| {
                is_partition_of(device, &device_path) && !mount_point.as_os_str().is_empty()
            })
            .map(|(_, mount_point)| mount_point.to_string_lossy().to_string())
            .unwrap_or_default();

        devices.push(Device {
            system: system_disk_parent.as_deref() == Some(device_path.as_path()),
            path: device_path,
            name: device_name,
            size_gb,
            removable,
            mount_point,
        });
    }

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}

/// Unmounts every mounted volume on `disk`. Succeeds if nothing is mounted.
pub fn unmount_disk(disk: &Path) -> Result<()> {
    for (device, mount_point) in mounted_volumes() {
        if !is_partition_of(&device, disk) {
            continue;
        }
        info!(
            "Unmounting {} from {}",
            device.display(),
            mount_point.display()
        );
        umount2(&mount_point, MntFlags::empty())
            .with_context(|| format!("Failed to unmount {}", mount_point.display()))?;
    }
    debug!("No volumes of {} remain mounted", disk.display());
    Ok(())
}

/// The size in bytes of the block device behind `file`.
///
/// Fails for anything that is not a block device.
pub fn device_size(file: &File) -> Result<u64> {
    if !file.metadata()?.file_type().is_block_device() {
        return Err(anyhow!("not a block device"));
    }

    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes)?;
    }
    Ok(size_bytes)
}

/// The host's disks, as seen through `/sys/block` and the mount table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDisks;

impl DiskEnumerator for SystemDisks {
    fn list(&self) -> Result<Vec<Device>> {
        list_block_devices()
    }
}

impl DiskUnmounter for SystemDisks {
    fn unmount_disk(&self, path: &Path) -> Result<()> {
        unmount_disk(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_device_paths() {
        assert_eq!(
            get_parent_device_path(Path::new("/dev/sdb1")),
            PathBuf::from("/dev/sdb")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/mmcblk0p2")),
            PathBuf::from("/dev/mmcblk0")
        );
        assert_eq!(
            get_parent_device_path(Path::new("/dev/nvme0n1p1")),
            PathBuf::from("/dev/nvme0n1")
        );
    }

    #[test]
    fn partitions_belong_to_their_disk_only() {
        assert!(is_partition_of(Path::new("/dev/sdb1"), Path::new("/dev/sdb")));
        assert!(is_partition_of(Path::new("/dev/sdb"), Path::new("/dev/sdb")));
        assert!(!is_partition_of(Path::new("/dev/sdb1"), Path::new("/dev/sda")));
        assert!(!is_partition_of(Path::new("/dev/sdab1"), Path::new("/dev/sda")));
        assert!(is_partition_of(
            Path::new("/dev/mmcblk0p1"),
            Path::new("/dev/mmcblk0")
        ));
    }

    #[test]
    fn regular_files_have_no_device_size() {
        let file = tempfile::tempfile().unwrap();
        assert!(device_size(&file).is_err());
    }
}
