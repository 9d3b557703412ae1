//! Confirms the write target is a real, currently attached block device.
use crate::device::Device;
use crate::error::{Error, Result};
use crate::services::DiskEnumerator;
use log::debug;
use std::path::Path;

/// Looks `path` up in the live device list.
///
/// The match is on the exact device path; nothing about size, filesystem or
/// removability is checked here.
pub fn validate_disk(disks: &dyn DiskEnumerator, path: &Path) -> Result<Device> {
    let devices = disks.list().map_err(Error::Enumerate)?;
    debug!("{} block device(s) attached", devices.len());

    devices
        .into_iter()
        .find(|d| d.path == path)
        .ok_or_else(|| Error::DiskNotFound(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FixedDisks(Vec<Device>);

    impl DiskEnumerator for FixedDisks {
        fn list(&self) -> anyhow::Result<Vec<Device>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDisks;

    impl DiskEnumerator for BrokenDisks {
        fn list(&self) -> anyhow::Result<Vec<Device>> {
            Err(anyhow!("/sys/block is not readable"))
        }
    }

    fn disks() -> FixedDisks {
        FixedDisks(vec![
            Device::from_path("/dev/sda"),
            Device::from_path("/dev/sdb"),
        ])
    }

    #[test]
    fn unknown_disk_is_rejected() {
        let err = validate_disk(&disks(), Path::new("/dev/sdc")).unwrap_err();
        assert!(matches!(err, Error::DiskNotFound(_)));
        assert_eq!(err.to_string(), "The selected drive /dev/sdc was not found");
    }

    #[test]
    fn known_disk_is_returned() {
        let device = validate_disk(&disks(), Path::new("/dev/sda")).unwrap();
        assert_eq!(device, Device::from_path("/dev/sda"));
    }

    #[test]
    fn partial_paths_do_not_match() {
        assert!(validate_disk(&disks(), Path::new("/dev/sd")).is_err());
        assert!(validate_disk(&disks(), Path::new("/dev/sda1")).is_err());
    }

    #[test]
    fn enumeration_failure_propagates() {
        let err = validate_disk(&BrokenDisks, Path::new("/dev/sda")).unwrap_err();
        assert!(matches!(err, Error::Enumerate(_)));
    }
}
