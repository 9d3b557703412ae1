use fatfs::FormatVolumeOptions;
use fleetflash_core::mount::PartitionView;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

const START_LBA: u32 = 2048;
const PARTITION_SECTORS: u32 = 16 * 1024;

/// Writes a disk image with an MBR and one FAT partition, like the boot
/// partition of a real OS image.
pub fn build_image(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(u64::from(START_LBA + PARTITION_SECTORS) * 512)?;

    let mut mbr = [0u8; 512];
    mbr[446 + 4] = 0x0C;
    mbr[446 + 8..446 + 12].copy_from_slice(&START_LBA.to_le_bytes());
    mbr[446 + 12..446 + 16].copy_from_slice(&PARTITION_SECTORS.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    file.write_all(&mbr)?;

    let mut view = PartitionView::new(
        &mut file,
        u64::from(START_LBA) * 512,
        u64::from(PARTITION_SECTORS) * 512,
    )?;
    fatfs::format_volume(&mut view, FormatVolumeOptions::new())
}
