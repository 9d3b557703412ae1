//! Everything a provisioning run needs that is not part of the request.
use crate::mount::PartitionSpec;
use crate::services::{ConfigService, DiskEnumerator, DiskUnmounter, ImageCatalog};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the single cache slot inside the asset directory.
pub const CACHE_FILE_NAME: &str = "os.img";

/// Size class of the target media, used when the real size cannot be probed.
pub const DEFAULT_DEVICE_CAPACITY: u64 = 2_014_314_496;

/// Pause between closing the device and the final unmount.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables for a run. `Default` matches the stock behaviour.
#[derive(Clone, Debug)]
pub struct ProvisionSettings {
    pub settle_delay: Duration,
    pub declared_capacity: u64,
    /// Minimum time between two progress updates.
    pub progress_interval: Duration,
    /// Re-read the device after writing and compare hashes.
    pub verify: bool,
    /// The configuration partition inside the image.
    pub partition: PartitionSpec,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            declared_capacity: DEFAULT_DEVICE_CAPACITY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            verify: false,
            partition: PartitionSpec::default(),
        }
    }
}

/// The asset directory and service handles shared by every stage.
pub struct ProvisionContext {
    pub asset_dir: PathBuf,
    pub catalog: Box<dyn ImageCatalog>,
    pub config_service: Box<dyn ConfigService>,
    pub disks: Box<dyn DiskEnumerator>,
    pub unmounter: Box<dyn DiskUnmounter>,
    pub settings: ProvisionSettings,
}

impl ProvisionContext {
    pub fn new(
        asset_dir: impl AsRef<Path>,
        catalog: Box<dyn ImageCatalog>,
        config_service: Box<dyn ConfigService>,
        disks: Box<dyn DiskEnumerator>,
        unmounter: Box<dyn DiskUnmounter>,
    ) -> Self {
        Self {
            asset_dir: asset_dir.as_ref().to_path_buf(),
            catalog,
            config_service,
            disks,
            unmounter,
            settings: ProvisionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ProvisionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Path of the cache slot.
    pub fn cache_path(&self) -> PathBuf {
        self.asset_dir.join(CACHE_FILE_NAME)
    }
}
