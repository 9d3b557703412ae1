//! Interfaces to the services a provisioning run depends on but does not own.
//!
//! [`crate::platform::SystemDisks`] and [`crate::api::CloudApi`] are the
//! production implementations. Tests substitute their own.
use crate::device::Device;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::Path;

/// The configuration document handed back by a [`ConfigService`].
///
/// Opaque apart from `wifiSsid` and `wifiKey`, which the injector turns into
/// a network profile. Every other key lands in the image verbatim.
pub type DeviceConfigDocument = Map<String, Value>;

/// A readable image stream returned by [`ImageCatalog::download`].
pub type ImageStream = Box<dyn Read + Send>;

/// Operator-supplied options for the configuration service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    #[serde(default)]
    pub wifi_ssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_key: Option<String>,
    /// Passed through to the configuration service untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resolves a device type and OS version to a downloadable image.
///
/// `Sync` because the fetcher queries the stream and its size concurrently.
pub trait ImageCatalog: Send + Sync {
    fn download(&self, device_type: &str, version: &str) -> Result<ImageStream>;
    fn download_size(&self, device_type: &str, version: &str) -> Result<u64>;
}

pub trait ConfigService {
    fn get_config(&self, application_name: &str, options: &UserConfig)
        -> Result<DeviceConfigDocument>;
}

/// Lists the block devices currently attached to the host.
pub trait DiskEnumerator {
    fn list(&self) -> Result<Vec<Device>>;
}

/// Unmounts every volume of a disk. Must succeed when nothing is mounted.
pub trait DiskUnmounter {
    fn unmount_disk(&self, path: &Path) -> Result<()>;
}
