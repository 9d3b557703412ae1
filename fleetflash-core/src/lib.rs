//! The core, UI-agnostic library for the `fleetflash` provisioning utility.
//!
//! `fleetflash-core` prepares a storage device for a fleet device: it fetches
//! an OS image, writes the device's configuration into the image's boot
//! partition, checks the target disk and flashes the image onto it. Any
//! front-end can drive it, whether a command-line interface (like
//! `fleetflash`) or a graphical one.
//!
//! The library is structured into several key modules:
//! - [`provision`]: The [`Provisioner`](provision::Provisioner) that runs the
//!   pipeline stage by stage.
//! - [`fetch`]: Filling the image cache from the catalog or a local file.
//! - [`inject`] and [`mount`]: Writing configuration into a FAT partition of
//!   the image, without mounting it on the host.
//! - [`validate`]: Checking the target against the attached block devices.
//! - [`mod@write`]: Streaming the image onto the device.
//! - [`services`]: The interfaces to external services, implemented for real
//!   by [`platform`] and [`api`].
//!
//! Long-running stages report progress through a
//! [`ProgressReporter`](progress::ProgressReporter), so the calling
//! application can display it however it chooses.
//!
//! ## Example: Provisioning a Device
//!
//! ```rust,no_run
//! use fleetflash_core::api::CloudApi;
//! use fleetflash_core::context::ProvisionContext;
//! use fleetflash_core::platform::SystemDisks;
//! use fleetflash_core::progress::NoProgress;
//! use fleetflash_core::provision::{Provisioner, ProvisioningRequest, Reporters};
//! use fleetflash_core::services::UserConfig;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let api = CloudApi::new("https://api.example.com", None)?;
//!     let context = ProvisionContext::new(
//!         "assets",
//!         Box::new(api.clone()),
//!         Box::new(api),
//!         Box::new(SystemDisks),
//!         Box::new(SystemDisks),
//!     );
//!
//!     let request = ProvisioningRequest {
//!         application_name: "myApp".into(),
//!         device_type: "raspberrypi3".into(),
//!         os_version: "2.9.7".into(),
//!         target_disk: "/dev/sdb".into(),
//!         user_config: UserConfig {
//!             wifi_ssid: "home".into(),
//!             wifi_key: Some("secret".into()),
//!             ..Default::default()
//!         },
//!     };
//!
//!     let (mut download, mut write, mut verify) = (NoProgress, NoProgress, NoProgress);
//!     let summary = Provisioner::new(context).provision(
//!         request,
//!         Reporters {
//!             download: &mut download,
//!             write: &mut write,
//!             verify: &mut verify,
//!         },
//!     )?;
//!
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod context;
pub mod device;
pub mod error;
pub mod fetch;
pub mod inject;
pub mod mount;
pub mod platform;
pub mod progress;
pub mod provision;
pub mod services;
pub mod validate;
pub mod write;

pub use error::{Error, Result};
