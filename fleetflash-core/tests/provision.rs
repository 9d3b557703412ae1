mod common;

use anyhow::anyhow;
use fleetflash_core::context::{ProvisionContext, ProvisionSettings};
use fleetflash_core::device::Device;
use fleetflash_core::inject::{CONFIG_JSON_PATH, NETWORK_PROFILE_PATH};
use fleetflash_core::mount::{self, PartitionSpec};
use fleetflash_core::progress::ProgressReporter;
use fleetflash_core::provision::{Provisioner, ProvisioningRequest, Reporters};
use fleetflash_core::services::{
    ConfigService, DeviceConfigDocument, DiskEnumerator, DiskUnmounter, ImageCatalog,
    ImageStream, UserConfig,
};
use serde_json::{Value, json};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Default)]
struct Catalog {
    calls: Arc<AtomicUsize>,
}

impl ImageCatalog for Catalog {
    fn download(&self, _: &str, _: &str) -> anyhow::Result<ImageStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("the cached image should have been used"))
    }

    fn download_size(&self, _: &str, _: &str) -> anyhow::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("the cached image should have been used"))
    }
}

/// Echoes the options back with a few server-side fields added.
struct Config {
    requests: Rc<RefCell<Vec<String>>>,
}

impl ConfigService for Config {
    fn get_config(
        &self,
        application_name: &str,
        options: &UserConfig,
    ) -> anyhow::Result<DeviceConfigDocument> {
        self.requests.borrow_mut().push(application_name.to_string());
        let Value::Object(mut document) = serde_json::to_value(options)? else {
            return Err(anyhow!("options are not an object"));
        };
        document.insert("applicationId".into(), json!(1234));
        document.insert("deviceType".into(), json!("raspberrypi3"));
        Ok(document)
    }
}

struct Disks(Vec<Device>);

impl DiskEnumerator for Disks {
    fn list(&self) -> anyhow::Result<Vec<Device>> {
        Ok(self.0.clone())
    }
}

struct Unmounter(Rc<RefCell<Vec<PathBuf>>>);

impl DiskUnmounter for Unmounter {
    fn unmount_disk(&self, path: &Path) -> anyhow::Result<()> {
        self.0.borrow_mut().push(path.to_path_buf());
        Ok(())
    }
}

#[derive(Default)]
struct Bar {
    last: Option<f64>,
    finished: Vec<bool>,
}

impl ProgressReporter for Bar {
    fn progress(&mut self, percentage: f64) {
        self.last = Some(percentage);
    }

    fn finish(&mut self, success: bool) {
        self.finished.push(success);
    }
}

#[test]
fn provisions_a_device_from_the_cached_image() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let asset_dir = dir.path().join("assets");
    fs::create_dir(&asset_dir)?;
    let target = dir.path().join("sdx");
    fs::write(&target, b"")?;

    let catalog = Catalog::default();
    let config_requests = Rc::new(RefCell::new(Vec::new()));
    let unmounts = Rc::new(RefCell::new(Vec::new()));

    let context = ProvisionContext::new(
        &asset_dir,
        Box::new(catalog.clone()),
        Box::new(Config {
            requests: config_requests.clone(),
        }),
        Box::new(Disks(vec![
            Device::from_path("/dev/sda"),
            Device::from_path(&target),
        ])),
        Box::new(Unmounter(unmounts.clone())),
    )
    .with_settings(ProvisionSettings {
        settle_delay: Duration::from_millis(10),
        progress_interval: Duration::ZERO,
        ..Default::default()
    });
    common::build_image(&context.cache_path())?;

    let provisioner = Provisioner::new(context);
    let request = ProvisioningRequest {
        application_name: "myApp".into(),
        device_type: "raspberrypi3".into(),
        os_version: "2.9.7".into(),
        target_disk: target.clone(),
        user_config: serde_json::from_value(json!({
            "wifiSsid": "home",
            "wifiKey": "secret",
            "otherKey": "value",
        }))?,
    };

    let (mut download, mut write, mut verify) = (Bar::default(), Bar::default(), Bar::default());
    let summary = provisioner.provision(
        request,
        Reporters {
            download: &mut download,
            write: &mut write,
            verify: &mut verify,
        },
    )?;

    assert_eq!(summary.device, target);
    assert!(summary.to_string().ends_with(&format!("to {}", target.display())));
    assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
    assert_eq!(*config_requests.borrow(), vec!["myApp".to_string()]);
    assert_eq!(*unmounts.borrow(), vec![target.clone(), target.clone()]);

    // Nothing was downloaded and nothing was verified.
    assert!(download.finished.is_empty());
    assert!(verify.finished.is_empty());
    assert_eq!(write.last, Some(100.0));
    assert_eq!(write.finished, vec![true]);

    // The device holds the configured image byte for byte.
    let cache = provisioner.context().cache_path();
    assert_eq!(fs::read(&target)?, fs::read(&cache)?);

    let (config, profile) = mount::with_partition(&target, PartitionSpec::default(), |p| {
        Ok((p.read_file(CONFIG_JSON_PATH)?, p.read_file(NETWORK_PROFILE_PATH)?))
    })?;
    let config: Value = serde_json::from_slice(&config)?;
    assert_eq!(
        config,
        json!({
            "otherKey": "value",
            "applicationId": 1234,
            "deviceType": "raspberrypi3",
        })
    );
    let profile = String::from_utf8(profile)?;
    assert!(profile.contains("ssid=home"));
    assert!(profile.contains("key-mgmt=wpa-psk"));
    assert!(profile.contains("psk=secret"));
    Ok(())
}

#[test]
fn missing_disk_is_reported_by_path() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let unmounts = Rc::new(RefCell::new(Vec::new()));
    let context = ProvisionContext::new(
        dir.path(),
        Box::new(Catalog::default()),
        Box::new(Config {
            requests: Rc::default(),
        }),
        Box::new(Disks(vec![
            Device::from_path("/dev/sda"),
            Device::from_path("/dev/sdb"),
        ])),
        Box::new(Unmounter(unmounts.clone())),
    );
    common::build_image(&context.cache_path())?;

    let (mut download, mut write, mut verify) = (Bar::default(), Bar::default(), Bar::default());
    let err = Provisioner::new(context)
        .provision(
            ProvisioningRequest {
                application_name: "myApp".into(),
                device_type: "raspberrypi3".into(),
                os_version: "2.9.7".into(),
                target_disk: "/dev/sdc".into(),
                user_config: UserConfig::default(),
            },
            Reporters {
                download: &mut download,
                write: &mut write,
                verify: &mut verify,
            },
        )
        .unwrap_err();

    assert_eq!(err.to_string(), "The selected drive /dev/sdc was not found");
    assert!(unmounts.borrow().is_empty());
    assert!(write.finished.is_empty());
    Ok(())
}
