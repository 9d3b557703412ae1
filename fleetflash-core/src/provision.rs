//! The provisioning pipeline: fetch, configure, validate, write.
use crate::context::ProvisionContext;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::fetch::{self, FetchOutcome};
use crate::inject;
use crate::progress::ProgressReporter;
use crate::services::{DeviceConfigDocument, UserConfig};
use crate::validate;
use crate::write::{DeviceWriter, WriteSummary};
use log::info;
use std::path::{Path, PathBuf};

/// Everything that identifies one provisioning job.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisioningRequest {
    pub application_name: String,
    pub device_type: String,
    pub os_version: String,
    pub target_disk: PathBuf,
    pub user_config: UserConfig,
}

/// Where each stage reports its progress.
pub struct Reporters<'a> {
    pub download: &'a mut dyn ProgressReporter,
    pub write: &'a mut dyn ProgressReporter,
    pub verify: &'a mut dyn ProgressReporter,
}

/// Runs provisioning stages against one [`ProvisionContext`].
pub struct Provisioner {
    context: ProvisionContext,
}

impl Provisioner {
    pub fn new(context: ProvisionContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ProvisionContext {
        &self.context
    }

    /// Runs the whole pipeline for `request`.
    ///
    /// Stages run strictly in order and the first failure is returned as-is.
    /// Earlier stages are not rolled back: a failed write leaves the cached
    /// image configured for this request.
    pub fn provision(
        &self,
        request: ProvisioningRequest,
        reporters: Reporters<'_>,
    ) -> Result<WriteSummary> {
        info!(
            "Provisioning {} for {} ({} {})",
            request.target_disk.display(),
            request.application_name,
            request.device_type,
            request.os_version
        );

        info!("[1/5] Fetching image");
        self.fetch(&request.device_type, &request.os_version, reporters.download)?;

        info!("[2/5] Resolving device configuration");
        let document = self.resolve_config(&request.application_name, &request.user_config)?;

        info!("[3/5] Injecting configuration");
        self.configure(&document)?;

        info!("[4/5] Validating {}", request.target_disk.display());
        let device = self.validate(&request.target_disk)?;

        info!("[5/5] Writing image");
        self.write(&device, reporters.write, reporters.verify)
    }

    pub fn fetch(
        &self,
        device_type: &str,
        version: &str,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<FetchOutcome> {
        fetch::fetch_image(
            self.context.catalog.as_ref(),
            &self.context.cache_path(),
            device_type,
            version,
            self.context.settings.progress_interval,
            reporter,
        )
    }

    /// Fills the cache slot from a local image file.
    pub fn import(&self, source: &Path, reporter: &mut dyn ProgressReporter) -> Result<u64> {
        fetch::import_local_image(source, &self.context.cache_path(), reporter)
    }

    pub fn resolve_config(
        &self,
        application_name: &str,
        options: &UserConfig,
    ) -> Result<DeviceConfigDocument> {
        self.context
            .config_service
            .get_config(application_name, options)
            .map_err(Error::ConfigService)
    }

    /// Writes `document` into the cached image.
    pub fn configure(&self, document: &DeviceConfigDocument) -> Result<()> {
        inject::inject_config(
            &self.context.cache_path(),
            self.context.settings.partition,
            document,
        )
    }

    pub fn validate(&self, path: &Path) -> Result<Device> {
        validate::validate_disk(self.context.disks.as_ref(), path)
    }

    /// Writes the cached image to `device`.
    pub fn write(
        &self,
        device: &Device,
        on_write: &mut dyn ProgressReporter,
        on_verify: &mut dyn ProgressReporter,
    ) -> Result<WriteSummary> {
        DeviceWriter::new(self.context.unmounter.as_ref(), &self.context.settings).write(
            &self.context.cache_path(),
            device,
            on_write,
            on_verify,
        )
    }
}
