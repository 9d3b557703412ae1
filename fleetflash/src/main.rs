use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use fleetflash_core::api::CloudApi;
use fleetflash_core::context::{DEFAULT_DEVICE_CAPACITY, ProvisionContext, ProvisionSettings};
use fleetflash_core::device::Device;
use fleetflash_core::fetch::FetchOutcome;
use fleetflash_core::platform::{self, SystemDisks};
use fleetflash_core::progress::ProgressReporter;
use fleetflash_core::provision::{Provisioner, ProvisioningRequest, Reporters};
use fleetflash_core::services::{
    ConfigService, DeviceConfigDocument, ImageCatalog, ImageStream, UserConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fleetflash")]
#[command(about = "Provision storage devices for an embedded device fleet", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Directory holding the cached OS image
    #[arg(long, env = "FLEETFLASH_ASSET_DIR", default_value = "assets", global = true)]
    asset_dir: PathBuf,

    /// Root URL of the device cloud API
    #[arg(long, env = "FLEETFLASH_API_URL", global = true)]
    api_url: Option<String>,

    /// API token sent with every request
    #[arg(long, env = "FLEETFLASH_API_TOKEN", hide_env_values = true, global = true)]
    api_token: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Args)]
struct WriteArgs {
    /// Target block device (prompted for when omitted)
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Seconds to wait after writing before the final unmount
    #[arg(long, default_value_t = 2)]
    settle_delay: u64,

    /// Read the device back and compare it with the image
    #[arg(long)]
    verify: bool,

    /// Capacity in bytes to assume when the device size cannot be probed
    #[arg(long, default_value_t = DEFAULT_DEVICE_CAPACITY)]
    capacity: u64,

    /// Do not ask for confirmation before writing
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, configure and write an image to a device
    Provision {
        /// Application the device will join
        #[arg(long = "app")]
        application: String,

        /// Device type, e.g. raspberrypi3
        #[arg(long)]
        device_type: String,

        /// OS version, e.g. 2.9.7
        #[arg(long)]
        os_version: String,

        /// Wi-Fi network name; leave empty for a wired device
        #[arg(long)]
        wifi_ssid: Option<String>,

        /// Wi-Fi pre-shared key
        #[arg(long)]
        wifi_key: Option<String>,

        /// Extra configuration option (repeatable)
        #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        options: Vec<(String, String)>,

        /// JSON file with configuration options
        #[arg(long)]
        config_file: Option<PathBuf>,

        #[command(flatten)]
        write: WriteArgs,
    },
    /// Download an image into the cache
    Fetch {
        #[arg(long)]
        device_type: String,

        #[arg(long)]
        os_version: String,
    },
    /// Put a local image (optionally .gz, .xz or .zst) into the cache
    Import {
        /// Image file to import
        #[arg(required = true)]
        image: PathBuf,
    },
    /// Write a device configuration document into the cached image
    Configure {
        /// JSON configuration document
        #[arg(required = true)]
        config: PathBuf,
    },
    /// Write the cached image to a device as-is
    Write {
        #[command(flatten)]
        write: WriteArgs,
    },
    /// List attached block devices
    List,
}

fn parse_key_val(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{s}'"))?;
    Ok((key.to_string(), value.to_string()))
}

/// Stands in for the cloud API when no `--api-url` is configured.
struct NoApi;

impl ImageCatalog for NoApi {
    fn download(&self, _: &str, _: &str) -> Result<ImageStream> {
        bail!("No API URL configured (use --api-url or FLEETFLASH_API_URL)")
    }

    fn download_size(&self, _: &str, _: &str) -> Result<u64> {
        bail!("No API URL configured (use --api-url or FLEETFLASH_API_URL)")
    }
}

impl ConfigService for NoApi {
    fn get_config(&self, _: &str, _: &UserConfig) -> Result<DeviceConfigDocument> {
        bail!("No API URL configured (use --api-url or FLEETFLASH_API_URL)")
    }
}

/// An indicatif bar showing a 0-100 percentage with two decimals.
struct PercentBar {
    prefix: &'static str,
    color: &'static str,
    done_message: &'static str,
    pb: Option<ProgressBar>,
}

impl PercentBar {
    fn new(prefix: &'static str, color: &'static str, done_message: &'static str) -> Self {
        Self {
            prefix,
            color,
            done_message,
            pb: None,
        }
    }
}

impl ProgressReporter for PercentBar {
    fn start(&mut self, _total_bytes: u64) {
        let template = format!(
            "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{}/black}}] {{msg}}",
            self.color
        );
        let style = ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("■ ");

        let pb = ProgressBar::new(10_000);
        pb.set_prefix(self.prefix);
        pb.set_style(style);
        self.pb = Some(pb);
    }

    fn progress(&mut self, percentage: f64) {
        if let Some(pb) = &self.pb {
            pb.set_position((percentage * 100.0).round() as u64);
            pb.set_message(format!("{percentage:.2}%"));
        }
    }

    fn finish(&mut self, success: bool) {
        if let Some(pb) = self.pb.take() {
            if success {
                pb.finish_with_message(self.done_message);
            } else {
                pb.abandon_with_message("❌ Operation failed.");
            }
        }
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No suitable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// Resolves the target disk and asks before it gets overwritten.
///
/// Returns `None` if the user backs out.
fn choose_target(args: &WriteArgs, image: &str) -> Result<Option<PathBuf>> {
    let device = match &args.disk {
        Some(path) => platform::list_block_devices()?
            .into_iter()
            .find(|d| &d.path == path)
            .unwrap_or_else(|| Device::from_path(path)),
        None => {
            let devices: Vec<Device> = platform::list_block_devices()?
                .into_iter()
                .filter(|d| !d.system)
                .collect();
            select_device(&devices, "Select the target device to WRITE to")?
        }
    };

    if device.system {
        println!(
            "{} '{}' holds the running system.",
            style("DANGER:").red().bold(),
            device.path.display()
        );
    }
    println!(
        "{} This will erase all data on '{}' ({:.1} GB).",
        style("WARNING:").red().bold(),
        device.name,
        device.size_gb,
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Image:  {}", style(image).cyan());
    println!();

    if !args.yes && !confirm_operation("Are you sure you want to proceed?")? {
        return Ok(None);
    }
    println!();
    Ok(Some(device.path))
}

fn settings(args: Option<&WriteArgs>) -> ProvisionSettings {
    let mut settings = ProvisionSettings::default();
    if let Some(args) = args {
        settings.settle_delay = Duration::from_secs(args.settle_delay);
        settings.verify = args.verify;
        settings.declared_capacity = args.capacity;
    }
    settings
}

fn provisioner(global: &GlobalArgs, settings: ProvisionSettings) -> Result<Provisioner> {
    let (catalog, config): (Box<dyn ImageCatalog>, Box<dyn ConfigService>) = match &global.api_url
    {
        Some(url) => {
            let api = CloudApi::new(url, global.api_token.clone())?;
            (Box::new(api.clone()), Box::new(api))
        }
        None => (Box::new(NoApi), Box::new(NoApi)),
    };

    let context = ProvisionContext::new(
        &global.asset_dir,
        catalog,
        config,
        Box::new(SystemDisks),
        Box::new(SystemDisks),
    )
    .with_settings(settings);
    Ok(Provisioner::new(context))
}

/// Builds the configuration options from a file and command-line overrides.
fn user_config(
    config_file: Option<&PathBuf>,
    wifi_ssid: Option<String>,
    wifi_key: Option<String>,
    options: Vec<(String, String)>,
    device_type: &str,
    os_version: &str,
) -> Result<UserConfig> {
    let mut config: UserConfig = match config_file {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        }
        None => UserConfig::default(),
    };

    if let Some(ssid) = wifi_ssid {
        config.wifi_ssid = ssid;
    }
    if wifi_key.is_some() {
        config.wifi_key = wifi_key;
    }
    for (key, value) in options {
        config.extra.insert(key, Value::String(value));
    }
    config
        .extra
        .entry("deviceType")
        .or_insert_with(|| Value::String(device_type.to_string()));
    config
        .extra
        .entry("version")
        .or_insert_with(|| Value::String(os_version.to_string()));
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.global.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match cli.command {
        Commands::Provision {
            application,
            device_type,
            os_version,
            wifi_ssid,
            wifi_key,
            options,
            config_file,
            write,
        } => {
            let user_config = user_config(
                config_file.as_ref(),
                wifi_ssid,
                wifi_key,
                options,
                &device_type,
                &os_version,
            )?;

            let image = format!("{device_type} {os_version}");
            let Some(target_disk) = choose_target(&write, &image)? else {
                println!("Provisioning cancelled.");
                return Ok(());
            };

            let provisioner = provisioner(&cli.global, settings(Some(&write)))?;
            let mut download = PercentBar::new("Download", "blue", "Download complete.");
            let mut write_bar = PercentBar::new("Writing", "green", "Write complete.");
            let mut verify = PercentBar::new("Verifying", "magenta", "Verification successful.");

            let summary = provisioner.provision(
                ProvisioningRequest {
                    application_name: application,
                    device_type,
                    os_version,
                    target_disk,
                    user_config,
                },
                Reporters {
                    download: &mut download,
                    write: &mut write_bar,
                    verify: &mut verify,
                },
            )?;

            println!("\n✨ {}.", summary);
        }
        Commands::Fetch {
            device_type,
            os_version,
        } => {
            let provisioner = provisioner(&cli.global, settings(None))?;
            let mut download = PercentBar::new("Download", "blue", "Download complete.");

            match provisioner.fetch(&device_type, &os_version, &mut download)? {
                FetchOutcome::Cached => println!(
                    "An image is already cached at {}.",
                    style(provisioner.context().cache_path().display()).cyan()
                ),
                FetchOutcome::Downloaded { bytes } => println!(
                    "\n✨ Downloaded {} bytes to {}.",
                    bytes,
                    style(provisioner.context().cache_path().display()).cyan()
                ),
            }
        }
        Commands::Import { image } => {
            let provisioner = provisioner(&cli.global, settings(None))?;
            let mut bar = PercentBar::new("Import", "blue", "Import complete.");

            let len = provisioner.import(&image, &mut bar)?;
            println!(
                "\n✨ Cached {} ({} bytes) at {}.",
                style(image.display()).cyan(),
                len,
                style(provisioner.context().cache_path().display()).cyan()
            );
        }
        Commands::Configure { config } => {
            let text = fs::read_to_string(&config)
                .with_context(|| format!("Failed to read {}", config.display()))?;
            let document: DeviceConfigDocument = serde_json::from_str(&text)
                .with_context(|| format!("Invalid configuration in {}", config.display()))?;

            let provisioner = provisioner(&cli.global, settings(None))?;
            provisioner.configure(&document)?;
            println!(
                "✨ Configured {}.",
                style(provisioner.context().cache_path().display()).cyan()
            );
        }
        Commands::Write { write } => {
            let provisioner = provisioner(&cli.global, settings(Some(&write)))?;
            let cache = provisioner.context().cache_path();
            let image = cache.display().to_string();

            let Some(target_disk) = choose_target(&write, &image)? else {
                println!("Write operation cancelled.");
                return Ok(());
            };

            let device = provisioner.validate(&target_disk)?;
            let mut write_bar = PercentBar::new("Writing", "green", "Write complete.");
            let mut verify = PercentBar::new("Verifying", "magenta", "Verification successful.");
            let summary = provisioner.write(&device, &mut write_bar, &mut verify)?;

            println!("\n✨ {}.", summary);
        }
        Commands::List => {
            let devices = platform::list_block_devices()?;
            if devices.is_empty() {
                println!("No block devices found.");
                return Ok(());
            }

            println!("Found {} block devices:", devices.len());
            println!(
                "\n  {:<14} {:<12} {:<10} {:<10} {}",
                "DEVICE", "NAME", "SIZE", "TYPE", "LOCATION"
            );
            println!("  {:-<14} {:-<12} {:-<10} {:-<10} {:-<20}", "", "", "", "", "");
            for device in devices {
                let kind = if device.system {
                    "system"
                } else if device.removable {
                    "removable"
                } else {
                    "fixed"
                };
                let location = if device.mount_point.is_empty() {
                    "(Not mounted)".to_string()
                } else {
                    device.mount_point
                };
                println!(
                    "  {:<14} {:<12} {:>8.1} GB {:<10} {}",
                    device.path.display(),
                    device.name,
                    device.size_gb,
                    kind,
                    location
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_value_options_parse() {
        assert_eq!(
            parse_key_val("hostname=pi").unwrap(),
            ("hostname".to_string(), "pi".to_string())
        );
        assert_eq!(
            parse_key_val("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.json");
        fs::write(
            &path,
            r#"{"wifiSsid": "office", "wifiKey": "k1", "version": "2.0.0"}"#,
        )
        .unwrap();

        let config = user_config(
            Some(&path),
            Some("home".into()),
            None,
            vec![("otherKey".into(), "value".into())],
            "raspberrypi3",
            "2.9.7",
        )
        .unwrap();

        assert_eq!(config.wifi_ssid, "home");
        assert_eq!(config.wifi_key.as_deref(), Some("k1"));
        assert_eq!(config.extra.get("otherKey"), Some(&json!("value")));
        assert_eq!(config.extra.get("version"), Some(&json!("2.0.0")));
        assert_eq!(config.extra.get("deviceType"), Some(&json!("raspberrypi3")));
    }

    #[test]
    fn cli_parses_provision() {
        let cli = Cli::try_parse_from([
            "fleetflash",
            "provision",
            "--app",
            "myApp",
            "--device-type",
            "raspberrypi3",
            "--os-version",
            "2.9.7",
            "--disk",
            "/dev/sdx",
            "--option",
            "otherKey=value",
            "--yes",
        ])
        .unwrap();

        match cli.command {
            Commands::Provision {
                application,
                write,
                options,
                ..
            } => {
                assert_eq!(application, "myApp");
                assert_eq!(write.disk, Some(PathBuf::from("/dev/sdx")));
                assert!(write.yes);
                assert_eq!(write.settle_delay, 2);
                assert_eq!(
                    options,
                    vec![(String::from("otherKey"), String::from("value"))]
                );
            }
            _ => panic!("expected provision"),
        }
    }
}
