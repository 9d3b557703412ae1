//! Writes the device configuration into the image's boot partition.
//!
//! The configuration document is split in two. The Wi-Fi credentials become
//! a NetworkManager connection profile, and everything else is written as
//! `config.json` at the partition root.
use crate::error::{Error, Result};
use crate::mount::{self, PartitionSpec};
use crate::services::DeviceConfigDocument;
use log::{debug, info};
use serde_json::Value;
use std::fmt::Write as _;
use std::io;
use std::path::Path;

pub const CONFIG_JSON_PATH: &str = "config.json";
pub const NETWORK_PROFILE_PATH: &str = "system-connections/fleet-wifi";

const CONNECTION_ID: &str = "fleet-wifi";
const WIFI_SSID_KEY: &str = "wifiSsid";
const WIFI_KEY_KEY: &str = "wifiKey";

fn string_field<'a>(document: &'a DeviceConfigDocument, key: &str) -> Option<&'a str> {
    document.get(key).and_then(Value::as_str)
}

/// Escapes a value for a keyfile line, so it cannot end the line or start a
/// new key or section. A leading space is kept as `\s`.
fn keyfile_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            ' ' if i == 0 => escaped.push_str("\\s"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Builds the connection profile for the document's Wi-Fi network.
///
/// Returns `None` unless `wifiSsid` is a string that is non-empty after
/// trimming. A non-empty `wifiKey` adds a WPA-PSK security section. Both
/// values are escaped as keyfile strings.
pub fn network_profile(document: &DeviceConfigDocument) -> Option<String> {
    let ssid = string_field(document, WIFI_SSID_KEY)?;
    if ssid.trim().is_empty() {
        return None;
    }
    let ssid = keyfile_value(ssid);

    let mut profile = String::new();
    // Writing to a String cannot fail.
    let _ = write!(
        profile,
        "[connection]\n\
         id={CONNECTION_ID}\n\
         type=wifi\n\
         \n\
         [wifi]\n\
         hidden=true\n\
         mode=infrastructure\n\
         ssid={ssid}\n\
         \n\
         [ipv4]\n\
         method=auto\n\
         \n\
         [ipv6]\n\
         addr-gen-mode=stable-privacy\n\
         method=auto\n"
    );

    if let Some(key) = string_field(document, WIFI_KEY_KEY).filter(|k| !k.is_empty()) {
        let key = keyfile_value(key);
        let _ = write!(
            profile,
            "\n\
             [wifi-security]\n\
             auth-alg=open\n\
             key-mgmt=wpa-psk\n\
             psk={key}\n"
        );
    }

    Some(profile)
}

/// The document without its Wi-Fi credentials.
pub fn other_config(document: &DeviceConfigDocument) -> DeviceConfigDocument {
    let mut other = document.clone();
    other.remove(WIFI_SSID_KEY);
    other.remove(WIFI_KEY_KEY);
    other
}

/// Writes `document` into partition `spec` of the image at `image`.
///
/// `config.json` is written first. The network profile follows only if the
/// document names a network, and only once the JSON write has succeeded.
pub fn inject_config(
    image: &Path,
    spec: PartitionSpec,
    document: &DeviceConfigDocument,
) -> Result<()> {
    let profile = network_profile(document);
    let json = serde_json::to_vec(&other_config(document)).map_err(io::Error::from)?;

    info!(
        "Writing configuration to partition {} of {}",
        spec.number,
        image.display()
    );

    mount::with_partition(image, spec, |partition| {
        partition
            .write_file(CONFIG_JSON_PATH, &json)
            .map_err(|source| Error::ConfigWrite {
                path: CONFIG_JSON_PATH.to_string(),
                source,
            })?;
        debug!("Wrote {} ({} bytes)", CONFIG_JSON_PATH, json.len());

        match &profile {
            Some(profile) => {
                partition
                    .write_file(NETWORK_PROFILE_PATH, profile.as_bytes())
                    .map_err(|source| Error::ProfileWrite {
                        path: NETWORK_PROFILE_PATH.to_string(),
                        source,
                    })?;
                debug!("Wrote {}", NETWORK_PROFILE_PATH);
            }
            None => debug!("No Wi-Fi network configured, skipping network profile"),
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::tests::build_image;
    use serde_json::json;

    fn doc(value: Value) -> DeviceConfigDocument {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn no_profile_without_ssid() {
        assert_eq!(network_profile(&doc(json!({"wifiKey": "secret"}))), None);
        assert_eq!(network_profile(&doc(json!({"wifiSsid": ""}))), None);
        assert_eq!(network_profile(&doc(json!({"wifiSsid": "  \t "}))), None);
        assert_eq!(network_profile(&doc(json!({"wifiSsid": 42}))), None);
    }

    #[test]
    fn profile_with_key_has_security_section() {
        let profile =
            network_profile(&doc(json!({"wifiSsid": "home", "wifiKey": "secret"}))).unwrap();

        assert!(profile.contains("id=fleet-wifi\n"));
        assert!(profile.contains("mode=infrastructure\n"));
        assert!(profile.contains("hidden=true\n"));
        assert!(profile.contains("ssid=home\n"));
        assert!(profile.contains("addr-gen-mode=stable-privacy\n"));
        assert!(profile.contains("[wifi-security]\nauth-alg=open\nkey-mgmt=wpa-psk\npsk=secret\n"));
    }

    #[test]
    fn profile_without_key_is_open() {
        for document in [
            json!({"wifiSsid": "home"}),
            json!({"wifiSsid": "home", "wifiKey": ""}),
            json!({"wifiSsid": "home", "wifiKey": null}),
        ] {
            let profile = network_profile(&doc(document)).unwrap();
            assert!(profile.contains("ssid=home"));
            assert!(!profile.contains("[wifi-security]"));
            assert!(!profile.contains("psk="));
        }
    }

    #[test]
    fn line_breaks_cannot_inject_keys() {
        let profile = network_profile(&doc(json!({
            "wifiSsid": "home\n[ipv4]\nmethod=disabled",
            "wifiKey": "a\\b\r\nkey-mgmt=none",
        })))
        .unwrap();

        assert!(profile.contains("ssid=home\\n[ipv4]\\nmethod=disabled\n"));
        assert!(profile.contains("psk=a\\\\b\\r\\nkey-mgmt=none\n"));
        assert!(!profile.lines().any(|line| line == "key-mgmt=none"));
        assert_eq!(profile.lines().filter(|line| *line == "[ipv4]").count(), 1);
        assert_eq!(profile.lines().filter(|line| *line == "method=auto").count(), 2);
    }

    #[test]
    fn untrimmed_ssid_keeps_leading_space() {
        let profile = network_profile(&doc(json!({"wifiSsid": " home "}))).unwrap();
        assert!(profile.contains("ssid=\\shome \n"));
    }

    #[test]
    fn other_config_drops_only_wifi_keys() {
        let other = other_config(&doc(json!({
            "wifiSsid": "home",
            "wifiKey": "secret",
            "applicationId": 7,
            "apiKey": "abc",
        })));
        assert_eq!(other, doc(json!({"applicationId": 7, "apiKey": "abc"})));

        let untouched = doc(json!({"hostname": "pi"}));
        assert_eq!(other_config(&untouched), untouched);
    }

    #[test]
    fn inject_writes_both_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("os.img");
        build_image(&image)?;

        let document = doc(json!({
            "wifiSsid": "home",
            "wifiKey": "secret",
            "otherKey": "value",
        }));
        inject_config(&image, PartitionSpec::default(), &document)?;

        let (config, profile) = mount::with_partition(&image, PartitionSpec::default(), |p| {
            Ok((
                p.read_file(CONFIG_JSON_PATH)?,
                p.read_file(NETWORK_PROFILE_PATH)?,
            ))
        })?;
        let config: Value = serde_json::from_slice(&config).map_err(io::Error::from)?;
        assert_eq!(config, json!({"otherKey": "value"}));
        let profile = String::from_utf8(profile).unwrap();
        assert!(profile.contains("ssid=home"));
        assert!(profile.contains("psk=secret"));
        Ok(())
    }

    #[test]
    fn inject_without_ssid_writes_only_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("os.img");
        build_image(&image)?;

        let document = doc(json!({"wifiSsid": " ", "wifiKey": "secret", "a": [1, 2]}));
        inject_config(&image, PartitionSpec::default(), &document)?;

        let (config, has_profile) = mount::with_partition(&image, PartitionSpec::default(), |p| {
            Ok((p.read_file(CONFIG_JSON_PATH)?, p.exists(NETWORK_PROFILE_PATH)?))
        })?;
        let config: Value = serde_json::from_slice(&config).map_err(io::Error::from)?;
        assert_eq!(config, json!({"a": [1, 2]}));
        assert!(!has_profile);
        Ok(())
    }

    #[test]
    fn mount_errors_propagate_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let err = inject_config(
            &dir.path().join("missing.img"),
            PartitionSpec::default(),
            &DeviceConfigDocument::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ImageAccess(_)));
    }
}
