//! The device cloud's REST API as an [`ImageCatalog`] and [`ConfigService`].
use crate::services::{ConfigService, DeviceConfigDocument, ImageCatalog, ImageStream, UserConfig};
use anyhow::{Context, Result, anyhow};
use log::debug;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Deserialize)]
struct SizeEstimate {
    size: u64,
}

#[derive(Deserialize)]
struct ODataResponse<T> {
    d: Vec<T>,
}

#[derive(Deserialize)]
struct Application {
    id: u64,
}

/// Blocking client for the image maker and configuration endpoints.
#[derive(Debug, Clone)]
pub struct CloudApi {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl CloudApi {
    /// `api_url` is the API root, e.g. `https://api.example.com`. Requests
    /// carry `token` as a bearer token when one is given.
    pub fn new(api_url: &str, token: Option<String>) -> Result<Self> {
        let base = normalize_base(api_url)?;
        let client = Client::builder()
            .user_agent(concat!("fleetflash/", env!("CARGO_PKG_VERSION")))
            // Images are large; a download may legitimately take hours.
            .timeout(None)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn get(&self, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        debug!("GET {url}");
        Ok(self.authorize(self.client.get(url)))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder> {
        let url = self.base.join(path)?;
        debug!("POST {url}");
        Ok(self.authorize(self.client.post(url)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn application_id(&self, name: &str) -> Result<u64> {
        let filter = format!("app_name eq '{}'", name.replace('\'', "''"));
        let response: ODataResponse<Application> = self
            .get("v6/application")?
            .query(&[("$select", "id"), ("$filter", filter.as_str())])
            .send()?
            .error_for_status()?
            .json()
            .context("Malformed application response")?;

        response
            .d
            .first()
            .map(|app| app.id)
            .ok_or_else(|| anyhow!("Application {name} not found"))
    }
}

impl ImageCatalog for CloudApi {
    fn download(&self, device_type: &str, version: &str) -> Result<ImageStream> {
        let response = self
            .get("download")?
            .query(&[("deviceType", device_type), ("version", version)])
            .send()?
            .error_for_status()
            .with_context(|| format!("No image for {device_type} {version}"))?;
        Ok(Box::new(response))
    }

    fn download_size(&self, device_type: &str, version: &str) -> Result<u64> {
        let estimate: SizeEstimate = self
            .get("size_estimate")?
            .query(&[("deviceType", device_type), ("version", version)])
            .send()?
            .error_for_status()?
            .json()
            .context("Malformed size estimate")?;
        Ok(estimate.size)
    }
}

impl ConfigService for CloudApi {
    fn get_config(
        &self,
        application_name: &str,
        options: &UserConfig,
    ) -> Result<DeviceConfigDocument> {
        let app_id = self.application_id(application_name)?;
        let body = config_request(app_id, options)?;
        let document = self
            .post("download-config")?
            .json(&body)
            .send()?
            .error_for_status()?
            .json()
            .context("Malformed device configuration")?;
        Ok(document)
    }
}

/// Ensures the base URL ends with `/`, so `join` appends instead of
/// replacing the last path segment.
fn normalize_base(api_url: &str) -> Result<Url> {
    let mut base = Url::parse(api_url).with_context(|| format!("Invalid API URL {api_url}"))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

/// The body of a configuration request: the operator's options plus the
/// application id, with `network` derived from the SSID unless given.
fn config_request(app_id: u64, options: &UserConfig) -> Result<Map<String, Value>> {
    let mut body = match serde_json::to_value(options)? {
        Value::Object(map) => map,
        other => return Err(anyhow!("Options must be an object, got {other}")),
    };
    body.insert("appId".to_string(), app_id.into());
    if !body.contains_key("network") {
        let network = if options.wifi_ssid.trim().is_empty() {
            "ethernet"
        } else {
            "wifi"
        };
        body.insert("network".to_string(), network.into());
    }
    Ok(body)
}
