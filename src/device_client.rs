#![cfg_attr(feature = "mock", allow(dead_code, unused_imports))]

use crate::http_client::{device_http_client, handle_http_response};
use anyhow::{Context, Result};
use log::{debug, info};
#[cfg(feature = "mock")]
use mockall::automock;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{error::Error as _, time::Duration};
use trait_variant::make;

/// Result of a single test attempt on the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttemptOutcome {
    /// Test completed without error.
    Success,
    /// Device-side job still running, poll again.
    Pending,
    /// Device reported a terminal error.
    Failure(String),
    /// No response within the attempt deadline.
    TimedOut,
    /// Device could not be reached at all.
    TransportError(String),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccessPoint {
    pub ssid: String,
    pub rssi: i32,
    pub channel: u8,
    pub auth: u8,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct WifiScan {
    #[serde(rename = "ap")]
    pub access_points: Vec<AccessPoint>,
}

#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait DeviceClient {
    /// Trigger or poll test `test_id`; never retries by itself.
    async fn run_test(&self, test_id: u32, timeout: Duration) -> AttemptOutcome;
    async fn submit_config(&self, payload: Map<String, Value>) -> Result<()>;
    async fn current_config(&self) -> Result<Value>;
    async fn wifi_scan(&self) -> Result<WifiScan>;
    async fn reboot(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct LinkyDeviceClient {
    client: Client,
    base_url: Url,
}

impl LinkyDeviceClient {
    const TEST_START_ENDPOINT: &str = "/test-start";
    const CONFIG_ENDPOINT: &str = "/config";
    const WIFI_SCAN_ENDPOINT: &str = "/wifi-scan";
    const REBOOT_ENDPOINT: &str = "/reboot";

    /// Marker the device puts in the body when its own request was aborted.
    const ABORT_ERROR_MARKER: &str = "AbortError";
    pub const TIMEOUT_MESSAGE: &str = "Timeout";

    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self> {
        let client = device_http_client(request_timeout)?;

        Ok(LinkyDeviceClient { client, base_url })
    }

    fn build_url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let normalized_path = path.trim_start_matches('/');
        format!("{base}/{normalized_path}")
    }

    /// GET request to the device API
    async fn get(&self, path: &str) -> Result<String> {
        let url = self.build_url(path);
        info!("GET {url}");

        let res = self
            .client
            .get(&url)
            .send()
            .await
            .context(format!("failed to send GET request to {url}"))?;

        handle_http_response(res, &format!("GET {url}")).await
    }

    /// POST request to the device API with JSON body
    ///
    /// The body is not logged since it may carry credentials.
    async fn post_json(&self, path: &str, body: impl Serialize) -> Result<String> {
        let url = self.build_url(path);
        info!("POST {url}");

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context(format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }

    /// Map the device's answer to a test request onto an attempt outcome
    pub fn classify_response(status: StatusCode, body: &str) -> AttemptOutcome {
        if status == StatusCode::ACCEPTED {
            return AttemptOutcome::Pending;
        }

        if status.is_success() {
            return AttemptOutcome::Success;
        }

        if body.contains(Self::ABORT_ERROR_MARKER) {
            return AttemptOutcome::Failure(Self::TIMEOUT_MESSAGE.to_string());
        }

        let body = body.trim();
        if body.is_empty() {
            AttemptOutcome::Failure(status.to_string())
        } else {
            AttemptOutcome::Failure(body.to_string())
        }
    }

    /// Map a request error onto an attempt outcome
    fn classify_error(error: &reqwest::Error) -> AttemptOutcome {
        if error.is_timeout() {
            return AttemptOutcome::TimedOut;
        }

        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(&format!(": {cause}"));
            source = cause.source();
        }

        AttemptOutcome::TransportError(message)
    }
}

impl DeviceClient for LinkyDeviceClient {
    async fn run_test(&self, test_id: u32, timeout: Duration) -> AttemptOutcome {
        let url = self.build_url(&format!("{}?id={test_id}", Self::TEST_START_ENDPOINT));
        info!("GET {url} (deadline {}ms)", timeout.as_millis());

        // the request future is dropped on expiry, so nothing outlives the deadline
        let res = match self.client.get(&url).timeout(timeout).send().await {
            Ok(res) => res,
            Err(e) => return Self::classify_error(&e),
        };

        let status = res.status();
        let outcome = match res.text().await {
            Ok(body) => Self::classify_response(status, &body),
            Err(e) => Self::classify_error(&e),
        };

        debug!("test {test_id} answered {status}: {outcome:?}");
        outcome
    }

    async fn submit_config(&self, payload: Map<String, Value>) -> Result<()> {
        self.post_json(Self::CONFIG_ENDPOINT, payload).await?;
        Ok(())
    }

    async fn current_config(&self) -> Result<Value> {
        let body = self.get(Self::CONFIG_ENDPOINT).await?;
        serde_json::from_str(&body).context("failed to parse device config")
    }

    async fn wifi_scan(&self) -> Result<WifiScan> {
        let body = self.get(Self::WIFI_SCAN_ENDPOINT).await?;
        serde_json::from_str(&body).context("failed to parse wifi scan")
    }

    async fn reboot(&self) -> Result<()> {
        self.get(Self::REBOOT_ENDPOINT).await?;
        Ok(())
    }
}
