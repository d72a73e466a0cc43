use crate::{
    device_client::DeviceClient,
    services::validation::{ValidationService, catalog::Mode},
};
use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_valid::Validate;
use uuid::Uuid;

// ============================================================================
// Structs
// ============================================================================

/// Configuration form as understood by the device's `/config` endpoint
#[derive(Deserialize, Serialize, Clone, Validate, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceConfig {
    #[validate(min_length = 1)]
    #[validate(max_length = 32)]
    pub wifi_ssid: String,
    #[validate(max_length = 64)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_password: Option<String>,
    pub server_mode: Mode,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_token: Option<String>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_config: Option<String>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_post: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linky_mode: Option<u8>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_host: Option<String>,
    #[validate(minimum = 1)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_port: Option<u16>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_user: Option<String>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_password: Option<String>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt_ha_discovery: Option<bool>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuya_device_uuid: Option<String>,
    #[validate(max_length = 99)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuya_device_auth: Option<String>,
    #[validate(minimum = 1)]
    #[validate(maximum = 3600)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_rate: Option<u32>,
}

impl DeviceConfig {
    /// Mode the device will actually run in after applying this form
    pub fn resolved_mode(&self) -> Mode {
        match (self.server_mode, self.mqtt_ha_discovery) {
            (Mode::Mqtt, Some(true)) => Mode::MqttWithDiscovery,
            (mode, _) => mode,
        }
    }
}

/// Form fields the device never echoes back in clear text
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensitiveField {
    WifiPassword,
    MqttPassword,
    TuyaDeviceUuid,
    TuyaDeviceAuth,
}

impl SensitiveField {
    pub const ALL: [SensitiveField; 4] = [
        SensitiveField::WifiPassword,
        SensitiveField::MqttPassword,
        SensitiveField::TuyaDeviceUuid,
        SensitiveField::TuyaDeviceAuth,
    ];

    /// Form key of the field
    pub fn key(self) -> &'static str {
        match self {
            SensitiveField::WifiPassword => "wifi-password",
            SensitiveField::MqttPassword => "mqtt-password",
            SensitiveField::TuyaDeviceUuid => "tuya-device-uuid",
            SensitiveField::TuyaDeviceAuth => "tuya-device-auth",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubmitConfigRequest {
    #[serde(flatten)]
    #[validate]
    pub config: DeviceConfig,
    /// Sensitive fields the user actually changed.
    /// Others are left out of the payload so the stored values survive.
    #[serde(default)]
    pub edited: Vec<SensitiveField>,
}

impl SubmitConfigRequest {
    /// Key/value payload posted to the device
    pub fn payload(&self) -> Result<Map<String, Value>> {
        let Value::Object(mut payload) =
            serde_json::to_value(&self.config).context("failed to serialize config")?
        else {
            bail!("config did not serialize to an object");
        };

        payload.insert(
            "server-mode".to_string(),
            Value::from(self.config.resolved_mode() as u8),
        );

        for field in SensitiveField::ALL {
            if !self.edited.contains(&field) {
                payload.remove(field.key());
            }
        }

        Ok(payload)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run_id: Uuid,
    pub mode: Mode,
}

// ============================================================================
// Service
// ============================================================================

/// Service for submitting a configuration and validating it on the device
pub struct ProvisioningService;

impl ProvisioningService {
    /// Submit a configuration and start validating it
    ///
    /// # Arguments
    /// * `service_client` - Device client the payload is posted with
    /// * `validation` - Validation service the new run is started on
    /// * `request` - Configuration form plus edited sensitive fields
    ///
    /// # Returns
    /// Id and mode of the started orchestration run
    pub async fn submit<T>(
        service_client: &T,
        validation: &ValidationService<T>,
        request: &SubmitConfigRequest,
    ) -> Result<RunStarted>
    where
        T: DeviceClient + Send + Sync + 'static,
    {
        request.validate().context("config validation failed")?;

        let mode = request.config.resolved_mode();
        let payload = request.payload()?;

        service_client
            .submit_config(payload)
            .await
            .context("failed to submit config")?;

        info!("config for mode {mode} accepted by device");

        let run_id = validation.start(mode).await;

        Ok(RunStarted { run_id, mode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_client::{AttemptOutcome, WifiScan},
        services::validation::catalog::TestCatalog,
    };
    use serde_json::json;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    fn request(value: Value) -> SubmitConfigRequest {
        serde_json::from_value(value).unwrap()
    }

    fn mqtt_form() -> Value {
        json!({
            "wifi-ssid": "home",
            "wifi-password": "secret",
            "server-mode": 2,
            "mqtt-host": "broker.local",
            "mqtt-port": 1883,
            "mqtt-user": "linky",
            "mqtt-password": "hunter2",
            "mqtt-topic": "linky",
            "refresh-rate": 60
        })
    }

    mod validation {
        use super::*;

        #[test]
        fn accepts_complete_form() {
            assert!(request(mqtt_form()).validate().is_ok());
        }

        #[test]
        fn rejects_empty_ssid() {
            let mut form = mqtt_form();
            form["wifi-ssid"] = json!("");
            assert!(request(form).validate().is_err());
        }

        #[test]
        fn rejects_too_long_ssid() {
            let mut form = mqtt_form();
            form["wifi-ssid"] = json!("s".repeat(33));
            assert!(request(form).validate().is_err());
        }

        #[test]
        fn rejects_too_long_wifi_password() {
            let mut form = mqtt_form();
            form["wifi-password"] = json!("p".repeat(65));
            assert!(request(form).validate().is_err());
        }

        #[test]
        fn rejects_text_exceeding_device_buffer() {
            let mut form = mqtt_form();
            form["mqtt-topic"] = json!("t".repeat(100));
            assert!(request(form.clone()).validate().is_err());

            form["mqtt-topic"] = json!("t".repeat(99));
            assert!(request(form).validate().is_ok());
        }

        #[test]
        fn rejects_port_zero() {
            let mut form = mqtt_form();
            form["mqtt-port"] = json!(0);
            assert!(request(form).validate().is_err());
        }

        #[test]
        fn rejects_refresh_rate_out_of_range() {
            let mut form = mqtt_form();
            form["refresh-rate"] = json!(0);
            assert!(request(form.clone()).validate().is_err());

            form["refresh-rate"] = json!(3601);
            assert!(request(form).validate().is_err());
        }

        #[test]
        fn rejects_unknown_mode() {
            let mut form = mqtt_form();
            form["server-mode"] = json!(9);
            assert!(serde_json::from_value::<SubmitConfigRequest>(form).is_err());
        }
    }

    mod resolved_mode {
        use super::*;

        #[test]
        fn mqtt_with_discovery_becomes_discovery_mode() {
            let mut form = mqtt_form();
            form["mqtt-ha-discovery"] = json!(true);
            assert_eq!(
                request(form).config.resolved_mode(),
                Mode::MqttWithDiscovery
            );
        }

        #[test]
        fn mqtt_without_discovery_stays_mqtt() {
            let mut form = mqtt_form();
            form["mqtt-ha-discovery"] = json!(false);
            assert_eq!(request(form).config.resolved_mode(), Mode::Mqtt);
        }

        #[test]
        fn discovery_flag_ignored_for_other_modes() {
            let mut form = mqtt_form();
            form["server-mode"] = json!(1);
            form["mqtt-ha-discovery"] = json!(true);
            assert_eq!(request(form).config.resolved_mode(), Mode::Http);
        }
    }

    mod payload {
        use super::*;

        #[test]
        fn unedited_secrets_are_omitted() {
            let payload = request(mqtt_form()).payload().unwrap();

            assert!(!payload.contains_key("wifi-password"));
            assert!(!payload.contains_key("mqtt-password"));
            assert_eq!(payload["wifi-ssid"], json!("home"));
            assert_eq!(payload["mqtt-port"], json!(1883));
        }

        #[test]
        fn edited_secrets_are_sent() {
            let mut form = mqtt_form();
            form["edited"] = json!(["mqtt-password"]);
            let payload = request(form).payload().unwrap();

            assert_eq!(payload["mqtt-password"], json!("hunter2"));
            assert!(!payload.contains_key("wifi-password"));
        }

        #[test]
        fn server_mode_carries_resolved_mode() {
            let mut form = mqtt_form();
            form["mqtt-ha-discovery"] = json!(true);
            let payload = request(form).payload().unwrap();

            assert_eq!(payload["server-mode"], json!(3));
        }

        #[test]
        fn absent_fields_are_not_sent() {
            let payload = request(json!({ "wifi-ssid": "home", "server-mode": 1 }))
                .payload()
                .unwrap();

            assert_eq!(payload.len(), 2);
            assert!(!payload.contains_key("edited"));
        }
    }

    mod submit {
        use super::*;
        use anyhow::anyhow;

        /// Device recording submitted payloads, optionally refusing them
        #[derive(Default)]
        struct RecordingDevice {
            refuse: bool,
            submitted: Mutex<Vec<Map<String, Value>>>,
        }

        impl DeviceClient for RecordingDevice {
            async fn run_test(&self, _test_id: u32, _timeout: Duration) -> AttemptOutcome {
                AttemptOutcome::Success
            }

            async fn submit_config(&self, payload: Map<String, Value>) -> Result<()> {
                if self.refuse {
                    return Err(anyhow!("POST /config failed with status 500"));
                }
                self.submitted.lock().unwrap().push(payload);
                Ok(())
            }

            async fn current_config(&self) -> Result<Value> {
                Ok(Value::Null)
            }

            async fn wifi_scan(&self) -> Result<WifiScan> {
                Ok(WifiScan::default())
            }

            async fn reboot(&self) -> Result<()> {
                Ok(())
            }
        }

        fn validation(device: &Arc<RecordingDevice>) -> ValidationService<RecordingDevice> {
            ValidationService::new(device.clone(), TestCatalog::default(), Duration::ZERO)
        }

        #[tokio::test]
        async fn starts_run_for_resolved_mode() {
            let device = Arc::new(RecordingDevice::default());
            let validation = validation(&device);
            let mut form = mqtt_form();
            form["mqtt-ha-discovery"] = json!(true);

            let started = ProvisioningService::submit(&*device, &validation, &request(form))
                .await
                .unwrap();

            assert_eq!(started.mode, Mode::MqttWithDiscovery);
            assert_eq!(device.submitted.lock().unwrap().len(), 1);
            let state = validation.snapshot().state.unwrap();
            assert_eq!(state.run_id, started.run_id);
            assert_eq!(state.mode, Mode::MqttWithDiscovery);
        }

        #[tokio::test]
        async fn invalid_form_is_not_submitted() {
            let device = Arc::new(RecordingDevice::default());
            let validation = validation(&device);
            let mut form = mqtt_form();
            form["wifi-ssid"] = json!("");

            let result = ProvisioningService::submit(&*device, &validation, &request(form)).await;

            assert!(result.is_err());
            assert!(device.submitted.lock().unwrap().is_empty());
            assert!(validation.snapshot().state.is_none());
        }

        #[tokio::test]
        async fn refused_submission_starts_no_run() {
            let device = Arc::new(RecordingDevice {
                refuse: true,
                ..Default::default()
            });
            let validation = validation(&device);

            let result =
                ProvisioningService::submit(&*device, &validation, &request(mqtt_form())).await;

            assert!(
                format!("{:#}", result.unwrap_err()).contains("failed to submit config")
            );
            assert!(validation.snapshot().state.is_none());
        }
    }
}
