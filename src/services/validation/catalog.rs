use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fmt, time::Duration};

/// Transport configuration the device runs with.
///
/// Discriminants match the `server-mode` values understood by the device firmware.
#[derive(Clone, Copy, Debug, Deserialize_repr, Eq, Hash, PartialEq, Serialize_repr)]
#[repr(u8)]
pub enum Mode {
    Http = 1,
    Mqtt = 2,
    MqttWithDiscovery = 3,
    Zigbee = 4,
    Tuya = 5,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Http => write!(f, "http"),
            Mode::Mqtt => write!(f, "mqtt"),
            Mode::MqttWithDiscovery => write!(f, "mqtt with discovery"),
            Mode::Zigbee => write!(f, "zigbee"),
            Mode::Tuya => write!(f, "tuya"),
        }
    }
}

/// One validation step executed remotely on the device.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub id: u32,
    pub label: String,
    pub applicable_modes: Vec<Mode>,
    pub hidden: bool,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub continue_on_failure: bool,
}

impl TestDefinition {
    const DEFAULT_TIMEOUT_MS: u64 = 10_000;
    const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(id: u32, label: impl Into<String>, applicable_modes: &[Mode]) -> Self {
        Self {
            id,
            label: label.into(),
            applicable_modes: applicable_modes.to_vec(),
            hidden: false,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            continue_on_failure: false,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Upper bound of device requests issued for this test.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn applies_to(&self, mode: Mode) -> bool {
        self.applicable_modes.contains(&mode)
    }
}

/// Fixed, ordered list of test definitions.
///
/// Order encodes dependencies between tests: a network has to be joined before
/// it can be verified, and verified before a transport endpoint can be reached.
#[derive(Clone, Debug)]
pub struct TestCatalog {
    definitions: Vec<TestDefinition>,
}

impl TestCatalog {
    pub fn new(definitions: Vec<TestDefinition>) -> Self {
        Self { definitions }
    }

    pub fn definitions(&self) -> &[TestDefinition] {
        &self.definitions
    }

    /// Visible tests that apply to `mode`, in catalog order.
    pub fn applicable_tests(&self, mode: Mode) -> Vec<TestDefinition> {
        self.positioned_tests(mode)
            .into_iter()
            .map(|(_, definition)| definition)
            .collect()
    }

    /// Same as [`Self::applicable_tests`], paired with each test's catalog position.
    ///
    /// Positions count hidden tests and tests of other modes, so a test keeps
    /// its number whatever the mode.
    pub fn positioned_tests(&self, mode: Mode) -> Vec<(usize, TestDefinition)> {
        self.definitions
            .iter()
            .enumerate()
            .filter(|(_, definition)| !definition.hidden && definition.applies_to(mode))
            .map(|(position, definition)| (position, definition.clone()))
            .collect()
    }
}

impl Default for TestCatalog {
    fn default() -> Self {
        use Mode::*;

        let wifi_modes = [Http, Mqtt, MqttWithDiscovery, Tuya];
        let mqtt_modes = [Mqtt, MqttWithDiscovery];

        Self::new(vec![
            TestDefinition::new(0, "Prepare device", &wifi_modes)
                .hidden()
                .with_continue_on_failure(true),
            TestDefinition::new(1, "Connect to WiFi network", &wifi_modes)
                .with_timeout_ms(2_000)
                .with_max_retries(10),
            TestDefinition::new(2, "Test WiFi network", &wifi_modes)
                .with_continue_on_failure(true),
            TestDefinition::new(3, "Connect to MQTT server", &mqtt_modes),
            TestDefinition::new(4, "Publish MQTT data", &mqtt_modes)
                .with_continue_on_failure(true),
            TestDefinition::new(5, "Connect to Tuya", &[Tuya]).with_max_retries(1),
        ])
    }
}
