use anyhow::{Context, Result, bail, ensure};
use reqwest::Url;
use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// UI server configuration
    pub ui: UiConfig,

    /// Device connection configuration
    pub device: DeviceConfig,

    /// Validation run configuration
    pub validation: ValidationConfig,

    /// TLS certificate configuration, plain HTTP if unset
    pub certificate: Option<CertificateConfig>,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub base_url: Url,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ValidationConfig {
    pub poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct CertificateConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// On first call the configuration is loaded from environment variables,
    /// subsequent calls return the cached instance.
    pub fn get() -> Result<&'static Self> {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

        if let Some(config) = APP_CONFIG.get() {
            return Ok(config);
        }

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        Ok(APP_CONFIG.get_or_init(|| config))
    }

    /// Load configuration from `lookup`, which maps a variable name to its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            ui: UiConfig::load(&lookup)?,
            device: DeviceConfig::load(&lookup)?,
            validation: ValidationConfig::load(&lookup)?,
            certificate: CertificateConfig::load(&lookup)?,
        })
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration> {
    let millis = match lookup(key) {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("failed to parse {key}: invalid format"))?,
        None => default,
    };

    Ok(Duration::from_millis(millis))
}

impl UiConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = lookup("UI_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse::<u16>()
            .context("failed to parse UI_PORT: invalid format")?;

        Ok(Self { port })
    }
}

impl DeviceConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup("DEVICE_URL")
            .unwrap_or_else(|| "http://4.3.2.1".to_string())
            .parse::<Url>()
            .context("failed to parse DEVICE_URL: invalid url")?;

        let request_timeout = parse_millis(lookup, "DEVICE_REQUEST_TIMEOUT_MS", 10_000)?;
        ensure!(
            !request_timeout.is_zero(),
            "failed to parse DEVICE_REQUEST_TIMEOUT_MS: must not be zero"
        );

        Ok(Self {
            base_url,
            request_timeout,
        })
    }
}

impl ValidationConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let poll_interval = parse_millis(lookup, "POLL_INTERVAL_MS", 2_000)?;

        Ok(Self { poll_interval })
    }
}

impl CertificateConfig {
    fn load(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        match (lookup("CERT_PATH"), lookup("KEY_PATH")) {
            (Some(cert_path), Some(key_path)) => Ok(Some(Self {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            })),
            (None, None) => Ok(None),
            _ => bail!(
                "failed to load certificate config: CERT_PATH and KEY_PATH must be set together"
            ),
        }
    }
}
