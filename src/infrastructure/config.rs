use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::DEFAULT_NAMESPACE;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const SYNC_JSON: &str = "sync.json";
pub const REMOTE_API_KEY_ENV: &str = "TEMPOFY_REMOTE_API_KEY";
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SLOW_THRESHOLD_MS: u64 = 5_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub sync: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub app_name: String,
    pub timezone: Tz,
    pub namespace: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_name: "Tempofy".to_string(),
            timezone: Tz::UTC,
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub timeout_ms: u64,
    pub slow_threshold_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            api_key: None,
            user_id: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            slow_threshold_ms: DEFAULT_SLOW_THRESHOLD_MS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

impl RemoteConfig {
    /// Remote sync runs only when switched on and fully addressed.
    pub fn is_usable(&self) -> bool {
        self.enabled && self.base_url.is_some() && self.api_key.is_some()
    }
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "Tempofy",
                "timezone": "UTC",
                "namespace": DEFAULT_NAMESPACE
            }),
        ),
        (
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "enabled": false,
                "baseUrl": null,
                "userId": null,
                "timeoutMs": DEFAULT_TIMEOUT_MS,
                "slowThresholdMs": DEFAULT_SLOW_THRESHOLD_MS,
                "retry": {
                    "maxAttempts": DEFAULT_RETRY_MAX_ATTEMPTS,
                    "baseDelayMs": DEFAULT_RETRY_BASE_DELAY_MS
                }
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        sync: read_config(&config_dir.join(SYNC_JSON))?,
    })
}

fn non_empty_str<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn positive_u64(value: &serde_json::Value, key: &str) -> Option<u64> {
    value
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
}

pub fn parse_timezone(value: &str) -> Result<Tz, InfraError> {
    value
        .trim()
        .parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{value}': {error}")))
}

pub fn read_app_settings(config_dir: &Path) -> Result<AppSettings, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    let defaults = AppSettings::default();
    let timezone = match non_empty_str(&app, "timezone") {
        Some(value) => parse_timezone(value)?,
        None => defaults.timezone,
    };
    Ok(AppSettings {
        app_name: non_empty_str(&app, "appName")
            .map(ToOwned::to_owned)
            .unwrap_or(defaults.app_name),
        timezone,
        namespace: non_empty_str(&app, "namespace")
            .map(ToOwned::to_owned)
            .unwrap_or(defaults.namespace),
    })
}

pub fn read_remote_config(config_dir: &Path) -> Result<RemoteConfig, InfraError> {
    read_remote_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

pub fn read_remote_config_with_lookup<F>(
    config_dir: &Path,
    lookup: F,
) -> Result<RemoteConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let sync = read_config(&config_dir.join(SYNC_JSON))?;
    let defaults = RemoteConfig::default();
    let retry = sync.get("retry").cloned().unwrap_or_default();

    let base_url = non_empty_str(&sync, "baseUrl")
        .map(|value| value.trim_end_matches('/').to_string());
    if let Some(base_url) = base_url.as_deref() {
        url::Url::parse(base_url).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid sync baseUrl '{base_url}': {error}"))
        })?;
    }

    Ok(RemoteConfig {
        enabled: sync
            .get("enabled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(defaults.enabled),
        base_url,
        api_key: lookup(REMOTE_API_KEY_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        user_id: non_empty_str(&sync, "userId").map(ToOwned::to_owned),
        timeout_ms: positive_u64(&sync, "timeoutMs").unwrap_or(defaults.timeout_ms),
        slow_threshold_ms: positive_u64(&sync, "slowThresholdMs")
            .unwrap_or(defaults.slow_threshold_ms),
        retry_max_attempts: positive_u64(&retry, "maxAttempts")
            .map(|value| value.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(defaults.retry_max_attempts),
        retry_base_delay_ms: retry
            .get("baseDelayMs")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(defaults.retry_base_delay_ms),
    })
}
