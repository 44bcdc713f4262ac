use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::net::DEFAULT_TIMEOUT;
use crate::storage::DEFAULT_CACHE_PATH;
use crate::types::{SortOrder, TelemetryFilter, DEFAULT_LIMIT};
use crate::variant::{ApiVariant, Backend, LatestStrategy, TELEMETRY_RESOURCE};

const CONFIG_FILE_NAME: &str = "telemetry_config.json";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub api_variant: ApiVariant,
    /// Resource path for the telemetry backend. Ignored by sensor-data.
    pub telemetry_path: String,
    pub request_timeout_ms: u64,
    pub default_limit: usize,
    pub sort_order: SortOrder,
    /// `None` picks the backend's default.
    pub latest_strategy: Option<LatestStrategy>,
    pub cache_path: PathBuf,
    pub refresh_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub filter_tag: Option<String>,
    pub filter_from: Option<String>,
    pub filter_to: Option<String>,
    pub rust_log: String,
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            api_variant: ApiVariant::SensorData,
            telemetry_path: TELEMETRY_RESOURCE.to_string(),
            request_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            default_limit: DEFAULT_LIMIT,
            sort_order: SortOrder::Desc,
            latest_strategy: None,
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            refresh_interval_secs: 30,
            health_check_interval_secs: 60,
            filter_tag: None,
            filter_from: None,
            filter_to: None,
            rust_log: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// The config file when one exists, otherwise the environment.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_file_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Self::from_env()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset numeric variables fall
    /// back to their defaults; unrecognised enum values are rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_variant = parse_var(&get, "API_VARIANT")?.unwrap_or(defaults.api_variant);
        let sort_order = parse_var(&get, "SORT_ORDER")?.unwrap_or(defaults.sort_order);
        let latest_strategy = parse_var(&get, "LATEST_STRATEGY")?;

        Ok(Config {
            api_base_url: get("API_BASE_URL").unwrap_or(defaults.api_base_url),
            api_variant,
            telemetry_path: get("TELEMETRY_PATH").unwrap_or(defaults.telemetry_path),
            request_timeout_ms: get_env_var_u64(&get, "REQUEST_TIMEOUT_MS", defaults.request_timeout_ms),
            default_limit: get_env_var_u64(&get, "DEFAULT_LIMIT", defaults.default_limit as u64) as usize,
            sort_order,
            latest_strategy,
            cache_path: get("CACHE_PATH").map(PathBuf::from).unwrap_or(defaults.cache_path),
            refresh_interval_secs: get_env_var_u64(&get, "REFRESH_INTERVAL_SECS", defaults.refresh_interval_secs),
            health_check_interval_secs: get_env_var_u64(
                &get,
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
            filter_tag: get("FILTER_TAG"),
            filter_from: get("FILTER_FROM"),
            filter_to: get("FILTER_TO"),
            rust_log: get("RUST_LOG").unwrap_or(defaults.rust_log),
            log_format: get("LOG_FORMAT").unwrap_or(defaults.log_format),
        })
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join(CONFIG_FILE_NAME)
    }

    pub fn load_from_file() -> Result<Self> {
        Self::load_from_path(&Self::get_config_file_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn backend(&self) -> Backend {
        match self.api_variant {
            ApiVariant::SensorData => Backend::sensor_data(),
            ApiVariant::Telemetry => Backend::telemetry(self.telemetry_path.clone()),
        }
    }

    pub fn latest_strategy(&self) -> LatestStrategy {
        self.latest_strategy
            .unwrap_or_else(|| self.backend().default_latest_strategy())
    }

    /// Filter used on start and by periodic refreshes until the user changes it.
    pub fn initial_filter(&self) -> TelemetryFilter {
        let filter = TelemetryFilter::new(self.default_limit, self.sort_order)
            .with_range(self.filter_from.clone(), self.filter_to.clone());
        match &self.filter_tag {
            Some(tag) => filter.with_tag(tag.clone()),
            None => filter,
        }
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

fn get_env_var_u64(get: impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    get(key)
        .and_then(|val| val.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_var<T>(get: impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    get(key)
        .map(|val| T::from_str(&val).map_err(|e| anyhow::anyhow!("{}: {}", key, e)))
        .transpose()
}
