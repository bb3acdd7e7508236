use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::secrets::{expand_home, resolve_secret};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_data_directory")]
    pub data_directory: String,
    /// SQLite file for durable job records. Jobs live in memory only when unset.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

fn default_data_directory() -> String {
    "~/.fieldmill/data".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    num_cpus::get()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            data_directory: default_data_directory(),
            database: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            log_level: default_log_level(),
            provider: ProviderConfig::default(),
            aggregation: AggregationConfig::default(),
        }
    }
}

impl Config {
    /// Data directory with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.data_directory))
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.database
            .as_deref()
            .map(|path| PathBuf::from(expand_home(path)))
    }
}

/// Settings for the Gemini inference provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sampling seed sent with every request so reruns stay comparable.
    #[serde(default = "default_seed")]
    pub seed: i64,
    /// Documents above this size are rejected instead of sent inline.
    #[serde(default = "default_inline_size_limit_mb")]
    pub inline_size_limit_mb: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: Option<String>,
}

fn default_model() -> String {
    "gemini-2.5-flash-lite".to_string()
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_seed() -> i64 {
    44
}

fn default_inline_size_limit_mb() -> u64 {
    20
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_api_key_env_var() -> Option<String> {
    Some("GOOGLE_API_KEY".to_string())
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            seed: default_seed(),
            inline_size_limit_mb: default_inline_size_limit_mb(),
            timeout_secs: default_timeout_secs(),
            api_key: None,
            api_key_file: None,
            api_key_env_var: default_api_key_env_var(),
        }
    }
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> Result<SecretString, ConfigError> {
        Ok(resolve_secret(
            self.api_key.as_deref(),
            self.api_key_file.as_deref(),
            self.api_key_env_var.as_deref(),
        )?)
    }
}

/// Columns the aggregator groups and labels rows by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default = "default_name_field")]
    pub name_field: String,
}

fn default_key_field() -> String {
    "country_alpha_3_code".to_string()
}

fn default_name_field() -> String {
    "country".to_string()
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            key_field: default_key_field(),
            name_field: default_name_field(),
        }
    }
}
