pub mod validation;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_ENV: &str = "AGENTSTREAM_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_MODEL_ID: &str = "global.amazon.nova-2-lite-v1:0";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: String::new(),
            body_limit_bytes: default_body_limit_bytes(),
            runtime_worker_threads: None,
        }
    }
}

/// Managed agent runtime the chat stream is proxied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub arn: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    #[serde(default, skip_serializing)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_model_id")]
    pub default_model_id: String,
}

fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_pool_max_idle_per_host() -> usize {
    16
}
fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

impl RuntimeConfig {
    /// Base URL of the runtime data plane, derived from the region when no
    /// explicit endpoint is configured.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        match self.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => endpoint.trim_end_matches('/').to_string(),
            _ => format!("https://bedrock-agentcore.{}.amazonaws.com", self.region),
        }
    }
}

/// Guardrail settings forwarded with every invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            id: None,
            version: None,
            enabled: true,
        }
    }
}

/// Backend used for usage and guardrail records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::File => write!(f, "file"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_usage_table")]
    pub usage_table: String,
    #[serde(default = "default_guardrail_table")]
    pub guardrail_table: String,
    #[serde(default = "default_feedback_table")]
    pub feedback_table: String,
}

fn default_usage_table() -> String {
    "usage-records".to_string()
}
fn default_guardrail_table() -> String {
    "guardrail-violations".to_string()
}
fn default_feedback_table() -> String {
    "feedback-records".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: None,
            usage_table: default_usage_table(),
            guardrail_table: default_guardrail_table(),
            feedback_table: default_feedback_table(),
        }
    }
}

/// Identity contract with the fronting auth layer.
///
/// Token validation happens upstream of this service; requests arrive with
/// the verified user id (and optionally email) in trusted headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_dev_user_id")]
    pub dev_user_id: String,
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,
    #[serde(default = "default_user_email_header")]
    pub user_email_header: String,
}

fn default_dev_user_id() -> String {
    "dev-user-001".to_string()
}
fn default_user_id_header() -> String {
    "x-user-id".to_string()
}
fn default_user_email_header() -> String {
    "x-user-email".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            dev_user_id: default_dev_user_id(),
            user_id_header: default_user_id_header(),
            user_email_header: default_user_email_header(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub guardrail: GuardrailConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Config file path, honouring [`CONFIG_PATH_ENV`].
#[must_use]
pub fn config_path_from_env() -> String {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}
