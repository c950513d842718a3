use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub generation: Generation,
    #[serde(default)]
    pub mediation: Mediation,
    pub journal: Journal,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub mode: String,
    pub endpoint: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    pub timeout_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failures: u64,
    #[serde(default = "default_circuit_breaker_open_ms")]
    pub circuit_breaker_open_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mediation {
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: usize,
    #[serde(default = "default_checkpoint_retry_attempts")]
    pub checkpoint_retry_attempts: u32,
    #[serde(default = "default_checkpoint_retry_backoff_ms")]
    pub checkpoint_retry_backoff_ms: u64,
}

impl Default for Mediation {
    fn default() -> Self {
        Self {
            max_write_attempts: default_max_write_attempts(),
            checkpoint_retry_attempts: default_checkpoint_retry_attempts(),
            checkpoint_retry_backoff_ms: default_checkpoint_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    pub jsonl_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_api_key_env() -> String {
    "WOMBAT_GENERATION_API_KEY".to_string()
}

fn default_retry_max_attempts() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    0
}

fn default_circuit_breaker_failures() -> u64 {
    5
}

fn default_circuit_breaker_open_ms() -> u64 {
    30_000
}

fn default_max_write_attempts() -> usize {
    5
}

fn default_checkpoint_retry_attempts() -> u32 {
    5
}

fn default_checkpoint_retry_backoff_ms() -> u64 {
    250
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    match cfg.generation.mode.as_str() {
        "disabled" => {}
        "http" => {
            if cfg
                .generation
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "generation.endpoint is required when generation.mode=http".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "generation.mode={other} is not implemented; supported: http, disabled"
            )))
        }
    }
    if cfg.generation.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "generation.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.generation.circuit_breaker_failures == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "generation.circuit_breaker_failures must be >= 1".to_string(),
        ));
    }
    if cfg.generation.circuit_breaker_open_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "generation.circuit_breaker_open_ms must be >= 1".to_string(),
        ));
    }
    if cfg.mediation.max_write_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "mediation.max_write_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.mediation.checkpoint_retry_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "mediation.checkpoint_retry_attempts must be >= 1".to_string(),
        ));
    }
    Ok(())
}
