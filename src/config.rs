use std::time::Duration;

use crate::error::ConfigError;
use crate::utils::get_env;

pub const DEFAULT_FILE_SERVER_PORT: &str = "8080";
pub const DEFAULT_FILE_SERVER_PATH: &str = "./uploads";
pub const DEFAULT_API_SERVER_PORT: &str = "8081";
pub const DEFAULT_VLLM_BASE_URL: &str = "http://localhost:8001";
pub const DEFAULT_VLLM_PROMPT: &str = "Please detect the content of this image.";
pub const DEFAULT_BODY_LIMIT_MB: &str = "32";
pub const DEFAULT_VLLM_TIMEOUT_SECS: &str = "60";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Deployment parameters, read once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub file_server_port: String,
    pub file_server_path: String,
    /// `host[:port]` embedded in the public URLs of uploaded files.
    pub file_server_host: String,
    pub api_server_port: String,
    pub vllm_base_url: String,
    /// May be empty; the inference service then picks its served model.
    pub vllm_model: String,
    pub vllm_prompt: String,
    pub vllm_timeout_secs: String,
    pub body_limit_mb: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(get_env)
    }

    /// Builds the configuration from an arbitrary key lookup. `None` selects the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let file_server_port = get("FILE_SERVER_PORT", DEFAULT_FILE_SERVER_PORT);
        let file_server_host = lookup("FILE_SERVER_HOST")
            .unwrap_or_else(|| format!("localhost:{}", file_server_port));

        Config {
            file_server_path: get("FILE_SERVER_PATH", DEFAULT_FILE_SERVER_PATH),
            api_server_port: get("API_SERVER_PORT", DEFAULT_API_SERVER_PORT),
            vllm_base_url: get("VLLM_BASE_URL", DEFAULT_VLLM_BASE_URL),
            vllm_model: get("VLLM_MODEL", ""),
            vllm_prompt: get("VLLM_PROMPT", DEFAULT_VLLM_PROMPT),
            vllm_timeout_secs: get("VLLM_TIMEOUT_SECS", DEFAULT_VLLM_TIMEOUT_SECS),
            body_limit_mb: get("BODY_LIMIT_MB", DEFAULT_BODY_LIMIT_MB),
            log_level: get("LOG_LEVEL", DEFAULT_LOG_LEVEL),
            file_server_port,
            file_server_host,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require("FILE_SERVER_PORT", &self.file_server_port)?;
        require("API_SERVER_PORT", &self.api_server_port)?;
        require("VLLM_BASE_URL", &self.vllm_base_url)?;

        self.file_server_port()?;
        self.api_server_port()?;
        self.body_limit_bytes()?;
        self.vllm_timeout()?;
        Ok(())
    }

    pub fn file_server_port(&self) -> Result<u16, ConfigError> {
        parse_number("FILE_SERVER_PORT", &self.file_server_port)
    }

    pub fn api_server_port(&self) -> Result<u16, ConfigError> {
        parse_number("API_SERVER_PORT", &self.api_server_port)
    }

    pub fn body_limit_bytes(&self) -> Result<usize, ConfigError> {
        let mb: usize = parse_number("BODY_LIMIT_MB", &self.body_limit_mb)?;
        mb.checked_mul(1024 * 1024).ok_or_else(|| ConfigError::Invalid {
            key: "BODY_LIMIT_MB",
            value: self.body_limit_mb.clone(),
        })
    }

    pub fn vllm_timeout(&self) -> Result<Duration, ConfigError> {
        parse_number("VLLM_TIMEOUT_SECS", &self.vllm_timeout_secs).map(Duration::from_secs)
    }
}

fn require(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(key));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
