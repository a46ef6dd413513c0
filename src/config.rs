//! Server configuration
//!
//! Sources are layered: built-in defaults, then an optional YAML file, then
//! environment variables. Command-line flags are applied last by the binary.

use crate::policy::{Allowlist, AllowlistError};
use crate::runner::MAX_OUTPUT_BYTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Secret shipped as the default; refused in production
pub const DEFAULT_JWT_SECRET: &str = "your-secret-key";

/// Environment variable naming the config file
pub const CONFIG_FILE_ENV: &str = "REMOTE_ADMIN_CONFIG";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("JWT_SECRET must be changed from the default in production")]
    InsecureSecret,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Runtime settings for the HTTP server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub jwt_secret: String,
    pub app_env: String,
    pub require_auth: bool,
    pub allowlist_file: Option<PathBuf>,
    pub exec_timeout_secs: u64,
    pub service_timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            app_env: "development".to_string(),
            require_auth: true,
            allowlist_file: None,
            exec_timeout_secs: 5,
            service_timeout_secs: 30,
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }
}

impl ServerConfig {
    /// Defaults, then `path` (if any), then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a YAML file; keys missing from it keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from environment-style lookups
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = parse("PORT", &port)?;
        }
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.jwt_secret = secret;
        }
        if let Some(env) = lookup("APP_ENV") {
            self.app_env = env;
        }
        if let Some(flag) = lookup("REQUIRE_AUTH") {
            self.require_auth = parse_bool("REQUIRE_AUTH", &flag)?;
        }
        if let Some(path) = lookup("ALLOWLIST_FILE") {
            self.allowlist_file = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(secs) = lookup("EXEC_TIMEOUT_SECS") {
            self.exec_timeout_secs = parse("EXEC_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("SERVICE_TIMEOUT_SECS") {
            self.service_timeout_secs = parse("SERVICE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(bytes) = lookup("MAX_OUTPUT_BYTES") {
            self.max_output_bytes = parse("MAX_OUTPUT_BYTES", &bytes)?;
        }
        Ok(())
    }

    /// Reject settings the server must not start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exec_timeout_secs == 0 {
            return Err(ConfigError::Zero("EXEC_TIMEOUT_SECS"));
        }
        if self.service_timeout_secs == 0 {
            return Err(ConfigError::Zero("SERVICE_TIMEOUT_SECS"));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Zero("MAX_OUTPUT_BYTES"));
        }

        if self.require_auth {
            if self.jwt_secret.is_empty() {
                return Err(ConfigError::InsecureSecret);
            }
            if self.jwt_secret == DEFAULT_JWT_SECRET {
                if self.is_production() {
                    return Err(ConfigError::InsecureSecret);
                }
                warn!("Using the default JWT secret; set JWT_SECRET before deploying");
            }
        } else {
            warn!("Authentication is disabled; every route is open to any caller");
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    /// The configured allowlist, or the built-in one
    pub fn load_allowlist(&self) -> Result<Allowlist, AllowlistError> {
        match &self.allowlist_file {
            Some(path) => Allowlist::load(path),
            None => Ok(Allowlist::default()),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
