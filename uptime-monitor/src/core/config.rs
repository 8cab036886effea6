/*!
Configuration management for the uptime monitor
*/

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Which preset the remaining defaults come from
    pub environment: Environment,
    /// Record store settings
    pub store: StoreConfig,
    /// Per-account limits
    pub limits: LimitsConfig,
    /// Password hashing settings
    pub credentials: CredentialsConfig,
    /// Background maintenance settings
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Staging,
    Production,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory holding one sub-directory per collection
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of checks a single account may own
    pub max_checks: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Secret the process-wide hashing key is derived from
    pub hashing_secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Seconds between maintenance passes
    pub interval_secs: u64,
    /// Whether the binary runs maintenance at all
    pub enabled: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Staging)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join("uptime-monitor").join(".data"))
            .unwrap_or_else(|| PathBuf::from("./.data"));
        Self { data_dir }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_checks: 5 }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            hashing_secret: "thisIsASecret".to_string(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            enabled: true,
        }
    }
}

impl ServiceConfig {
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            store: StoreConfig::default(),
            limits: LimitsConfig::default(),
            credentials: CredentialsConfig::default(),
            maintenance: MaintenanceConfig::default(),
        };

        if environment == Environment::Production {
            config.credentials.hashing_secret = "thisIsAlsoASecret".to_string();
            config.maintenance.interval_secs = 300;
        }

        config
    }

    /// Parse a TOML configuration; missing sections fall back to defaults
    pub fn from_toml(content: &str) -> ServiceResult<Self> {
        toml::from_str(content)
            .map_err(|e| ServiceError::InvalidInput(format!("Invalid configuration: {}", e.message())))
    }

    pub async fn from_file<P: AsRef<Path>>(path: P) -> ServiceResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| ServiceError::Internal(format!("could not read configuration: {e}")))?;
        Self::from_toml(&content)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(ServiceError::InvalidInput(format!("Unknown environment {other:?}"))),
        }
    }
}
