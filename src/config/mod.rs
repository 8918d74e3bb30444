// envbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::AppError;

pub const DEFAULT_TEMP_ROOT: &str = "/tmp";
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;
const DEFAULT_ENVIRONMENTS: &[&str] = &["staging", "production"];

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonEnvironmentConfig {
    pub backup_bucket: Option<String>,
    pub db_name: Option<String>,
    pub storage_target: Option<String>,
    pub project_id: Option<String>,
    pub instance_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JsonStorageConfig {
    S3 {
        region: Option<String>,
        endpoint_url: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
    Filesystem {
        root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTransferConfig {
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonPollingConfig {
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub create_if_missing: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub environments: HashMap<String, JsonEnvironmentConfig>,
    pub file_transport: Option<FileTransportKind>,
    pub storage: Option<JsonStorageConfig>,
    pub transfer: Option<JsonTransferConfig>,
    pub polling: Option<JsonPollingConfig>,
    pub database: Option<JsonDatabaseConfig>,
    pub temp_root: Option<PathBuf>,
}

/// How live file trees are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransportKind {
    HostSync,
    ObjectStore,
}

impl FileTransportKind {
    fn parse(value: &str) -> std::result::Result<Self, AppError> {
        match value.trim() {
            "host_sync" => Ok(FileTransportKind::HostSync),
            "object_store" => Ok(FileTransportKind::ObjectStore),
            other => Err(AppError::Config(format!(
                "unknown file transport '{}', expected host_sync or object_store",
                other
            ))),
        }
    }
}

/// Identifies one logical environment. Never mutated after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub backup_bucket: String,
    pub db_name: String,
    pub storage_target: String,
    pub project_id: String,
    pub instance_ref: String,
}

impl EnvironmentConfig {
    fn from_json(name: &str, raw: &JsonEnvironmentConfig) -> std::result::Result<Self, AppError> {
        Ok(EnvironmentConfig {
            backup_bucket: required(name, "backup_bucket", &raw.backup_bucket)?,
            db_name: required(name, "db_name", &raw.db_name)?,
            storage_target: required(name, "storage_target", &raw.storage_target)?,
            project_id: required(name, "project_id", &raw.project_id)?,
            instance_ref: required(name, "instance_ref", &raw.instance_ref)?,
        })
    }
}

fn required(
    environment: &str,
    field: &str,
    value: &Option<String>,
) -> std::result::Result<String, AppError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::Config(format!(
                "missing configuration {} for environment '{}'",
                field, environment
            ))
        })
}

/// Process-wide lookup of environments by name, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    environments: HashMap<String, Arc<EnvironmentConfig>>,
}

impl EnvironmentRegistry {
    pub fn new(environments: HashMap<String, EnvironmentConfig>) -> Self {
        Self {
            environments: environments
                .into_iter()
                .map(|(name, cfg)| (name, Arc::new(cfg)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> std::result::Result<Arc<EnvironmentConfig>, AppError> {
        self.environments
            .get(name)
            .cloned()
            .ok_or_else(|| {
                AppError::Config(format!(
                    "unknown environment: {} (configured: {})",
                    name,
                    self.names().join(", ")
                ))
            })
    }

    /// Environment names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.environments.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnvironmentConfig)> {
        self.environments
            .iter()
            .map(|(name, cfg)| (name.as_str(), cfg.as_ref()))
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq)]
pub enum StorageConfig {
    S3(S3Config),
    Filesystem { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollingConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub deadline: Option<Duration>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            deadline: Some(Duration::from_secs(6 * 60 * 60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub registry: EnvironmentRegistry,
    pub file_transport: FileTransportKind,
    pub storage: StorageConfig,
    pub max_concurrency: usize,
    pub polling: PollingConfig,
    pub create_database_if_missing: bool,
    pub temp_root: PathBuf,
}

impl AppConfig {
    /// Loads `config_path` when it exists, otherwise falls back to environment variables.
    pub fn load(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load_from_json(config_path)
        } else {
            // .env is optional
            let _ = dotenv::dotenv();
            Self::from_env_vars(|key| std::env::var(key).ok())
                .context("Failed to load configuration from environment variables")
        }
    }

    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;
        Self::from_raw(raw_json_config)
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        if raw.environments.is_empty() {
            anyhow::bail!(AppError::Config("no environments configured".to_string()));
        }
        let mut environments = HashMap::new();
        for (name, env_raw) in &raw.environments {
            environments.insert(name.clone(), EnvironmentConfig::from_json(name, env_raw)?);
        }

        let storage = match raw.storage {
            Some(JsonStorageConfig::S3 {
                region,
                endpoint_url,
                access_key_id,
                secret_access_key,
            }) => StorageConfig::S3(S3Config {
                region: non_empty(region).unwrap_or_else(|| "us-east-1".to_string()),
                endpoint_url: non_empty(endpoint_url),
                access_key_id: non_empty(access_key_id),
                secret_access_key: non_empty(secret_access_key),
            }),
            Some(JsonStorageConfig::Filesystem { root }) => StorageConfig::Filesystem {
                root: root.filter(|r| !r.as_os_str().is_empty()).ok_or_else(|| {
                    AppError::Config("storage.root must be set for filesystem storage".to_string())
                })?,
            },
            None => anyhow::bail!(AppError::Config("storage section is missing".to_string())),
        };

        let polling_raw = raw.polling.unwrap_or_default();
        let defaults = PollingConfig::default();
        let polling = PollingConfig {
            initial_interval: polling_raw
                .initial_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_interval),
            max_interval: polling_raw
                .max_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_interval),
            multiplier: polling_raw.multiplier.unwrap_or(defaults.multiplier),
            // 0 disables the deadline
            deadline: match polling_raw.deadline_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.deadline,
            },
        };
        if polling.initial_interval.is_zero() || polling.max_interval.is_zero() {
            anyhow::bail!(AppError::Config(
                "polling intervals must be greater than zero".to_string()
            ));
        }
        if polling.multiplier < 1.0 {
            anyhow::bail!(AppError::Config(
                "polling.multiplier must be at least 1.0".to_string()
            ));
        }

        let max_concurrency = raw
            .transfer
            .and_then(|t| t.max_concurrency)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);
        if max_concurrency == 0 {
            anyhow::bail!(AppError::Config(
                "transfer.max_concurrency must be greater than zero".to_string()
            ));
        }

        Ok(AppConfig {
            registry: EnvironmentRegistry::new(environments),
            file_transport: raw.file_transport.unwrap_or(FileTransportKind::HostSync),
            storage,
            max_concurrency,
            polling,
            create_database_if_missing: raw
                .database
                .and_then(|d| d.create_if_missing)
                .unwrap_or(true),
            temp_root: raw
                .temp_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_ROOT)),
        })
    }

    /// Builds the configuration from `ENVIRONMENTS`, `BACKUP_BUCKET`, `DB_NAME_<ENV>` and friends.
    pub fn from_env_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment_names: Vec<String> = match lookup("ENVIRONMENTS") {
            Some(list) if !list.trim().is_empty() => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => DEFAULT_ENVIRONMENTS.iter().map(|s| s.to_string()).collect(),
        };

        let mut environments = HashMap::new();
        for env in &environment_names {
            let upper = env.to_uppercase();
            let field = |name: &str, var: String| -> std::result::Result<Option<String>, AppError> {
                match non_empty(lookup(&var)) {
                    Some(value) => Ok(Some(value)),
                    None => Err(AppError::Config(format!(
                        "missing configuration {} for environment '{}' (set {})",
                        name, env, var
                    ))),
                }
            };
            let raw = JsonEnvironmentConfig {
                backup_bucket: field("backup_bucket", "BACKUP_BUCKET".to_string())?,
                db_name: field("db_name", format!("DB_NAME_{}", upper))?,
                storage_target: field("storage_target", format!("STORAGE_TARGET_{}", upper))?,
                project_id: field("project_id", "PROJECT_ID".to_string())?,
                instance_ref: field("instance_ref", format!("DB_INSTANCE_{}", upper))?,
            };
            environments.insert(env.clone(), raw);
        }

        let storage = match non_empty(lookup("STORAGE_ROOT")) {
            Some(root) => JsonStorageConfig::Filesystem {
                root: Some(PathBuf::from(root)),
            },
            None => JsonStorageConfig::S3 {
                region: lookup("S3_REGION"),
                endpoint_url: lookup("S3_ENDPOINT_URL"),
                access_key_id: lookup("S3_ACCESS_KEY_ID"),
                secret_access_key: lookup("S3_SECRET_ACCESS_KEY"),
            },
        };

        let file_transport = match non_empty(lookup("FILE_TRANSPORT")) {
            Some(value) => Some(FileTransportKind::parse(&value)?),
            None => None,
        };

        let max_concurrency = match non_empty(lookup("TRANSFER_MAX_CONCURRENCY")) {
            Some(value) => Some(value.parse::<usize>().with_context(|| {
                format!("TRANSFER_MAX_CONCURRENCY must be a positive integer, got '{}'", value)
            })?),
            None => None,
        };

        Self::from_raw(RawJsonConfig {
            environments,
            file_transport,
            storage: Some(storage),
            transfer: Some(JsonTransferConfig { max_concurrency }),
            polling: None,
            database: None,
            temp_root: non_empty(lookup("TEMP_ROOT")).map(PathBuf::from),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
