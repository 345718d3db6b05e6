// dumpvault/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::types::{
    BackupMode, CompressionSettings, CompressionType, ConnectionInfo, EncryptionOptions, FilterOptions,
};
use crate::utils::parse_file_permissions;

pub const CONFIG_PATH_ENV: &str = "DUMPVAULT_CONFIG";
pub const ENCRYPTION_KEY_ENV: &str = "DUMPVAULT_ENCRYPTION_KEY";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonConnection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonFilter {
    #[serde(default)]
    pub exclude_data: bool,
    #[serde(default)]
    pub exclude_system: bool,
    #[serde(default)]
    pub include_databases: Vec<String>,
    #[serde(default)]
    pub exclude_databases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonCompression {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub compression_type: Option<String>,
    pub level: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonEncryption {
    #[serde(default)]
    pub enabled: bool,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub connection: Option<JsonConnection>,
    pub hostname: Option<String>,
    pub dump_args: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub filename: Option<String>,
    pub mode: Option<String>,
    pub db_name: Option<String>,
    pub databases: Option<serde_json::Value>,
    pub total_databases_found: Option<usize>,
    pub filter: Option<JsonFilter>,
    pub compression: Option<JsonCompression>,
    pub encryption: Option<JsonEncryption>,
    pub skip_table_data: Option<Vec<String>>,
    pub save_backup_info: Option<bool>,
    pub file_permissions: Option<String>,
    pub metadata_permissions: Option<String>,
    pub exclude_user: Option<bool>,
    pub replication_user: Option<String>,
    pub ticket: Option<String>,
    pub dry_run: Option<bool>,
    pub dump_binary: Option<PathBuf>,
}

// Application's internal configuration
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub connection: ConnectionInfo,
    pub hostname: String,
    pub dump_args: String,
    pub output_dir: PathBuf,
    pub filename: Option<String>,
    pub mode: BackupMode,
    /// Target of single/primary/secondary runs; picked from the candidates when unset.
    pub db_name: Option<String>,
    pub databases: Vec<String>,
    pub total_databases_found: Option<usize>,
    pub filter: FilterOptions,
    pub compression: CompressionSettings,
    pub encryption: EncryptionOptions,
    pub skip_table_data: Vec<String>,
    pub save_backup_info: bool,
    pub file_permissions: u32,
    pub metadata_permissions: u32,
    pub exclude_user: bool,
    pub replication_user: String,
    pub ticket: String,
    pub dry_run: bool,
    pub dump_binary: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    /// `DUMPVAULT_CONFIG` if set, else `config.json` in the working directory.
    pub fn default_path() -> PathBuf {
        env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| format!("Failed to parse JSON from config file at {}", config_path.display()))?;

        Ok(AppConfig { config_path: config_path.to_path_buf(), raw_json_config })
    }
}

fn default_hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Validates the raw JSON into a typed `BackupConfig`. `mode_override` comes from the command line.
pub fn load_backup_config_from_json(raw_config: &RawJsonConfig, mode_override: Option<&str>) -> Result<BackupConfig> {
    let output_dir = raw_config
        .output_dir
        .as_ref()
        .context("output_dir must be set in config.json for backup")?
        .clone();
    if output_dir.as_os_str().is_empty() {
        anyhow::bail!("output_dir cannot be empty in config.json.");
    }

    let mode_str = mode_override
        .or(raw_config.mode.as_deref())
        .unwrap_or("combined");
    let mode: BackupMode = mode_str.parse().context("Invalid backup mode")?;

    let conn = raw_config.connection.clone().unwrap_or_default();
    let connection = ConnectionInfo {
        host: conn.host.unwrap_or_default(),
        port: conn.port.unwrap_or(0),
        user: conn.user.unwrap_or_default(),
        password: conn.password.unwrap_or_default(),
    };

    let filter = raw_config.filter.clone().unwrap_or_default();
    let filter = FilterOptions {
        exclude_data: filter.exclude_data,
        exclude_system: filter.exclude_system,
        include_databases: filter.include_databases,
        exclude_databases: filter.exclude_databases,
    };

    let compression = match &raw_config.compression {
        Some(c) => {
            let compression_type: CompressionType = c
                .compression_type
                .as_deref()
                .unwrap_or("gzip")
                .parse()
                .context("Invalid compression type")?;
            CompressionSettings {
                enabled: c.enabled && compression_type != CompressionType::None,
                compression_type,
                level: c.level.unwrap_or(6),
            }
        }
        None => CompressionSettings::disabled(),
    };

    let encryption = match &raw_config.encryption {
        Some(e) if e.enabled => {
            let key = e
                .key
                .clone()
                .filter(|k| !k.is_empty())
                .or_else(|| env::var(ENCRYPTION_KEY_ENV).ok().filter(|k| !k.is_empty()))
                .with_context(|| {
                    format!("encryption is enabled but no key is set in config.json or {}", ENCRYPTION_KEY_ENV)
                })?;
            EncryptionOptions::with_key(key)
        }
        _ => EncryptionOptions::disabled(),
    };

    Ok(BackupConfig {
        connection,
        hostname: raw_config
            .hostname
            .clone()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(default_hostname),
        dump_args: raw_config.dump_args.clone().unwrap_or_default(),
        output_dir,
        filename: raw_config.filename.clone().filter(|f| !f.trim().is_empty()),
        mode,
        db_name: raw_config.db_name.as_deref().map(str::trim).filter(|d| !d.is_empty()).map(str::to_string),
        databases: parse_database_list(&raw_config.databases)?.unwrap_or_default(),
        total_databases_found: raw_config.total_databases_found,
        filter,
        compression,
        encryption,
        skip_table_data: raw_config.skip_table_data.clone().unwrap_or_default(),
        save_backup_info: raw_config.save_backup_info.unwrap_or(true),
        file_permissions: parse_file_permissions(raw_config.file_permissions.as_deref().unwrap_or("")),
        metadata_permissions: parse_file_permissions(raw_config.metadata_permissions.as_deref().unwrap_or("")),
        exclude_user: raw_config.exclude_user.unwrap_or(false),
        replication_user: raw_config.replication_user.clone().unwrap_or_default(),
        ticket: raw_config.ticket.clone().unwrap_or_default(),
        dry_run: raw_config.dry_run.unwrap_or(false),
        dump_binary: raw_config.dump_binary.clone(),
    })
}

/// Parses `databases`: an array of names, or an object whose keys are the names.
fn parse_database_list(database_list: &Option<serde_json::Value>) -> Result<Option<Vec<String>>> {
    match database_list {
        Some(value) if value.is_array() => {
            let databases: Vec<String> =
                serde_json::from_value(value.clone()).context("Failed to parse databases as array")?;
            Ok(Some(databases))
        }
        Some(serde_json::Value::Object(mapping)) => Ok(Some(mapping.keys().cloned().collect())),
        Some(_) => Err(anyhow::anyhow!(
            "databases must be either an array of database names or a mapping object"
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) fn test_config(output_dir: &Path) -> BackupConfig {
    BackupConfig {
        connection: ConnectionInfo { host: "127.0.0.1".into(), port: 3306, user: "backup".into(), password: "pw".into() },
        hostname: "testhost".into(),
        dump_args: "--single-transaction".into(),
        output_dir: output_dir.to_path_buf(),
        filename: None,
        mode: BackupMode::Combined,
        db_name: None,
        databases: Vec::new(),
        total_databases_found: None,
        filter: FilterOptions::default(),
        compression: CompressionSettings::disabled(),
        encryption: EncryptionOptions::disabled(),
        skip_table_data: Vec::new(),
        save_backup_info: true,
        file_permissions: 0o600,
        metadata_permissions: 0o600,
        exclude_user: false,
        replication_user: String::new(),
        ticket: String::new(),
        dry_run: false,
        dump_binary: None,
    }
}
