// dumpvault/src/backup/types.rs
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::BackupError;

/// Above this many databases, combined backups show a count instead of the list.
pub const MAX_DISPLAY_DATABASES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    Combined,
    All,
    Single,
    Primary,
    Secondary,
    Separated,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Combined => "combined",
            BackupMode::All => "all",
            BackupMode::Single => "single",
            BackupMode::Primary => "primary",
            BackupMode::Secondary => "secondary",
            BackupMode::Separated => "separated",
        }
    }

    /// Combined and all produce one artifact for every selected database.
    pub fn is_combined(&self) -> bool {
        matches!(self, BackupMode::Combined | BackupMode::All)
    }

    pub fn is_single_variant(&self) -> bool {
        matches!(self, BackupMode::Single | BackupMode::Primary | BackupMode::Secondary)
    }

    /// Primary and secondary back up a main database plus its companions as one group.
    pub fn groups_companions(&self) -> bool {
        matches!(self, BackupMode::Primary | BackupMode::Secondary)
    }

    /// Modes that export grants per database right after each successful dump.
    pub fn exports_grants_per_database(&self) -> bool {
        matches!(self, BackupMode::Single | BackupMode::Separated)
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "combined" | "single-file" => Ok(BackupMode::Combined),
            "all" => Ok(BackupMode::All),
            "single" => Ok(BackupMode::Single),
            "primary" => Ok(BackupMode::Primary),
            "secondary" => Ok(BackupMode::Secondary),
            "separated" | "multi-file" => Ok(BackupMode::Separated),
            other => Err(BackupError::Config(format!("unknown backup mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Success,
    SuccessWithWarnings,
    DryRun,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Success => "success",
            BackupStatus::SuccessWithWarnings => "success_with_warnings",
            BackupStatus::DryRun => "dry_run",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub exclude_data: bool,
    pub exclude_system: bool,
    pub include_databases: Vec<String>,
    pub exclude_databases: Vec<String>,
}

impl FilterOptions {
    /// True when any database-selection rule is configured. `exclude_data` is not a selection rule.
    pub fn has_active_filter(&self) -> bool {
        self.exclude_system || !self.include_databases.is_empty() || !self.exclude_databases.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    Zlib,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zlib => "zlib",
        }
    }

    /// File extension appended after `.sql`; empty for no compression.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "",
            CompressionType::Gzip => ".gz",
            CompressionType::Zlib => ".zlib",
        }
    }
}

impl FromStr for CompressionType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CompressionType::None),
            "gzip" | "gz" => Ok(CompressionType::Gzip),
            "zlib" => Ok(CompressionType::Zlib),
            other => Err(BackupError::Config(format!("unsupported compression type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub compression_type: CompressionType,
    pub level: u32,
}

impl CompressionSettings {
    pub fn disabled() -> Self {
        CompressionSettings { enabled: false, compression_type: CompressionType::None, level: 6 }
    }

    pub fn gzip(level: u32) -> Self {
        CompressionSettings { enabled: true, compression_type: CompressionType::Gzip, level }
    }

    /// The codec actually applied: `None` unless compression is enabled.
    pub fn effective_type(&self) -> CompressionType {
        if self.enabled { self.compression_type } else { CompressionType::None }
    }
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct EncryptionOptions {
    pub enabled: bool,
    pub key: String,
}

impl EncryptionOptions {
    pub fn disabled() -> Self {
        EncryptionOptions::default()
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        EncryptionOptions { enabled: true, key: key.into() }
    }
}

impl fmt::Debug for EncryptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionOptions")
            .field("enabled", &self.enabled)
            .field("key", &"********")
            .finish()
    }
}

/// One unit of dump work, created per invocation by an orchestrator.
#[derive(Debug, Clone)]
pub struct BackupExecutionConfig {
    pub db_name: String,
    pub db_list: Vec<String>,
    pub output_path: PathBuf,
    pub backup_type: BackupMode,
    pub is_multi_db: bool,
    pub total_db_found: usize,
}

impl BackupExecutionConfig {
    pub fn single(db_name: &str, output_path: PathBuf, backup_type: BackupMode, total_db_found: usize) -> Self {
        BackupExecutionConfig {
            db_name: db_name.to_string(),
            db_list: Vec::new(),
            output_path,
            backup_type,
            is_multi_db: false,
            total_db_found,
        }
    }

    pub fn multi(db_list: &[String], output_path: PathBuf, backup_type: BackupMode, total_db_found: usize) -> Self {
        BackupExecutionConfig {
            db_name: String::new(),
            db_list: db_list.to_vec(),
            output_path,
            backup_type,
            is_multi_db: true,
            total_db_found,
        }
    }

    pub fn database_names(&self) -> Vec<String> {
        if self.is_multi_db { self.db_list.clone() } else { vec![self.db_name.clone()] }
    }

    /// Label used in error context: the database name, or "combined".
    pub fn label(&self) -> &str {
        if self.is_multi_db { "combined" } else { &self.db_name }
    }

    pub fn display_name(&self) -> String {
        if self.is_multi_db {
            format!("Combined backup ({} databases)", self.db_list.len())
        } else {
            self.db_name.clone()
        }
    }
}

/// Outcome of one successful dump-and-stream attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupWriteResult {
    pub stderr_output: String,
    pub file_size: u64,
}

/// Summary of one completed backup artifact. Built through `DatabaseBackupInfoBuilder`.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseBackupInfo {
    pub database_name: String,
    pub databases: Vec<String>,
    pub output_file: PathBuf,
    pub file_size: u64,
    pub file_size_human: String,
    pub duration: String,
    pub status: BackupStatus,
    pub warnings: String,
    pub backup_id: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub throughput_mb_s: f64,
    pub manifest_file: Option<PathBuf>,
}

impl DatabaseBackupInfo {
    /// Display label for summaries; combined backups list their databases while under the display threshold.
    pub fn display_label(&self) -> String {
        if self.databases.len() > 1 && self.databases.len() <= MAX_DISPLAY_DATABASES {
            let list: Vec<String> = self.databases.iter().map(|db| format!("- {}", db)).collect();
            format!("{}:\n{}", self.database_name, list.join("\n"))
        } else {
            self.database_name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDatabaseInfo {
    pub database_name: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct BackupLoopConfig {
    pub mode: BackupMode,
    pub total_dbs: usize,
}

/// Aggregate of a multi-database run.
#[derive(Debug, Clone, Default)]
pub struct BackupLoopResult {
    pub backup_infos: Vec<DatabaseBackupInfo>,
    pub failed_dbs: Vec<FailedDatabaseInfo>,
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// What a mode orchestrator hands back to the caller.
#[derive(Debug, Clone, Default)]
pub struct BackupResult {
    pub total_databases: usize,
    pub successful_backups: usize,
    pub failed_backups: usize,
    pub backup_infos: Vec<DatabaseBackupInfo>,
    pub failed_database_infos: Vec<FailedDatabaseInfo>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

impl BackupResult {
    pub fn summary_line(&self) -> String {
        format!("{} succeeded, {} failed", self.successful_backups, self.failed_backups)
    }
}

impl From<BackupLoopResult> for BackupResult {
    fn from(loop_result: BackupLoopResult) -> Self {
        BackupResult {
            total_databases: loop_result.success + loop_result.failed,
            successful_backups: loop_result.success,
            failed_backups: loop_result.failed,
            backup_infos: loop_result.backup_infos,
            failed_database_infos: loop_result.failed_dbs,
            errors: loop_result.errors,
            cancelled: loop_result.cancelled,
        }
    }
}

/// Binlog coordinates captured before a combined or single-style dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GtidInfo {
    pub master_log_file: String,
    pub master_log_pos: u64,
    pub gtid_binlog: String,
}

impl GtidInfo {
    pub fn describe(&self) -> String {
        if !self.gtid_binlog.is_empty() {
            self.gtid_binlog.clone()
        } else {
            format!("File={}, Pos={}", self.master_log_file, self.master_log_pos)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_mode_parsing() {
        assert_eq!("Combined".parse::<BackupMode>().unwrap(), BackupMode::Combined);
        assert_eq!("separated".parse::<BackupMode>().unwrap(), BackupMode::Separated);
        assert!("everything".parse::<BackupMode>().is_err());
        assert!(BackupMode::All.is_combined());
        assert!(BackupMode::Primary.groups_companions());
        assert!(!BackupMode::Separated.is_single_variant());
    }

    #[test]
    fn test_execution_config_display_name() {
        let dbs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let cfg = BackupExecutionConfig::multi(&dbs, PathBuf::from("/tmp/x.sql"), BackupMode::Combined, 3);
        assert_eq!(cfg.display_name(), "Combined backup (3 databases)");
        assert_eq!(cfg.label(), "combined");

        let single = BackupExecutionConfig::single("app", PathBuf::from("/tmp/app.sql"), BackupMode::Single, 1);
        assert_eq!(single.display_name(), "app");
        assert_eq!(single.database_names(), vec!["app".to_string()]);
    }

    #[test]
    fn test_gtid_describe_prefers_gtid_string() {
        let mut info = GtidInfo {
            master_log_file: "mysql-bin.000042".into(),
            master_log_pos: 1337,
            gtid_binlog: String::new(),
        };
        assert_eq!(info.describe(), "File=mysql-bin.000042, Pos=1337");
        info.gtid_binlog = "0-1-100".into();
        assert_eq!(info.describe(), "0-1-100");
    }

    #[test]
    fn test_encryption_options_debug_masks_key() {
        let opts = EncryptionOptions::with_key("hunter2");
        assert!(!format!("{:?}", opts).contains("hunter2"));
    }
}
