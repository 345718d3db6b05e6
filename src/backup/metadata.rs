// dumpvault/src/backup/metadata.rs
//! The `<artifact>.meta.json` manifest: building, atomic persistence and in-place updates.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backup::pipeline::create_output_file;
use crate::backup::types::{
    BackupMode, BackupStatus, CompressionSettings, DatabaseBackupInfo, GtidInfo,
};
use crate::errors::Result;
use crate::utils::format::{format_duration, format_file_size, throughput_mb_per_sec};

pub const MANIFEST_EXT: &str = ".meta.json";
pub const GENERATED_BY: &str = "dumpvault";
const NO_GRANTS_FILE: &str = "none";

fn append_to_path(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// `<artifact>.meta.json`
pub fn manifest_path(backup_file: &Path) -> PathBuf {
    append_to_path(backup_file, MANIFEST_EXT)
}

/// `<artifact>.meta.json.tmp`, the only file a crash may leave half-written.
pub fn manifest_tmp_path(backup_file: &Path) -> PathBuf {
    append_to_path(&manifest_path(backup_file), ".tmp")
}

mod local_time {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(t: &DateTime<Local>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Local>, D::Error> {
        let raw = String::deserialize(d)?;
        let naive = NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid local time '{}'", raw)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSection {
    pub file: PathBuf,
    #[serde(rename = "type")]
    pub backup_type: BackupMode,
    pub status: BackupStatus,
    pub databases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_databases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseBackupDetail {
    pub database_name: String,
    pub backup_file: PathBuf,
    pub file_size_bytes: u64,
    pub file_size_human: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSection {
    #[serde(with = "local_time")]
    pub start_time: DateTime<Local>,
    #[serde(with = "local_time")]
    pub end_time: DateTime<Local>,
    pub duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSection {
    pub size_bytes: u64,
    pub size_human: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionSection {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub compression_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptionSection {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSection {
    pub hostname: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationSection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_log_pos: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VersionSection {
    #[serde(default)]
    pub mysqldump: String,
    #[serde(default)]
    pub mariadb: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdditionalFiles {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_grants: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorSection {
    pub generated_by: String,
    #[serde(with = "local_time")]
    pub generated_at: DateTime<Local>,
}

/// The persisted manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupMetadata {
    pub backup: BackupSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub database_details: Vec<DatabaseBackupDetail>,
    pub time: TimeSection,
    pub file: FileSection,
    pub compression: CompressionSection,
    pub encryption: EncryptionSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationSection>,
    #[serde(default)]
    pub version: VersionSection,
    #[serde(default)]
    pub additional_files: AdditionalFiles,
    pub generator: GeneratorSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ticket: String,
}

/// Inputs gathered by the engine after a successful dump.
#[derive(Debug, Clone)]
pub struct MetadataInput<'a> {
    pub backup_file: &'a Path,
    pub backup_type: BackupMode,
    pub status: BackupStatus,
    pub database_names: Vec<String>,
    pub excluded_databases: &'a [String],
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration: Duration,
    pub file_size: u64,
    pub compression: &'a CompressionSettings,
    pub encrypted: bool,
    pub stderr_output: &'a str,
    pub hostname: &'a str,
    pub source_host: &'a str,
    pub source_port: u16,
    pub replication_user: &'a str,
    pub gtid: Option<&'a GtidInfo>,
    pub dump_version: &'a str,
    pub server_version: &'a str,
    pub ticket: &'a str,
}

pub fn generate_backup_metadata(input: &MetadataInput<'_>) -> BackupMetadata {
    // Separated backups have no single snapshot point, so no source or binlog position.
    let per_database = input.backup_type == BackupMode::Separated;

    let excluded_databases = if input.backup_type == BackupMode::All {
        input.excluded_databases.to_vec()
    } else {
        Vec::new()
    };

    let source = (!per_database).then(|| SourceSection {
        hostname: input.hostname.to_string(),
        host: input.source_host.to_string(),
        port: input.source_port,
    });

    let replication = (!per_database).then(|| ReplicationSection {
        user: input.replication_user.to_string(),
        gtid_info: input.gtid.map(GtidInfo::describe),
        master_log_file: input.gtid.map(|g| g.master_log_file.clone()),
        master_log_pos: input.gtid.map(|g| g.master_log_pos),
    });

    let warnings = if input.stderr_output.trim().is_empty() {
        Vec::new()
    } else {
        vec![input.stderr_output.trim().to_string()]
    };

    BackupMetadata {
        backup: BackupSection {
            file: input.backup_file.to_path_buf(),
            backup_type: input.backup_type,
            status: input.status,
            databases: input.database_names.clone(),
            excluded_databases,
        },
        database_details: Vec::new(),
        time: TimeSection {
            start_time: input.start_time,
            end_time: input.end_time,
            duration: format_duration(input.duration),
        },
        file: FileSection { size_bytes: input.file_size, size_human: format_file_size(input.file_size) },
        compression: CompressionSection {
            enabled: input.compression.enabled,
            compression_type: input.compression.effective_type().as_str().to_string(),
        },
        encryption: EncryptionSection { enabled: input.encrypted },
        source,
        replication,
        version: VersionSection {
            mysqldump: input.dump_version.to_string(),
            mariadb: input.server_version.to_string(),
        },
        additional_files: AdditionalFiles::default(),
        generator: GeneratorSection { generated_by: GENERATED_BY.to_string(), generated_at: Local::now() },
        warnings,
        ticket: input.ticket.to_string(),
    }
}

/// Writes the manifest next to its artifact via `<manifest>.tmp` + rename.
/// On failure the temp file is removed and no manifest path is returned.
pub fn save_backup_metadata(meta: &BackupMetadata, permissions: u32) -> Result<PathBuf> {
    let target = manifest_path(&meta.backup.file);
    let tmp = manifest_tmp_path(&meta.backup.file);

    let bytes = serde_json::to_vec_pretty(meta)?;
    let written = create_output_file(&tmp, permissions).and_then(|mut f| {
        f.write_all(&bytes)?;
        f.sync_all()
    });
    if let Err(e) = written.and_then(|_| fs::rename(&tmp, &target)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    debug!("Metadata saved: {}", target.display());
    Ok(target)
}

/// Non-fatal wrapper: the artifact stands even when its manifest cannot be written.
pub fn try_save_backup_metadata(meta: &BackupMetadata, permissions: u32) -> Option<PathBuf> {
    match save_backup_metadata(meta, permissions) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Failed to save backup metadata for {}: {}", meta.backup.file.display(), e);
            None
        }
    }
}

pub fn load_backup_metadata(backup_file: &Path) -> Result<BackupMetadata> {
    let data = fs::read(manifest_path(backup_file))?;
    Ok(serde_json::from_slice(&data)?)
}

fn update_metadata(backup_file: &Path, permissions: u32, apply: impl FnOnce(&mut BackupMetadata)) -> Result<PathBuf> {
    let mut meta = load_backup_metadata(backup_file)?;
    if meta.backup.file.as_os_str().is_empty() {
        meta.backup.file = backup_file.to_path_buf();
    }
    apply(&mut meta);
    save_backup_metadata(&meta, permissions)
}

/// Records the exported grants file; `None` is stored as `"none"`.
pub fn update_user_grants_path(backup_file: &Path, grants_file: Option<&Path>, permissions: u32) -> Result<PathBuf> {
    let value = grants_file
        .map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| NO_GRANTS_FILE.to_string());
    update_metadata(backup_file, permissions, |meta| meta.additional_files.user_grants = value)
}

/// Turns the primary's manifest into the manifest of the whole group.
pub fn update_with_database_details(
    backup_file: &Path,
    database_names: &[String],
    infos: &[DatabaseBackupInfo],
    permissions: u32,
) -> Result<PathBuf> {
    let details = infos
        .iter()
        .map(|info| DatabaseBackupDetail {
            database_name: info.database_name.clone(),
            backup_file: info.output_file.clone(),
            file_size_bytes: info.file_size,
            file_size_human: info.file_size_human.clone(),
        })
        .collect();
    let any_warnings = infos.iter().any(|i| i.status == BackupStatus::SuccessWithWarnings);
    update_metadata(backup_file, permissions, |meta| {
        meta.backup.databases = database_names.to_vec();
        meta.database_details = details;
        if any_warnings && meta.backup.status == BackupStatus::Success {
            meta.backup.status = BackupStatus::SuccessWithWarnings;
        }
    })
}

/// Builds the one `DatabaseBackupInfo` of an artifact.
#[derive(Debug, Clone)]
pub struct DatabaseBackupInfoBuilder {
    pub database_name: String,
    pub databases: Vec<String>,
    pub output_file: PathBuf,
    pub file_size: u64,
    pub duration: Duration,
    pub status: BackupStatus,
    pub warnings: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub manifest_file: Option<PathBuf>,
}

impl DatabaseBackupInfoBuilder {
    pub fn build(self) -> DatabaseBackupInfo {
        DatabaseBackupInfo {
            database_name: self.database_name,
            databases: self.databases,
            output_file: self.output_file,
            file_size: self.file_size,
            file_size_human: format_file_size(self.file_size),
            duration: format_duration(self.duration),
            status: self.status,
            warnings: self.warnings,
            backup_id: format!("bk-{}", Uuid::new_v4()),
            start_time: self.start_time,
            end_time: self.end_time,
            throughput_mb_s: throughput_mb_per_sec(self.file_size, self.duration),
            manifest_file: self.manifest_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn input<'a>(file: &'a Path, mode: BackupMode, gtid: Option<&'a GtidInfo>, excluded: &'a [String]) -> MetadataInput<'a> {
        static COMPRESSION: std::sync::LazyLock<CompressionSettings> =
            std::sync::LazyLock::new(|| CompressionSettings::gzip(6));
        MetadataInput {
            backup_file: file,
            backup_type: mode,
            status: BackupStatus::Success,
            database_names: vec!["app".into()],
            excluded_databases: excluded,
            start_time: Local::now(),
            end_time: Local::now(),
            duration: Duration::from_secs(2),
            file_size: 2048,
            compression: &COMPRESSION,
            encrypted: true,
            stderr_output: "",
            hostname: "db1",
            source_host: "10.0.0.5",
            source_port: 3306,
            replication_user: "repl",
            gtid,
            dump_version: "mysqldump  Ver 10.19",
            server_version: "10.11.6-MariaDB",
            ticket: "OPS-42",
        }
    }

    fn gtid() -> GtidInfo {
        GtidInfo { master_log_file: "mysql-bin.000042".into(), master_log_pos: 1337, gtid_binlog: "0-1-100".into() }
    }

    #[test]
    fn test_separated_backups_omit_source_and_replication() {
        let g = gtid();
        let meta = generate_backup_metadata(&input(Path::new("/b/app.sql.gz.enc"), BackupMode::Separated, Some(&g), &[]));
        assert!(meta.source.is_none());
        assert!(meta.replication.is_none());

        let meta = generate_backup_metadata(&input(Path::new("/b/app.sql.gz.enc"), BackupMode::Single, Some(&g), &[]));
        assert_eq!(meta.replication.and_then(|r| r.gtid_info).as_deref(), Some("0-1-100"));
        assert_eq!(meta.source.map(|s| s.port), Some(3306));
    }

    #[test]
    fn test_excluded_databases_only_for_mode_all() {
        let excluded = vec!["mysql".to_string()];
        let all = generate_backup_metadata(&input(Path::new("a.sql"), BackupMode::All, None, &excluded));
        assert_eq!(all.backup.excluded_databases, excluded);
        let combined = generate_backup_metadata(&input(Path::new("a.sql"), BackupMode::Combined, None, &excluded));
        assert!(combined.backup.excluded_databases.is_empty());
    }

    #[test]
    fn test_manifest_json_layout() -> anyhow::Result<()> {
        let meta = generate_backup_metadata(&input(Path::new("/b/app.sql.gz"), BackupMode::Single, None, &[]));
        let value = serde_json::to_value(&meta)?;
        assert_eq!(value["backup"]["type"], "single");
        assert_eq!(value["backup"]["status"], "success");
        assert_eq!(value["file"]["size_human"], "2.00 KB");
        assert_eq!(value["compression"]["type"], "gzip");
        assert_eq!(value["encryption"]["enabled"], true);
        assert_eq!(value["generator"]["generated_by"], GENERATED_BY);
        assert_eq!(value["ticket"], "OPS-42");
        let start = value["time"]["start_time"].as_str().unwrap_or_default();
        assert_eq!(start.len(), "2026-10-17 08:05:09".len());
        Ok(())
    }

    #[test]
    fn test_save_is_atomic_and_round_trips() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let artifact = dir.path().join("app.sql.gz");
        let g = gtid();
        let meta = generate_backup_metadata(&input(&artifact, BackupMode::Combined, Some(&g), &[]));

        // a stale half-written temp file from a crash must not matter
        fs::write(manifest_tmp_path(&artifact), b"{\"backup\": ")?;
        let path = save_backup_metadata(&meta, 0o600)?;
        assert_eq!(path, dir.path().join("app.sql.gz.meta.json"));
        assert!(!manifest_tmp_path(&artifact).exists());

        let loaded = load_backup_metadata(&artifact)?;
        assert_eq!(loaded.backup, meta.backup);
        assert_eq!(loaded.replication, meta.replication);
        Ok(())
    }

    #[test]
    fn test_failed_save_leaves_nothing_behind() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        // the manifest target is a directory, so the rename fails
        let artifact = dir.path().join("app.sql");
        fs::create_dir(manifest_path(&artifact))?;
        let meta = generate_backup_metadata(&input(&artifact, BackupMode::Single, None, &[]));
        assert!(save_backup_metadata(&meta, 0o600).is_err());
        assert!(!manifest_tmp_path(&artifact).exists());
        assert!(try_save_backup_metadata(&meta, 0o600).is_none());
        Ok(())
    }

    #[test]
    fn test_update_helpers() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let artifact = dir.path().join("app.sql");
        let meta = generate_backup_metadata(&input(&artifact, BackupMode::Primary, None, &[]));
        save_backup_metadata(&meta, 0o600)?;

        update_user_grants_path(&artifact, None, 0o600)?;
        assert_eq!(load_backup_metadata(&artifact)?.additional_files.user_grants, "none");

        let grants = dir.path().join("app_users.sql");
        update_user_grants_path(&artifact, Some(&grants), 0o600)?;
        assert_eq!(load_backup_metadata(&artifact)?.additional_files.user_grants, grants.display().to_string());

        let now = Local::now();
        let info = DatabaseBackupInfoBuilder {
            database_name: "app_dmart".into(),
            databases: vec!["app_dmart".into()],
            output_file: dir.path().join("app_dmart.sql"),
            file_size: 10,
            duration: Duration::ZERO,
            status: BackupStatus::SuccessWithWarnings,
            warnings: "Warning: couldn't read keys from table".into(),
            start_time: now,
            end_time: now,
            manifest_file: None,
        }
        .build();
        assert_eq!(info.throughput_mb_s, 0.0);
        let names = vec!["app".to_string(), "app_dmart".to_string()];
        update_with_database_details(&artifact, &names, std::slice::from_ref(&info), 0o600)?;
        let loaded = load_backup_metadata(&artifact)?;
        assert_eq!(loaded.backup.databases, names);
        // a companion's warnings carry over to the group manifest
        assert_eq!(loaded.backup.status, BackupStatus::SuccessWithWarnings);
        assert_eq!(loaded.database_details.len(), 1);
        assert_eq!(loaded.database_details[0].file_size_human, "10 B");
        Ok(())
    }

    #[test]
    fn test_builder_assigns_unique_ids() {
        let now = Local::now();
        let b = DatabaseBackupInfoBuilder {
            database_name: "app".into(),
            databases: vec!["app".into()],
            output_file: PathBuf::from("app.sql"),
            file_size: 3 * 1024 * 1024,
            duration: Duration::from_secs(2),
            status: BackupStatus::Success,
            warnings: String::new(),
            start_time: now,
            end_time: now,
            manifest_file: None,
        };
        let a = b.clone().build();
        let c = b.build();
        assert_ne!(a.backup_id, c.backup_id);
        assert!((a.throughput_mb_s - 1.5).abs() < 1e-9);
    }
}
