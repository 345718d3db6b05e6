// dumpvault/src/backup/paths.rs
//! Artifact naming: default names, custom base names, companion suffixes and derived files.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

use crate::backup::types::{BackupMode, CompressionType};

pub const SQL_EXT: &str = ".sql";
pub const ENC_EXT: &str = ".enc";
pub const USERS_SQL_SUFFIX: &str = "_users.sql";
pub const COMPANION_SUFFIXES: [&str; 3] = ["_dmart", "_temp", "_archive"];

const KNOWN_COMPRESSION_EXTS: [&str; 4] = [".gz", ".zlib", ".zst", ".xz"];

/// Splits `name` into its stem and the `.sql[.gz][.enc]` extension chain.
pub fn split_extension_chain(name: &str) -> (&str, &str) {
    let mut stem = name;
    if let Some(s) = stem.strip_suffix(ENC_EXT) {
        stem = s;
    }
    if let Some(s) = KNOWN_COMPRESSION_EXTS.iter().find_map(|ext| stem.strip_suffix(ext)) {
        stem = s;
    }
    if let Some(s) = stem.strip_suffix(SQL_EXT) {
        stem = s;
    }
    (stem, &name[stem.len()..])
}

/// Reads the compression codec and encryption flag from an artifact's extension chain.
pub fn detect_layers(path: &Path) -> (CompressionType, bool) {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let (_, chain) = split_extension_chain(&name);
    let encrypted = chain.ends_with(ENC_EXT);
    let chain = chain.strip_suffix(ENC_EXT).unwrap_or(chain);
    let compression = if chain.ends_with(".gz") {
        CompressionType::Gzip
    } else if chain.ends_with(".zlib") {
        CompressionType::Zlib
    } else {
        CompressionType::None
    };
    (compression, encrypted)
}

/// `<db>_<YYYYMMDD_HHMMSS>_<host>.sql[.gz|.zlib][.enc]`
pub fn generate_backup_filename(
    db_token: &str,
    hostname: &str,
    timestamp: DateTime<Local>,
    compression: CompressionType,
    encrypted: bool,
) -> String {
    format!(
        "{}_{}_{}{}{}{}",
        db_token,
        timestamp.format("%Y%m%d_%H%M%S"),
        hostname,
        SQL_EXT,
        compression.extension(),
        if encrypted { ENC_EXT } else { "" }
    )
}

/// Replaces the stem of `default_name` with `custom`, keeping the extension chain.
pub fn apply_custom_base_filename(default_name: &str, custom: &str) -> String {
    let custom = custom.trim();
    if custom.is_empty() {
        return default_name.to_string();
    }
    let (custom_stem, _) = split_extension_chain(custom);
    let (_, chain) = split_extension_chain(default_name);
    format!("{}{}", custom_stem, chain)
}

/// `foo.sql.gz.enc` + `_dmart` -> `foo_dmart.sql.gz.enc`
pub fn insert_suffix_before_sql_ext(filename: &str, suffix: &str) -> String {
    let (stem, chain) = split_extension_chain(filename);
    format!("{}{}{}", stem, suffix, chain)
}

/// The companion suffix when `db` is `primary` plus one of the known suffixes.
pub fn companion_suffix(primary: &str, db: &str) -> Option<&'static str> {
    let rest = db.strip_prefix(primary)?;
    COMPANION_SUFFIXES.iter().copied().find(|s| *s == rest)
}

/// `<dir>/<stem>_users.sql` for a backup artifact.
pub fn user_grants_path(backup_file: &Path) -> PathBuf {
    let name = backup_file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let (stem, _) = split_extension_chain(&name);
    backup_file.with_file_name(format!("{}{}", stem, USERS_SQL_SUFFIX))
}

/// Everything needed to name the artifacts of one run.
#[derive(Debug, Clone)]
pub struct OutputNaming {
    pub output_dir: PathBuf,
    pub hostname: String,
    pub custom_filename: Option<String>,
    pub compression: CompressionType,
    pub encrypted: bool,
    pub timestamp: DateTime<Local>,
}

impl OutputNaming {
    pub fn default_filename(&self, db_token: &str) -> String {
        generate_backup_filename(db_token, &self.hostname, self.timestamp, self.compression, self.encrypted)
    }

    fn custom(&self) -> Option<&str> {
        self.custom_filename.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    /// Path of the single artifact written by combined/all.
    pub fn combined_path(&self, mode: BackupMode) -> PathBuf {
        let token = if mode == BackupMode::All { "all_databases" } else { "combined" };
        let default_name = self.default_filename(token);
        let name = match self.custom() {
            Some(custom) => apply_custom_base_filename(&default_name, custom),
            None => default_name,
        };
        self.output_dir.join(name)
    }

    /// Path for `db` in an iterative run whose first database is `primary`.
    ///
    /// With a custom base filename the primary of a single-variant mode takes it, and in
    /// primary/secondary modes its companions take `<custom><suffix>`.
    pub fn iterative_path(&self, mode: BackupMode, primary: Option<&str>, db: &str) -> PathBuf {
        if let (Some(custom), Some(primary)) = (self.custom(), primary) {
            if mode.is_single_variant() {
                let primary_name = apply_custom_base_filename(&self.default_filename(primary), custom);
                if db == primary {
                    return self.output_dir.join(primary_name);
                }
                if mode.groups_companions() {
                    if let Some(suffix) = companion_suffix(primary, db) {
                        return self.output_dir.join(insert_suffix_before_sql_ext(&primary_name, suffix));
                    }
                }
            }
        }
        self.output_dir.join(self.default_filename(db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn naming(custom: Option<&str>) -> OutputNaming {
        OutputNaming {
            output_dir: PathBuf::from("/backups"),
            hostname: "db1".into(),
            custom_filename: custom.map(str::to_string),
            compression: CompressionType::Gzip,
            encrypted: true,
            timestamp: Local.with_ymd_and_hms(2026, 10, 17, 8, 5, 9).single().expect("valid time"),
        }
    }

    #[test]
    fn test_default_filename() {
        assert_eq!(naming(None).default_filename("app"), "app_20261017_080509_db1.sql.gz.enc");
    }

    #[test]
    fn test_extension_chain_helpers() {
        assert_eq!(split_extension_chain("a.sql.gz.enc"), ("a", ".sql.gz.enc"));
        assert_eq!(split_extension_chain("a.sql"), ("a", ".sql"));
        assert_eq!(split_extension_chain("a"), ("a", ""));
        assert_eq!(apply_custom_base_filename("app_x.sql.zlib", "foo"), "foo.sql.zlib");
        assert_eq!(apply_custom_base_filename("app_x.sql.gz", "foo.sql"), "foo.sql.gz");
        assert_eq!(insert_suffix_before_sql_ext("foo.sql.gz.enc", "_dmart"), "foo_dmart.sql.gz.enc");
        assert_eq!(detect_layers(Path::new("/b/x.sql.gz.enc")), (CompressionType::Gzip, true));
        assert_eq!(detect_layers(Path::new("x.sql.zlib")), (CompressionType::Zlib, false));
        assert_eq!(detect_layers(Path::new("x.sql")), (CompressionType::None, false));
    }

    #[test]
    fn test_user_grants_path() {
        assert_eq!(
            user_grants_path(Path::new("/backup/db_20250101.sql.gz.enc")),
            PathBuf::from("/backup/db_20250101_users.sql")
        );
        assert_eq!(user_grants_path(Path::new("db.sql.xz")), PathBuf::from("db_users.sql"));
    }

    #[test]
    fn test_companion_suffix() {
        assert_eq!(companion_suffix("app", "app_dmart"), Some("_dmart"));
        assert_eq!(companion_suffix("app", "app_archive"), Some("_archive"));
        assert_eq!(companion_suffix("app", "app_other"), None);
        assert_eq!(companion_suffix("app", "billing_dmart"), None);
    }

    #[test]
    fn test_combined_path_tokens() {
        let n = naming(None);
        assert_eq!(
            n.combined_path(BackupMode::All),
            PathBuf::from("/backups/all_databases_20261017_080509_db1.sql.gz.enc")
        );
        assert_eq!(naming(Some("nightly")).combined_path(BackupMode::Combined), PathBuf::from("/backups/nightly.sql.gz.enc"));
    }

    #[test]
    fn test_iterative_paths_with_custom_base() {
        let n = naming(Some("foo"));
        assert_eq!(n.iterative_path(BackupMode::Primary, Some("app"), "app"), PathBuf::from("/backups/foo.sql.gz.enc"));
        assert_eq!(
            n.iterative_path(BackupMode::Primary, Some("app"), "app_dmart"),
            PathBuf::from("/backups/foo_dmart.sql.gz.enc")
        );
        // separated never applies the custom name
        assert_eq!(
            n.iterative_path(BackupMode::Separated, Some("app"), "app"),
            PathBuf::from("/backups/app_20261017_080509_db1.sql.gz.enc")
        );
        // single mode has no companion naming
        assert_eq!(
            n.iterative_path(BackupMode::Single, Some("app"), "app_dmart"),
            PathBuf::from("/backups/app_dmart_20261017_080509_db1.sql.gz.enc")
        );
    }
}
