// dumpvault/src/backup/engine.rs
//! One backup execution (dump, retry, manifest) and the per-database loop built on it.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::args::{build_dump_args, mask_password_args};
use crate::backup::guard::CleanupRegistry;
use crate::backup::hooks::ServerHooks;
use crate::backup::metadata::{
    DatabaseBackupInfoBuilder, MetadataInput, generate_backup_metadata, try_save_backup_metadata,
    update_user_grants_path,
};
use crate::backup::paths::user_grants_path;
use crate::backup::pipeline::create_output_file;
use crate::backup::retry::{DEFAULT_STRATEGIES, MAX_DUMP_ATTEMPTS, run_with_retry};
use crate::backup::runner::{DumpRunner, DumpTool, extract_tool_version};
use crate::backup::types::{
    BackupExecutionConfig, BackupLoopConfig, BackupLoopResult, BackupStatus, DatabaseBackupInfo, FailedDatabaseInfo,
    GtidInfo,
};
use crate::config::BackupConfig;
use crate::errors::is_cancellation;
use crate::utils::summarize_stderr;

pub const DRY_RUN_SIZE_LABEL: &str = "0 B (dry-run)";

/// Shared state of one backup run.
pub struct Engine<'a> {
    config: &'a BackupConfig,
    tool: DumpTool,
    hooks: &'a dyn ServerHooks,
    cancel: CancellationToken,
    registry: CleanupRegistry,
    gtid: Option<GtidInfo>,
    excluded_databases: Vec<String>,
    dump_version: String,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a BackupConfig,
        tool: DumpTool,
        hooks: &'a dyn ServerHooks,
        cancel: CancellationToken,
        registry: CleanupRegistry,
    ) -> Self {
        Engine {
            config,
            tool,
            hooks,
            cancel,
            registry,
            gtid: None,
            excluded_databases: Vec::new(),
            dump_version: String::new(),
        }
    }

    /// Databases left out by the filter; recorded in `all` manifests.
    pub fn with_excluded_databases(mut self, excluded: Vec<String>) -> Self {
        self.excluded_databases = excluded;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        self.config
    }

    pub fn gtid(&self) -> Option<&GtidInfo> {
        self.gtid.as_ref()
    }

    pub async fn load_dump_version(&mut self) {
        match self.tool.version().await {
            Some(v) => {
                debug!("Dump tool version: {}", v);
                self.dump_version = v;
            }
            None => debug!("Could not determine {} version", self.tool.name),
        }
    }

    /// Records the binlog position once, before any dump starts. Failure only loses the position.
    pub async fn capture_gtid(&mut self) {
        match self.hooks.capture_gtid().await {
            Ok(Some(gtid)) => {
                info!("Captured binlog position: {}", gtid.describe());
                self.gtid = Some(gtid);
            }
            Ok(None) => debug!("Binary logging is disabled, no binlog position captured"),
            Err(e) => warn!("Failed to capture GTID information: {:#}", e),
        }
    }

    fn dump_args(&self, exec: &BackupExecutionConfig) -> Vec<String> {
        let cfg = self.config;
        if exec.is_multi_db {
            build_dump_args(
                &cfg.dump_args,
                &cfg.connection,
                &cfg.filter,
                &exec.db_list,
                None,
                exec.total_db_found,
                &cfg.skip_table_data,
            )
        } else {
            build_dump_args(
                &cfg.dump_args,
                &cfg.connection,
                &cfg.filter,
                &[],
                Some(&exec.db_name),
                exec.total_db_found,
                &cfg.skip_table_data,
            )
        }
    }

    /// Dumps one unit of work into its artifact and describes the result.
    pub async fn execute_and_build_backup(&self, exec: &BackupExecutionConfig) -> Result<DatabaseBackupInfo> {
        let cfg = self.config;
        let start_time = Local::now();
        let started = Instant::now();

        let server_version = match self.hooks.server_version().await {
            Ok(v) => v,
            Err(e) => {
                debug!("Server version unavailable: {:#}", e);
                String::new()
            }
        };

        let args = self.dump_args(exec);
        let database_names = exec.database_names();

        if cfg.dry_run {
            info!(
                "[dry-run] Would run: {} {} > {}",
                self.tool.name,
                mask_password_args(&args).join(" "),
                exec.output_path.display()
            );
            let mut info = DatabaseBackupInfoBuilder {
                database_name: exec.display_name(),
                databases: database_names,
                output_file: exec.output_path.clone(),
                file_size: 0,
                duration: started.elapsed(),
                status: BackupStatus::DryRun,
                warnings: String::new(),
                start_time,
                end_time: Local::now(),
                manifest_file: None,
            }
            .build();
            info.file_size_human = DRY_RUN_SIZE_LABEL.to_string();
            return Ok(info);
        }

        let runner = DumpRunner {
            tool: &self.tool,
            compression: &cfg.compression,
            encryption: &cfg.encryption,
            file_permissions: cfg.file_permissions,
            cancel: &self.cancel,
            registry: &self.registry,
        };
        let output_path = exec.output_path.as_path();
        let outcome = run_with_retry(
            args,
            output_path,
            &self.cancel,
            DEFAULT_STRATEGIES,
            MAX_DUMP_ATTEMPTS,
            |attempt_args| {
                let runner = &runner;
                async move { runner.run(&attempt_args, output_path).await }
            },
        )
        .await
        .with_context(|| format!("Backup of {} to {} failed", exec.label(), output_path.display()))?;

        let end_time = Local::now();
        let duration = started.elapsed();
        let stderr_output = outcome.result.stderr_output;
        let file_size = outcome.result.file_size;
        if outcome.attempts > 1 {
            info!("Backup of {} succeeded after {} attempts", exec.label(), outcome.attempts);
        }

        let status = if stderr_output.trim().is_empty() {
            BackupStatus::Success
        } else {
            BackupStatus::SuccessWithWarnings
        };
        let dump_version = extract_tool_version(&stderr_output).unwrap_or_else(|| self.dump_version.clone());

        let manifest_file = if cfg.save_backup_info {
            let meta = generate_backup_metadata(&MetadataInput {
                backup_file: output_path,
                backup_type: exec.backup_type,
                status,
                database_names: database_names.clone(),
                excluded_databases: &self.excluded_databases,
                start_time,
                end_time,
                duration,
                file_size,
                compression: &cfg.compression,
                encrypted: cfg.encryption.enabled,
                stderr_output: &stderr_output,
                hostname: &cfg.hostname,
                source_host: &cfg.connection.host,
                source_port: cfg.connection.port,
                replication_user: &cfg.replication_user,
                gtid: self.gtid.as_ref(),
                dump_version: &dump_version,
                server_version: &server_version,
                ticket: &cfg.ticket,
            });
            try_save_backup_metadata(&meta, cfg.metadata_permissions)
        } else {
            None
        };

        let warnings = if stderr_output.trim().is_empty() {
            String::new()
        } else {
            summarize_stderr(&stderr_output, 12, 1200)
        };

        let info = DatabaseBackupInfoBuilder {
            database_name: exec.display_name(),
            databases: database_names,
            output_file: exec.output_path.clone(),
            file_size,
            duration,
            status,
            warnings,
            start_time,
            end_time,
            manifest_file,
        }
        .build();

        info!(
            "✓ Backup completed: {} ({}, {}, {:.2} MB/s)",
            info.output_file.display(),
            info.file_size_human,
            info.duration,
            info.throughput_mb_s
        );
        Ok(info)
    }

    /// Writes `<stem>_users.sql` next to `backup_file`. `databases == None` exports every user.
    /// Returns the file written; failures are logged and never fail the backup.
    pub async fn export_user_grants(&self, backup_file: &Path, databases: Option<&[String]>) -> Option<PathBuf> {
        let cfg = self.config;
        if cfg.exclude_user {
            debug!("User grant export disabled by configuration");
            return None;
        }
        if cfg.dry_run {
            return None;
        }

        let grants = match self.hooks.export_user_grants(databases).await {
            Ok(Some(grants)) => grants,
            Ok(None) => {
                info!("No user grants to export");
                return None;
            }
            Err(e) => {
                warn!("Failed to export user grants: {:#}", e);
                return None;
            }
        };

        let path = user_grants_path(backup_file);
        let written = create_output_file(&path, cfg.metadata_permissions).and_then(|mut f| {
            f.write_all(grants.as_bytes())?;
            f.sync_all()
        });
        match written {
            Ok(()) => {
                info!("User grants saved: {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to write user grants to {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    /// Stores the grants file (or "none") in the artifact's manifest.
    pub fn record_user_grants(&self, backup_file: &Path, grants_file: Option<&Path>) {
        let cfg = self.config;
        if !cfg.save_backup_info || cfg.dry_run {
            return;
        }
        if let Err(e) = update_user_grants_path(backup_file, grants_file, cfg.metadata_permissions) {
            warn!("Failed to record user grants in metadata for {}: {}", backup_file.display(), e);
        }
    }

    /// Backs up `dbs` one at a time. A failure is recorded and the loop moves on;
    /// cancellation stops it.
    pub async fn execute_backup_loop<F>(
        &self,
        dbs: &[String],
        loop_config: &BackupLoopConfig,
        output_path_for: F,
    ) -> BackupLoopResult
    where
        F: Fn(&str) -> Result<PathBuf>,
    {
        let mut result = BackupLoopResult::default();

        for (i, db) in dbs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let message = format!("backup cancelled, {} database(s) skipped", dbs.len() - i);
                warn!("{}", message);
                result.errors.push(message);
                result.cancelled = true;
                break;
            }

            info!("[{}/{}] Backup database: {}", i + 1, loop_config.total_dbs, db);

            let outcome = match output_path_for(db) {
                Ok(path) => {
                    let exec = BackupExecutionConfig::single(db, path, loop_config.mode, loop_config.total_dbs);
                    self.execute_and_build_backup(&exec).await
                }
                Err(e) => Err(e.context(format!("Failed to determine output path for {}", db))),
            };

            match outcome {
                Ok(info) => {
                    if loop_config.mode.exports_grants_per_database() {
                        let grants = self
                            .export_user_grants(&info.output_file, Some(std::slice::from_ref(db)))
                            .await;
                        self.record_user_grants(&info.output_file, grants.as_deref());
                    }
                    result.success += 1;
                    result.backup_infos.push(info);
                }
                Err(e) if is_cancellation(&e) => {
                    let message = format!("backup cancelled during {}, {} database(s) skipped", db, dbs.len() - i - 1);
                    warn!("{}", message);
                    result.errors.push(message);
                    result.cancelled = true;
                    break;
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!("✗ Backup of {} failed: {}", db, message);
                    result.failed += 1;
                    result.errors.push(format!("{}: {}", db, message));
                    result.failed_dbs.push(FailedDatabaseInfo { database_name: db.clone(), error: message });
                }
            }
        }

        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::hooks::NoopHooks;
    use crate::backup::metadata::{load_backup_metadata, manifest_path};
    use crate::backup::types::BackupMode;
    use crate::config::test_config;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Prints the last argument as the current database; fails when it is `bad`.
    pub(crate) const FAKE_DUMP_SCRIPT: &str = r#"for last; do :; done
if [ "$last" = "bad" ]; then
  echo "mysqldump: Got error: 1049: Unknown database 'bad'" >&2
  exit 2
fi
printf -- '-- Current Database: `%s`\n-- args: %s\n-- Dump completed\n' "$last" "$*""#;

    struct GrantHooks;

    #[async_trait]
    impl ServerHooks for GrantHooks {
        async fn server_version(&self) -> anyhow::Result<String> {
            Ok("10.11.6-MariaDB".to_string())
        }

        async fn capture_gtid(&self) -> anyhow::Result<Option<GtidInfo>> {
            Ok(Some(GtidInfo {
                master_log_file: "mysql-bin.000007".into(),
                master_log_pos: 42,
                gtid_binlog: "0-1-7".into(),
            }))
        }

        async fn list_databases(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn export_user_grants(&self, databases: Option<&[String]>) -> anyhow::Result<Option<String>> {
            let scope = databases.map(|d| d.join(",")).unwrap_or_else(|| "*".to_string());
            Ok(Some(format!("GRANT SELECT ON {} TO 'app'@'%';\n", scope)))
        }
    }

    fn loop_config(mode: BackupMode, total: usize) -> BackupLoopConfig {
        BackupLoopConfig { mode, total_dbs: total }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_loop_isolates_failures() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let tool = crate::backup::runner::tests::fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        let out_dir = dir.path().join("out");
        let config = test_config(&out_dir);
        let engine = Engine::new(&config, tool, &NoopHooks, CancellationToken::new(), CleanupRegistry::new());

        let dbs = names(&["app", "bad", "billing"]);
        let result = engine
            .execute_backup_loop(&dbs, &loop_config(BackupMode::Separated, 3), |db| {
                Ok(out_dir.join(format!("{}.sql", db)))
            })
            .await;

        assert_eq!(result.success, 2);
        assert_eq!(result.failed, 1);
        assert!(!result.cancelled);
        assert_eq!(result.failed_dbs[0].database_name, "bad");
        assert!(result.failed_dbs[0].error.contains("Unknown database"));
        assert!(!out_dir.join("bad.sql").exists());

        let app = fs::read_to_string(out_dir.join("app.sql"))?;
        assert!(app.starts_with("-- Current Database: `app`"));
        let meta = load_backup_metadata(&out_dir.join("app.sql"))?;
        assert_eq!(meta.backup.backup_type, BackupMode::Separated);
        assert!(meta.source.is_none());
        assert_eq!(meta.additional_files.user_grants, "none");
        assert_eq!(result.backup_infos[1].database_name, "billing");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_single_backup_exports_grants_and_records_them() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let tool = crate::backup::runner::tests::fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        let config = test_config(dir.path());
        let hooks = GrantHooks;
        let mut engine = Engine::new(&config, tool, &hooks, CancellationToken::new(), CleanupRegistry::new());
        engine.capture_gtid().await;
        assert_eq!(engine.gtid().map(GtidInfo::describe).as_deref(), Some("0-1-7"));

        let backup_file = dir.path().join("app.sql");
        let dbs = names(&["app"]);
        let result = engine
            .execute_backup_loop(&dbs, &loop_config(BackupMode::Single, 1), |_| Ok(backup_file.clone()))
            .await;
        assert_eq!(result.success, 1);

        let grants = dir.path().join("app_users.sql");
        assert_eq!(fs::read_to_string(&grants)?, "GRANT SELECT ON app TO 'app'@'%';\n");
        let meta = load_backup_metadata(&backup_file)?;
        assert_eq!(meta.additional_files.user_grants, grants.display().to_string());
        assert_eq!(meta.version.mariadb, "10.11.6-MariaDB");
        assert_eq!(meta.replication.and_then(|r| r.master_log_pos), Some(42));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_loop_runs_nothing() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let config = test_config(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tool = DumpTool { name: "mysqldump".into(), path: PathBuf::from("/nonexistent/mysqldump") };
        let engine = Engine::new(&config, tool, &NoopHooks, cancel, CleanupRegistry::new());

        let result = engine
            .execute_backup_loop(&names(&["app", "billing"]), &loop_config(BackupMode::Separated, 2), |db| {
                Ok(dir.path().join(db))
            })
            .await;
        assert!(result.cancelled);
        assert_eq!(result.success + result.failed, 0);
        assert_eq!(result.errors, vec!["backup cancelled, 2 database(s) skipped".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut config = test_config(dir.path());
        config.dry_run = true;
        let tool = DumpTool { name: "mysqldump".into(), path: PathBuf::from("/nonexistent/mysqldump") };
        let engine = Engine::new(&config, tool, &NoopHooks, CancellationToken::new(), CleanupRegistry::new());

        let out = dir.path().join("app.sql");
        let exec = BackupExecutionConfig::single("app", out.clone(), BackupMode::Single, 1);
        let info = engine.execute_and_build_backup(&exec).await?;
        assert_eq!(info.status, BackupStatus::DryRun);
        assert_eq!(info.file_size_human, DRY_RUN_SIZE_LABEL);
        assert!(!out.exists());
        assert!(!manifest_path(&out).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_tool_fails_with_context() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let config = test_config(dir.path());
        let tool = DumpTool { name: "mysqldump".into(), path: dir.path().join("missing-tool") };
        let engine = Engine::new(&config, tool, &NoopHooks, CancellationToken::new(), CleanupRegistry::new());

        let out = dir.path().join("app.sql");
        let exec = BackupExecutionConfig::single("app", out.clone(), BackupMode::Single, 1);
        let err = engine.execute_and_build_backup(&exec).await.expect_err("spawn must fail");
        assert!(format!("{:#}", err).contains("Backup of app"));
        assert!(!is_cancellation(&err));
        assert!(!out.exists());
        Ok(())
    }
}
