// dumpvault/src/backup/mod.rs
pub(crate) mod args;
pub(crate) mod compress;
pub(crate) mod crypto;
pub(crate) mod engine;
pub(crate) mod guard;
pub(crate) mod hooks;
pub(crate) mod metadata;
pub(crate) mod modes;
pub(crate) mod monitor;
pub(crate) mod paths;
pub(crate) mod pipeline;
pub(crate) mod retry;
pub(crate) mod runner;
pub(crate) mod selection;
pub(crate) mod types;
pub(crate) mod verify;

use anyhow::{Context, Result};
use chrono::Local;
use std::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BackupConfig;
use engine::Engine;
use guard::CleanupRegistry;
use hooks::{MysqlClientHooks, NoopHooks, ServerHooks};
use paths::OutputNaming;
use runner::DumpTool;
use selection::{companion_group, filter_databases, select_target};
use types::{BackupMode, BackupResult};

/// Public entry point for the backup process: resolves tools, selects databases and
/// hands the run to the configured mode.
pub async fn run_backup_flow(
    config: &BackupConfig,
    cancel: CancellationToken,
    registry: CleanupRegistry,
) -> Result<BackupResult> {
    let tool = DumpTool::resolve(config.dump_binary.as_deref()).context("Failed to locate a dump tool")?;
    info!("Using dump tool: {} ({})", tool.name, tool.path.display());

    let client_hooks = MysqlClientHooks::resolve(&config.connection);
    let hooks: &dyn ServerHooks = match &client_hooks {
        Some(h) => h,
        None => {
            warn!("No mariadb/mysql client found; GTID capture and grant export are disabled");
            &NoopHooks
        }
    };

    run_with_hooks(config, tool, hooks, cancel, registry).await
}

async fn run_with_hooks(
    config: &BackupConfig,
    tool: DumpTool,
    hooks: &dyn ServerHooks,
    cancel: CancellationToken,
    registry: CleanupRegistry,
) -> Result<BackupResult> {
    let available = if config.databases.is_empty() {
        hooks.list_databases().await.context("Failed to list databases on the server")?
    } else {
        config.databases.clone()
    };
    if available.is_empty() {
        anyhow::bail!("No databases configured and none discovered on the server");
    }

    let selection = filter_databases(&available, &config.filter);
    if selection.selected.is_empty() {
        anyhow::bail!("No databases left to back up after applying filters");
    }
    if !selection.excluded.is_empty() {
        info!("Excluded by filter: {}", selection.excluded.join(", "));
    }

    let dbs = if config.mode.is_single_variant() {
        let target = select_target(&selection.selected, config.mode, config.db_name.as_deref())
            .with_context(|| format!("Failed to pick the {} database", config.mode))?;
        match config.mode {
            BackupMode::Single => vec![target],
            _ => companion_group(&target, &selection.selected),
        }
    } else {
        selection.selected.clone()
    };
    let total_found = match config.total_databases_found {
        Some(n) => n,
        None if config.databases.is_empty() => available.len(),
        None => server_database_count(hooks).await,
    };

    if !config.dry_run {
        fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("Failed to create output directory {}", config.output_dir.display()))?;
    }

    let naming = OutputNaming {
        output_dir: config.output_dir.clone(),
        hostname: config.hostname.clone(),
        custom_filename: config.filename.clone(),
        compression: config.compression.effective_type(),
        encrypted: config.encryption.enabled,
        timestamp: Local::now(),
    };

    let mut engine =
        Engine::new(config, tool, hooks, cancel, registry).with_excluded_databases(selection.excluded);
    engine.load_dump_version().await;

    info!("📂 Starting {} backup of {} database(s) into {}", config.mode, dbs.len(), config.output_dir.display());
    let result = modes::run_mode(&mut engine, &naming, config.mode, &dbs, total_found).await;

    for info in &result.backup_infos {
        info!("  {} -> {} ({})", info.display_label(), info.output_file.display(), info.file_size_human);
    }
    for failed in &result.failed_database_infos {
        warn!("  ✗ {}: {}", failed.database_name, failed.error);
    }
    info!("Backup finished: {}", result.summary_line());

    Ok(result)
}

/// How many databases the server holds, for a run whose list came from config.json.
/// Zero when the server cannot be asked, so a configured list is never taken for "everything".
async fn server_database_count(hooks: &dyn ServerHooks) -> usize {
    match hooks.list_databases().await {
        Ok(all) => all.len(),
        Err(e) => {
            warn!("Could not count databases on the server: {:#}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::engine::tests::FAKE_DUMP_SCRIPT;
    #[cfg(unix)]
    use crate::backup::runner::tests::fake_tool;
    use crate::backup::types::GtidInfo;
    use crate::config::test_config;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// A server holding a fixed set of databases.
    struct ServerWith(Vec<String>);

    #[async_trait]
    impl ServerHooks for ServerWith {
        async fn server_version(&self) -> Result<String> {
            Ok("10.11.6-MariaDB".to_string())
        }

        async fn capture_gtid(&self) -> Result<Option<GtidInfo>> {
            Ok(None)
        }

        async fn list_databases(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }

        async fn export_user_grants(&self, _databases: Option<&[String]>) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn dumped_args(path: &std::path::Path) -> anyhow::Result<String> {
        let text = fs::read_to_string(path)?;
        Ok(text.lines().find_map(|l| l.strip_prefix("-- args: ")).unwrap_or_default().to_string())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configured_list_is_dumped_by_name() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let tool = fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        let mut config = test_config(&dir.path().join("out"));
        config.databases = names(&["app", "billing"]);
        let server = ServerWith(names(&["app", "billing", "crm", "mysql"]));

        let result = run_with_hooks(&config, tool, &server, CancellationToken::new(), CleanupRegistry::new()).await?;
        assert_eq!(result.successful_backups, 2);
        let args = dumped_args(&result.backup_infos[0].output_file)?;
        assert!(args.ends_with("--databases app billing"), "{}", args);
        assert!(!args.contains("--all-databases"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_configured_list_without_server_access_is_never_everything() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let tool = fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        let mut config = test_config(&dir.path().join("out"));
        config.databases = names(&["app", "billing"]);

        let result = run_with_hooks(&config, tool, &NoopHooks, CancellationToken::new(), CleanupRegistry::new()).await?;
        let args = dumped_args(&result.backup_infos[0].output_file)?;
        assert!(args.ends_with("--databases app billing"), "{}", args);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_discovered_databases_use_all_databases() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let tool = fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        let config = test_config(&dir.path().join("out"));
        let server = ServerWith(names(&["app", "billing"]));

        let result = run_with_hooks(&config, tool, &server, CancellationToken::new(), CleanupRegistry::new()).await?;
        let args = dumped_args(&result.backup_infos[0].output_file)?;
        assert!(args.ends_with("--all-databases"), "{}", args);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_primary_mode_skips_companion_as_target() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let tool = fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        let mut config = test_config(&dir.path().join("out"));
        config.mode = BackupMode::Primary;
        config.databases = names(&["app_dmart", "app"]);

        let result = run_with_hooks(&config, tool, &NoopHooks, CancellationToken::new(), CleanupRegistry::new()).await?;
        assert_eq!(result.total_databases, 2);
        assert_eq!(result.backup_infos.len(), 1);
        assert_eq!(result.backup_infos[0].databases, names(&["app", "app_dmart"]));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_db_name_picks_the_target() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let tool = fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        let mut config = test_config(&dir.path().join("out"));
        config.mode = BackupMode::Single;
        config.databases = names(&["app", "billing"]);
        config.db_name = Some("billing".to_string());

        let result = run_with_hooks(&config, tool, &NoopHooks, CancellationToken::new(), CleanupRegistry::new()).await?;
        assert_eq!(result.backup_infos.len(), 1);
        assert_eq!(result.backup_infos[0].database_name, "billing");

        config.db_name = Some("missing".to_string());
        let tool = fake_tool(dir.path(), "mysqldump", FAKE_DUMP_SCRIPT)?;
        assert!(run_with_hooks(&config, tool, &NoopHooks, CancellationToken::new(), CleanupRegistry::new()).await.is_err());
        Ok(())
    }
}
