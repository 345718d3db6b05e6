// dumpvault/src/backup/modes.rs
//! Mode orchestration: combined/all write one artifact, the rest iterate per database.

use std::fs;
use tracing::{error, info, warn};

use crate::backup::engine::Engine;
use crate::backup::metadata::update_with_database_details;
use crate::backup::paths::OutputNaming;
use crate::backup::types::{
    BackupExecutionConfig, BackupLoopConfig, BackupLoopResult, BackupMode, BackupResult, BackupStatus,
    DatabaseBackupInfo, FailedDatabaseInfo, MAX_DISPLAY_DATABASES,
};
use crate::errors::is_cancellation;
use crate::utils::format::{format_duration, format_file_size, throughput_mb_per_sec};

pub const ALL_DATABASES_FAILED: &str = "backup failed for all databases";

pub async fn run_mode(
    engine: &mut Engine<'_>,
    naming: &OutputNaming,
    mode: BackupMode,
    dbs: &[String],
    total_found: usize,
) -> BackupResult {
    if mode.is_combined() {
        execute_combined(engine, naming, mode, dbs, total_found).await
    } else {
        execute_iterative(engine, naming, mode, dbs).await
    }
}

fn log_database_list(dbs: &[String]) {
    if dbs.len() > MAX_DISPLAY_DATABASES {
        info!(
            "Backing up {} databases in one file (first {}: {}, ...)",
            dbs.len(),
            MAX_DISPLAY_DATABASES,
            dbs[..MAX_DISPLAY_DATABASES].join(", ")
        );
    } else {
        info!("Backing up {} database(s) in one file: {}", dbs.len(), dbs.join(", "));
    }
}

async fn execute_combined(
    engine: &mut Engine<'_>,
    naming: &OutputNaming,
    mode: BackupMode,
    dbs: &[String],
    total_found: usize,
) -> BackupResult {
    log_database_list(dbs);
    engine.capture_gtid().await;

    let exec = BackupExecutionConfig::multi(dbs, naming.combined_path(mode), mode, total_found);
    match engine.execute_and_build_backup(&exec).await {
        Ok(info) => {
            // mode all carries every user; combined only those touching the selection
            let scope = if mode == BackupMode::All { None } else { Some(dbs) };
            let grants = engine.export_user_grants(&info.output_file, scope).await;
            engine.record_user_grants(&info.output_file, grants.as_deref());
            BackupResult {
                total_databases: dbs.len(),
                successful_backups: dbs.len(),
                backup_infos: vec![info],
                ..Default::default()
            }
        }
        Err(e) => {
            let message = format!("{:#}", e);
            error!("✗ {} backup failed: {}", mode, message);
            BackupResult {
                total_databases: dbs.len(),
                failed_backups: dbs.len(),
                failed_database_infos: dbs
                    .iter()
                    .map(|db| FailedDatabaseInfo { database_name: db.clone(), error: message.clone() })
                    .collect(),
                cancelled: is_cancellation(&e),
                errors: vec![message],
                ..Default::default()
            }
        }
    }
}

async fn execute_iterative(
    engine: &mut Engine<'_>,
    naming: &OutputNaming,
    mode: BackupMode,
    dbs: &[String],
) -> BackupResult {
    if mode.is_single_variant() {
        engine.capture_gtid().await;
    }
    let primary = if mode.is_single_variant() { dbs.first().map(String::as_str) } else { None };

    let engine: &Engine<'_> = engine;
    let loop_config = BackupLoopConfig { mode, total_dbs: dbs.len() };
    let mut loop_result = engine
        .execute_backup_loop(dbs, &loop_config, |db| Ok(naming.iterative_path(mode, primary, db)))
        .await;

    if mode.groups_companions() && !loop_result.backup_infos.is_empty() {
        finalize_group(engine, &mut loop_result).await;
    }

    if mode.is_single_variant() && loop_result.success == 0 && loop_result.failed > 0 {
        loop_result.errors.push(ALL_DATABASES_FAILED.to_string());
    }

    let mut result = BackupResult::from(loop_result);
    result.total_databases = dbs.len();
    result
}

/// Folds the per-database results of a primary/secondary group into one entry whose
/// manifest (the primary's) lists every member.
async fn finalize_group(engine: &Engine<'_>, loop_result: &mut BackupLoopResult) {
    let infos = std::mem::take(&mut loop_result.backup_infos);
    let Some(anchor) = infos.first() else {
        return;
    };
    let names: Vec<String> = infos.iter().map(|i| i.database_name.clone()).collect();

    let grants = engine.export_user_grants(&anchor.output_file, Some(names.as_slice())).await;

    let cfg = engine.config();
    if cfg.save_backup_info && !cfg.dry_run {
        if let Err(e) = update_with_database_details(&anchor.output_file, &names, &infos, cfg.metadata_permissions) {
            warn!("Failed to write group metadata for {}: {}", anchor.output_file.display(), e);
        }
        for companion in &infos[1..] {
            if let Some(manifest) = &companion.manifest_file {
                if let Err(e) = fs::remove_file(manifest) {
                    warn!("Failed to remove companion manifest {}: {}", manifest.display(), e);
                }
            }
        }
        engine.record_user_grants(&anchor.output_file, grants.as_deref());
    }

    loop_result.backup_infos = vec![aggregate_backup_infos(infos)];
}

/// One entry for a primary and its companions: summed size, the primary's file and manifest.
pub fn aggregate_backup_infos(mut infos: Vec<DatabaseBackupInfo>) -> DatabaseBackupInfo {
    if infos.len() <= 1 {
        if let Some(only) = infos.pop() {
            return only;
        }
    }
    let mut primary = infos.remove(0);
    let companions = infos;

    let total_size = primary.file_size + companions.iter().map(|c| c.file_size).sum::<u64>();
    let start_time = primary.start_time;
    let end_time = companions.last().map(|c| c.end_time).unwrap_or(primary.end_time);
    let elapsed = (end_time - start_time).to_std().unwrap_or_default();

    let mut databases = vec![primary.database_name.clone()];
    databases.extend(companions.iter().map(|c| c.database_name.clone()));

    let mut warnings: Vec<String> = Vec::new();
    if !primary.warnings.is_empty() {
        warnings.push(primary.warnings.clone());
    }
    warnings.extend(companions.iter().filter(|c| !c.warnings.is_empty()).map(|c| c.warnings.clone()));

    let any_warnings = std::iter::once(&primary)
        .chain(companions.iter())
        .any(|i| i.status == BackupStatus::SuccessWithWarnings);

    primary.database_name = format!("{} + {} companion databases", primary.database_name, companions.len());
    primary.databases = databases;
    primary.file_size = total_size;
    primary.file_size_human = format_file_size(total_size);
    primary.end_time = end_time;
    primary.duration = format_duration(elapsed);
    primary.throughput_mb_s = throughput_mb_per_sec(total_size, elapsed);
    primary.warnings = warnings.join("\n");
    if any_warnings {
        primary.status = BackupStatus::SuccessWithWarnings;
    }
    primary
}
