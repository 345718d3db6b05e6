// dumpvault/src/backup/selection.rs
use crate::backup::paths::COMPANION_SUFFIXES;
use crate::backup::types::{BackupMode, FilterOptions};
use crate::errors::{BackupError, Result};

pub const SECONDARY_MARKER: &str = "_secondary";
const DMART_SUFFIX: &str = "_dmart";
const UNSUPPORTED_TARGET_SUFFIXES: [&str; 2] = ["_temp", "_archive"];

pub const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "performance_schema", "mysql", "sys"];

pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.iter().any(|s| s.eq_ignore_ascii_case(name))
}

/// Databases picked by the filter rules and the rest. Both keep the order of `available`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub selected: Vec<String>,
    pub excluded: Vec<String>,
}

pub fn filter_databases(available: &[String], filter: &FilterOptions) -> Selection {
    let mut selection = Selection::default();
    for db in available {
        let keep = (filter.include_databases.is_empty() || filter.include_databases.contains(db))
            && !filter.exclude_databases.contains(db)
            && !(filter.exclude_system && is_system_database(db));
        if keep {
            selection.selected.push(db.clone());
        } else {
            selection.excluded.push(db.clone());
        }
    }
    selection
}

fn has_suffix(name: &str, suffixes: &[&str]) -> bool {
    let lower = name.to_lowercase();
    suffixes.iter().any(|s| lower.ends_with(s))
}

/// Databases that may be the target of a single/primary/secondary run, in selection order.
/// Companion copies are never targets. Primary skips secondary instances; secondary keeps only them.
pub fn mode_candidates(selected: &[String], mode: BackupMode) -> Vec<String> {
    selected
        .iter()
        .filter(|db| !is_system_database(db))
        .filter(|db| !has_suffix(db, &UNSUPPORTED_TARGET_SUFFIXES) && !has_suffix(db, &[DMART_SUFFIX]))
        .filter(|db| {
            let secondary = db.to_lowercase().contains(SECONDARY_MARKER);
            match mode {
                BackupMode::Primary => !secondary,
                BackupMode::Secondary => secondary,
                _ => true,
            }
        })
        .cloned()
        .collect()
}

/// Picks the target of a single-variant run: the configured `db_name` when set, which must
/// survive the filters, else the first mode candidate.
pub fn select_target(selected: &[String], mode: BackupMode, db_name: Option<&str>) -> Result<String> {
    if let Some(name) = db_name {
        if has_suffix(name, &UNSUPPORTED_TARGET_SUFFIXES) {
            return Err(BackupError::InvalidInput(format!(
                "{} cannot be backed up on its own: _temp and _archive databases only travel as companions",
                name
            )));
        }
        return selected
            .iter()
            .find(|db| db.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| BackupError::InvalidInput(format!("database {} is not among the selected databases", name)));
    }
    mode_candidates(selected, mode)
        .into_iter()
        .next()
        .ok_or_else(|| BackupError::InvalidInput(format!("no database qualifies as a {} target", mode)))
}

/// `primary` followed by the companions of it present in `available`, in suffix order.
pub fn companion_group(primary: &str, available: &[String]) -> Vec<String> {
    let mut group = vec![primary.to_string()];
    for suffix in COMPANION_SUFFIXES {
        let name = format!("{}{}", primary, suffix);
        if available.contains(&name) {
            group.push(name);
        }
    }
    group
}
