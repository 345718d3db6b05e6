// dumpvault/src/backup/args.rs
//! Builds the argument vector handed to `mariadb-dump`/`mysqldump`.

use crate::backup::types::{ConnectionInfo, FilterOptions};

pub const ALL_DATABASES_FLAG: &str = "--all-databases";
pub const DATABASES_FLAG: &str = "--databases";
pub const NO_DATA_FLAG: &str = "--no-data";

/// Builds dump-tool arguments from connection info, filter rules and the database selection.
///
/// Order of precedence:
/// 1. connection flags, 2. configured base args, 3. `--no-data`,
/// 4. an explicit single database ends the list,
/// 5. no filter and every discovered database selected gives `--all-databases`,
/// 6. one filtered database is emitted alone,
/// 7. otherwise `--databases` followed by the filtered list.
///
/// `skip_tables_data` adds `--ignore-table-data=<db>.<table>` only when exactly one database is targeted.
pub fn build_dump_args(
    base_args: &str,
    conn: &ConnectionInfo,
    filter: &FilterOptions,
    filtered: &[String],
    single_db: Option<&str>,
    total_found: usize,
    skip_tables_data: &[String],
) -> Vec<String> {
    let mut args = Vec::new();

    if !conn.host.is_empty() {
        args.push(format!("--host={}", conn.host));
    }
    if conn.port != 0 {
        args.push(format!("--port={}", conn.port));
    }
    if !conn.user.is_empty() {
        args.push(format!("--user={}", conn.user));
    }
    if !conn.password.is_empty() {
        args.push(format!("--password={}", conn.password));
    }

    args.extend(base_args.split_whitespace().map(str::to_string));

    if filter.exclude_data {
        args.push(NO_DATA_FLAG.to_string());
    }

    let single_db = single_db.filter(|db| !db.is_empty());
    let target_db = match (single_db, filtered) {
        (Some(db), _) => Some(db),
        (None, [only]) => Some(only.as_str()),
        _ => None,
    };
    if let Some(db) = target_db {
        for table in skip_tables_data.iter().filter(|t| !t.trim().is_empty()) {
            args.push(format!("--ignore-table-data={}.{}", db, table.trim()));
        }
    }

    if let Some(db) = single_db {
        args.push(db.to_string());
        return args;
    }

    if !filter.has_active_filter() && filtered.len() == total_found {
        args.push(ALL_DATABASES_FLAG.to_string());
        return args;
    }

    match filtered {
        [] => {}
        [only] => args.push(only.clone()),
        many => {
            args.push(DATABASES_FLAG.to_string());
            args.extend(many.iter().cloned());
        }
    }

    args
}

/// Copy of `args` with password values masked, safe for logging.
pub fn mask_password_args(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            if arg.starts_with("--password=") {
                "--password=********".to_string()
            } else if arg.starts_with("-p") && arg.len() > 2 && !arg.starts_with("--") {
                "-p********".to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            host: "db1.internal".into(),
            port: 3306,
            user: "backup".into(),
            password: "s3cret".into(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_connection_flags_come_first_then_base_args() {
        let args = build_dump_args(
            "--single-transaction  --quick",
            &conn(),
            &FilterOptions::default(),
            &[],
            Some("app"),
            5,
            &[],
        );
        assert_eq!(
            args,
            names(&[
                "--host=db1.internal",
                "--port=3306",
                "--user=backup",
                "--password=s3cret",
                "--single-transaction",
                "--quick",
                "app",
            ])
        );
    }

    #[test]
    fn test_single_db_short_circuits_filter_logic() {
        let filter = FilterOptions { exclude_data: true, ..Default::default() };
        let filtered = names(&["a", "b", "c"]);
        let args = build_dump_args("", &ConnectionInfo::default(), &filter, &filtered, Some("app"), 3, &[]);
        assert_eq!(args, names(&["--no-data", "app"]));
        assert!(!args.contains(&ALL_DATABASES_FLAG.to_string()));
    }

    #[test]
    fn test_unfiltered_full_selection_dumps_everything() {
        let filtered = names(&["a", "b", "c"]);
        let args = build_dump_args("", &ConnectionInfo::default(), &FilterOptions::default(), &filtered, None, 3, &[]);
        assert_eq!(args.last().map(String::as_str), Some(ALL_DATABASES_FLAG));
        assert!(!args.iter().any(|a| filtered.contains(a)));
    }

    #[test]
    fn test_active_filter_forces_explicit_list() {
        let filter = FilterOptions { exclude_system: true, ..Default::default() };
        let filtered = names(&["a", "b"]);
        let args = build_dump_args("", &ConnectionInfo::default(), &filter, &filtered, None, 2, &[]);
        assert_eq!(args, names(&["--databases", "a", "b"]));
    }

    #[test]
    fn test_single_filtered_database_is_emitted_alone() {
        let filtered = names(&["only_one"]);
        let args = build_dump_args("", &ConnectionInfo::default(), &FilterOptions::default(), &filtered, None, 4, &[]);
        assert_eq!(args, names(&["only_one"]));
    }

    #[test]
    fn test_skip_table_data_only_for_single_target() {
        let skip = names(&["pageview", "", "sessions"]);
        let args = build_dump_args("", &ConnectionInfo::default(), &FilterOptions::default(), &[], Some("app"), 1, &skip);
        assert_eq!(
            args,
            names(&["--ignore-table-data=app.pageview", "--ignore-table-data=app.sessions", "app"])
        );

        let filtered = names(&["a", "b"]);
        let args = build_dump_args("", &ConnectionInfo::default(), &FilterOptions::default(), &filtered, None, 5, &skip);
        assert_eq!(args, names(&["--databases", "a", "b"]));
    }

    #[test]
    fn test_builder_is_deterministic() {
        let filtered = names(&["x", "y"]);
        let filter = FilterOptions { exclude_databases: names(&["z"]), ..Default::default() };
        let first = build_dump_args("--quick", &conn(), &filter, &filtered, None, 3, &[]);
        for _ in 0..5 {
            assert_eq!(build_dump_args("--quick", &conn(), &filter, &filtered, None, 3, &[]), first);
        }
    }

    #[test]
    fn test_mask_password_args() {
        let masked = mask_password_args(&names(&["--user=root", "--password=abc", "-pabc", "--port=1", "-p"]));
        assert_eq!(
            masked,
            names(&["--user=root", "--password=********", "-p********", "--port=1", "-p"])
        );
    }
}
