// dumpvault/src/backup/hooks.rs
//! Server-side queries the engine needs around a dump: version, binlog position,
//! database discovery and user grants.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::backup::types::{ConnectionInfo, GtidInfo};
use crate::utils::find_first_executable;

pub const CLIENT_CANDIDATES: [&str; 2] = ["mariadb", "mysql"];

#[async_trait]
pub trait ServerHooks: Send + Sync {
    async fn server_version(&self) -> Result<String>;

    /// `Ok(None)` when binary logging is disabled.
    async fn capture_gtid(&self) -> Result<Option<GtidInfo>>;

    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Grant statements for users with access to `databases` (`None` means every user).
    /// `Ok(None)` when no user matched.
    async fn export_user_grants(&self, databases: Option<&[String]>) -> Result<Option<String>>;
}

/// Used when no SQL client is available. Every query reports "nothing".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl ServerHooks for NoopHooks {
    async fn server_version(&self) -> Result<String> {
        anyhow::bail!("no SQL client available to query the server version")
    }

    async fn capture_gtid(&self) -> Result<Option<GtidInfo>> {
        Ok(None)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn export_user_grants(&self, _databases: Option<&[String]>) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Quotes a string as a SQL literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Shells out to the `mariadb`/`mysql` command-line client in batch mode.
#[derive(Debug, Clone)]
pub struct MysqlClientHooks {
    client: PathBuf,
    conn: ConnectionInfo,
}

impl MysqlClientHooks {
    pub fn new(client: PathBuf, conn: ConnectionInfo) -> Self {
        MysqlClientHooks { client, conn }
    }

    /// Finds a client binary in PATH.
    pub fn resolve(conn: &ConnectionInfo) -> Option<Self> {
        find_first_executable(&CLIENT_CANDIDATES).map(|(_, path)| MysqlClientHooks::new(path, conn.clone()))
    }

    fn connection_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.conn.host.is_empty() {
            args.push(format!("--host={}", self.conn.host));
        }
        if self.conn.port != 0 {
            args.push(format!("--port={}", self.conn.port));
        }
        if !self.conn.user.is_empty() {
            args.push(format!("--user={}", self.conn.user));
        }
        args
    }

    /// Runs one statement and returns its rows split on tabs.
    async fn query(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        debug!("SQL client query: {}", sql);
        let mut cmd = Command::new(&self.client);
        cmd.args(self.connection_args()).args(["-N", "-B", "-e", sql]).kill_on_drop(true);
        if !self.conn.password.is_empty() {
            cmd.env("MYSQL_PWD", &self.conn.password);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run SQL client {}", self.client.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "SQL client failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.split('\t').map(str::to_string).collect())
            .collect())
    }

    async fn single_value(&self, sql: &str) -> Result<Option<String>> {
        let rows = self.query(sql).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .filter(|v| v != "NULL"))
    }
}

#[async_trait]
impl ServerHooks for MysqlClientHooks {
    async fn server_version(&self) -> Result<String> {
        self.single_value("SELECT VERSION()")
            .await?
            .context("Server returned no version")
    }

    async fn capture_gtid(&self) -> Result<Option<GtidInfo>> {
        let rows = self.query("SHOW MASTER STATUS").await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let master_log_file = row.first().cloned().unwrap_or_default();
        let master_log_pos = row
            .get(1)
            .map(|p| p.parse::<u64>())
            .transpose()
            .context("Unexpected binlog position in SHOW MASTER STATUS")?
            .unwrap_or(0);

        let gtid_sql = format!("SELECT BINLOG_GTID_POS({}, {})", sql_literal(&master_log_file), master_log_pos);
        let gtid_binlog = match self.single_value(&gtid_sql).await {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                debug!("BINLOG_GTID_POS unavailable: {}", e);
                String::new()
            }
        };

        Ok(Some(GtidInfo { master_log_file, master_log_pos, gtid_binlog }))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let rows = self.query("SHOW DATABASES").await?;
        Ok(rows.into_iter().filter_map(|row| row.into_iter().next()).collect())
    }

    async fn export_user_grants(&self, databases: Option<&[String]>) -> Result<Option<String>> {
        let users_sql = match databases {
            None => "SELECT CONCAT(QUOTE(User), '@', QUOTE(Host)) FROM mysql.user WHERE User <> ''".to_string(),
            Some(dbs) => {
                let list: Vec<String> = dbs.iter().map(|db| sql_literal(db)).collect();
                format!(
                    "SELECT DISTINCT CONCAT(QUOTE(User), '@', QUOTE(Host)) FROM mysql.db WHERE Db IN ({})",
                    list.join(", ")
                )
            }
        };
        let users: Vec<String> = self
            .query(&users_sql)
            .await?
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect();
        if users.is_empty() {
            return Ok(None);
        }

        let mut out = String::from("-- User grants exported by dumpvault\n\n");
        for user in &users {
            let grants = self
                .query(&format!("SHOW GRANTS FOR {}", user))
                .await
                .with_context(|| format!("Failed to read grants for {}", user))?;
            out.push_str(&format!("-- Grants for {}\n", user));
            for grant in grants.into_iter().filter_map(|row| row.into_iter().next()) {
                out.push_str(&grant);
                out.push_str(";\n");
            }
            out.push('\n');
        }
        Ok(Some(out))
    }
}
