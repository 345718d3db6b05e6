// dumpvault/src/backup/runner.rs
//! Runs one dump-tool invocation and streams its stdout into the artifact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::args::mask_password_args;
use crate::backup::guard::CleanupRegistry;
use crate::backup::monitor::ProgressMonitor;
use crate::backup::pipeline::Pipeline;
use crate::backup::types::{BackupWriteResult, CompressionSettings, EncryptionOptions};
use crate::errors::{BackupError, Result};
use crate::utils::{find_first_executable, summarize_stderr};

pub const DUMP_TOOL_CANDIDATES: [&str; 2] = ["mariadb-dump", "mysqldump"];

const STDOUT_CHUNK_SIZE: usize = 64 * 1024;
const STDERR_CAP: usize = 1024 * 1024;

const SEVERE_PATTERNS: &[&str] = &[
    "access denied",
    "unknown database",
    "unknown server",
    "can't connect",
    "connection refused",
    "permission denied",
    "no such file or directory",
    "got error:",
    "error:",
    "failed",
];

const BENIGN_PATTERNS: &[&str] = &[
    "couldn't read keys from table",
    "references invalid table(s) or column(s) or function(s)",
    "definer/invoker of view lack rights",
    "warning:",
    "note:",
];

/// The resolved dump binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpTool {
    pub name: String,
    pub path: PathBuf,
}

impl DumpTool {
    /// An explicit path wins; otherwise `mariadb-dump` then `mysqldump` from PATH.
    pub fn resolve(explicit: Option<&Path>) -> Result<DumpTool> {
        if let Some(path) = explicit {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            return Ok(DumpTool { name, path: path.to_path_buf() });
        }
        find_first_executable(&DUMP_TOOL_CANDIDATES)
            .map(|(name, path)| DumpTool { name, path })
            .ok_or_else(|| BackupError::DumpToolNotFound(DUMP_TOOL_CANDIDATES.join(", ")))
    }

    /// Runs `<tool> --version` and extracts the version line.
    pub async fn version(&self) -> Option<String> {
        let output = Command::new(&self.path).arg("--version").output().await.ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        extract_tool_version(&text)
    }
}

/// Finds a `mysqldump ... Ver ...` / `mariadb-dump ... Ver ...` line.
pub fn extract_tool_version(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| {
            (line.starts_with("mysqldump") || line.starts_with("mariadb-dump")) && line.contains("Ver")
        })
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Error exit with a known-benign diagnostic; the artifact is usable.
    NonFatal,
    Fatal,
}

/// Classifies a finished dump line by line. A line naming a benign condition is benign even
/// when it also carries an error prefix; any other line with a severe pattern is fatal.
/// An error exit with no benign line at all fails closed.
pub fn classify_exit(exited_ok: bool, stderr: &str) -> ExitClass {
    if exited_ok {
        return ExitClass::Success;
    }
    let mut benign_seen = false;
    for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let lower = line.to_lowercase();
        if BENIGN_PATTERNS.iter().any(|p| lower.contains(p)) {
            benign_seen = true;
        } else if SEVERE_PATTERNS.iter().any(|p| lower.contains(p)) {
            debug!("Fatal dump diagnostic: {}", line);
            return ExitClass::Fatal;
        }
    }
    if benign_seen {
        return ExitClass::NonFatal;
    }
    if !stderr.trim().is_empty() {
        warn!(
            "Unclassified dump diagnostic, treating as fatal: {}",
            summarize_stderr(stderr, 5, 500)
        );
    }
    ExitClass::Fatal
}

/// A failed attempt. `stderr` is `None` when the attempt failed before the tool produced a result.
#[derive(Debug)]
pub struct AttemptFailure {
    pub error: BackupError,
    pub stderr: Option<String>,
}

impl AttemptFailure {
    fn early(error: impl Into<BackupError>) -> Self {
        AttemptFailure { error: error.into(), stderr: None }
    }
}

/// Removes a failed artifact. Missing files are fine.
pub fn remove_partial_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("Removed failed backup file: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove failed backup file {}: {}", path.display(), e),
    }
}

async fn drain_stderr<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_CAP.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

/// Everything one attempt needs besides the argument list.
pub struct DumpRunner<'a> {
    pub tool: &'a DumpTool,
    pub compression: &'a CompressionSettings,
    pub encryption: &'a EncryptionOptions,
    pub file_permissions: u32,
    pub cancel: &'a CancellationToken,
    pub registry: &'a CleanupRegistry,
}

impl DumpRunner<'_> {
    /// Runs the dump once. On any failure the artifact at `output_path` is removed before returning.
    pub async fn run(
        &self,
        args: &[String],
        output_path: &Path,
    ) -> std::result::Result<BackupWriteResult, AttemptFailure> {
        let _guard = self.registry.register(output_path);
        let result = self.run_inner(args, output_path).await;
        if result.is_err() {
            remove_partial_file(output_path);
        }
        result
    }

    async fn run_inner(
        &self,
        args: &[String],
        output_path: &Path,
    ) -> std::result::Result<BackupWriteResult, AttemptFailure> {
        if self.cancel.is_cancelled() {
            return Err(AttemptFailure::early(BackupError::Cancelled("before dump start".to_string())));
        }

        debug!("Dump command: {} {}", self.tool.path.display(), mask_password_args(args).join(" "));

        let pipeline = Pipeline::create(output_path, self.compression, self.encryption, self.file_permissions)
            .map_err(AttemptFailure::early)?;
        debug!("Output pipeline: {}", pipeline.layers().join(" <- "));

        let mut child = Command::new(&self.tool.path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AttemptFailure::early(BackupError::Spawn { tool: self.tool.name.clone(), source }))?;

        let (Some(mut stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(AttemptFailure::early(BackupError::InvalidInput(
                "dump process has no stdout/stderr pipes".to_string(),
            )));
        };
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        let mut monitor = ProgressMonitor::new(pipeline);
        let mut buf = vec![0u8; STDOUT_CHUNK_SIZE];
        let mut write_error = None;
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = monitor.write_all(&buf[..n]) {
                            write_error = Some(e);
                            break;
                        }
                    }
                    Err(e) => {
                        write_error = Some(e);
                        break;
                    }
                },
            }
        }

        if cancelled || write_error.is_some() {
            let _ = child.kill().await;
        }
        let status = child.wait().await.map_err(AttemptFailure::early)?;
        let stderr_output = stderr_task.await.unwrap_or_default();

        if cancelled {
            monitor.finish(false);
            return Err(AttemptFailure::early(BackupError::Cancelled(format!(
                "dump of {} interrupted",
                output_path.display()
            ))));
        }
        if let Some(e) = write_error {
            monitor.finish(false);
            return Err(AttemptFailure { error: e.into(), stderr: Some(stderr_output) });
        }

        let class = classify_exit(status.success(), &stderr_output);
        monitor.finish(class != ExitClass::Fatal);
        if class == ExitClass::Fatal {
            return Err(AttemptFailure {
                error: BackupError::DumpFailed {
                    tool: self.tool.name.clone(),
                    status: status.to_string(),
                    excerpt: summarize_stderr(&stderr_output, 20, 2000),
                },
                stderr: Some(stderr_output),
            });
        }

        monitor
            .into_inner()
            .close()
            .map_err(|e| AttemptFailure { error: e.into(), stderr: Some(stderr_output.clone()) })?;

        match class {
            ExitClass::NonFatal => warn!(
                "Dump exited with {} but only reported non-fatal diagnostics: {}",
                status,
                summarize_stderr(&stderr_output, 12, 1200)
            ),
            _ if !stderr_output.trim().is_empty() => {
                debug!("Dump stderr: {}", summarize_stderr(&stderr_output, 12, 1200))
            }
            _ => {}
        }

        let file_size = fs::metadata(output_path)
            .map_err(|e| AttemptFailure { error: e.into(), stderr: Some(stderr_output.clone()) })?
            .len();
        Ok(BackupWriteResult { stderr_output, file_size })
    }
}
