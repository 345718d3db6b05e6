// dumpvault/src/backup/retry.rs
//! Bounded retry of a dump with argument-rewriting strategies keyed off stderr text.

use std::future::Future;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backup::runner::{AttemptFailure, remove_partial_file};
use crate::backup::types::BackupWriteResult;
use crate::errors::{BackupError, Result};

pub const MAX_DUMP_ATTEMPTS: usize = 3;

/// One recoverable failure mode: a stderr predicate plus an argument rewrite.
/// `rewrite` returns `None` when it cannot change the arguments.
pub struct RetryStrategy {
    pub name: &'static str,
    pub matches: fn(&str) -> bool,
    pub rewrite: fn(&[String], &str) -> Option<Vec<String>>,
}

/// Strategies in the order they are tried.
pub const DEFAULT_STRATEGIES: &[RetryStrategy] = &[
    RetryStrategy { name: "ssl-mismatch", matches: is_ssl_mismatch, rewrite: add_disable_ssl_arg },
    RetryStrategy {
        name: "unsupported-option",
        matches: is_unsupported_option,
        rewrite: remove_unsupported_option,
    },
];

/// Client requires SSL but the server does not support it.
pub fn is_ssl_mismatch(stderr: &str) -> bool {
    let l = stderr.to_lowercase();
    l.contains("tls/ssl error") && l.contains("ssl is required") && l.contains("server does not support")
}

/// Appends `--skip-ssl` unless an SSL option is already present.
pub fn add_disable_ssl_arg(args: &[String], _stderr: &str) -> Option<Vec<String>> {
    let has_ssl_arg = args.iter().any(|a| {
        let a = a.trim().to_lowercase();
        a == "--skip-ssl" || a.starts_with("--ssl-mode") || a.starts_with("--ssl=")
    });
    if has_ssl_arg {
        return None;
    }
    let mut out = args.to_vec();
    out.push("--skip-ssl".to_string());
    Some(out)
}

fn mentions_unknown_option(line: &str) -> bool {
    let l = line.to_lowercase();
    l.contains("unknown option") || l.contains("unknown variable")
}

pub fn is_unsupported_option(stderr: &str) -> bool {
    mentions_unknown_option(stderr)
}

fn quoted_token(line: &str) -> Option<&str> {
    ['\'', '"'].into_iter().find_map(|q| {
        let start = line.find(q)? + 1;
        let len = line[start..].find(q)?;
        Some(&line[start..start + len])
    })
}

fn dashed_token(line: &str) -> Option<&str> {
    let start = line.find("--").or_else(|| line.find('-'))?;
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Removes the one flag named by an "unknown option"/"unknown variable" diagnostic.
///
/// A following separate value is removed with it unless that value belongs to the trailing
/// positional block (database names always come last and are never removed).
pub fn remove_unsupported_option(args: &[String], stderr: &str) -> Option<Vec<String>> {
    for line in stderr.lines().filter(|l| mentions_unknown_option(l)) {
        let Some(token) = quoted_token(line).or_else(|| dashed_token(line)).map(str::trim) else {
            continue;
        };
        if token.is_empty() {
            continue;
        }

        let candidate = if token.starts_with('-') {
            token.to_string()
        } else if token.contains('-') || token.contains('=') {
            format!("--{}", token)
        } else {
            continue;
        };

        let Some(i) = args.iter().position(|arg| {
            arg.starts_with('-') && (*arg == candidate || arg == token || arg.contains(token))
        }) else {
            continue;
        };

        let flag = &args[i];
        let value_follows = !flag.contains('=')
            && args.get(i + 1).is_some_and(|next| !next.starts_with('-'))
            && args[i + 2..].iter().any(|later| later.starts_with('-'));

        let mut out = args[..i].to_vec();
        out.extend_from_slice(&args[i + if value_follows { 2 } else { 1 }..]);
        return Some(out);
    }
    None
}

/// Picks the first strategy that matches `stderr` and actually changes `args`.
pub fn next_args(strategies: &[RetryStrategy], args: &[String], stderr: &str) -> Option<(&'static str, Vec<String>)> {
    strategies.iter().find_map(|s| {
        if !(s.matches)(stderr) {
            return None;
        }
        (s.rewrite)(args, stderr)
            .filter(|new_args| new_args.as_slice() != args)
            .map(|new_args| (s.name, new_args))
    })
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub result: BackupWriteResult,
    /// Arguments of the attempt that succeeded.
    pub args: Vec<String>,
    pub attempts: usize,
}

/// Runs `attempt` until it succeeds, no strategy applies, or `max_attempts` is reached.
///
/// Cancellation is checked before every retry, and the partial artifact is deleted first.
pub async fn run_with_retry<F, Fut>(
    initial_args: Vec<String>,
    output_path: &Path,
    cancel: &CancellationToken,
    strategies: &[RetryStrategy],
    max_attempts: usize,
    mut attempt: F,
) -> Result<RetryOutcome>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = std::result::Result<BackupWriteResult, AttemptFailure>>,
{
    let mut args = initial_args;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let failure = match attempt(args.clone()).await {
            Ok(result) => return Ok(RetryOutcome { result, args, attempts }),
            Err(failure) => failure,
        };

        if failure.error.is_cancelled() {
            return Err(failure.error);
        }
        let Some(stderr) = failure.stderr.as_deref() else {
            return Err(failure.error);
        };
        let Some((strategy, new_args)) = next_args(strategies, &args, stderr) else {
            return Err(failure.error);
        };
        if attempts >= max_attempts {
            return Err(BackupError::RetryExhausted { attempts, last: Box::new(failure.error) });
        }
        if cancel.is_cancelled() {
            return Err(BackupError::Cancelled("cancelled before retry".to_string()));
        }

        warn!(
            "Dump failed ({}), retrying with adjusted arguments (attempt {}/{})",
            strategy,
            attempts + 1,
            max_attempts
        );
        remove_partial_file(output_path);
        args = new_args;
    }
}
