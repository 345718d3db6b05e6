pub mod format;

use std::path::PathBuf;
use which::which;

/// Finds the first of `candidates` present in the system PATH.
///
/// Returns the binary name that matched together with its resolved path.
pub fn find_first_executable(candidates: &[&str]) -> Option<(String, PathBuf)> {
    candidates
        .iter()
        .find_map(|name| which(name).ok().map(|path| (name.to_string(), path)))
}

/// Returns a bounded excerpt of subprocess diagnostic text: at most `max_lines`
/// lines and `max_chars` characters, with `...` appended when truncated.
pub fn summarize_stderr(stderr: &str, max_lines: usize, max_chars: usize) -> String {
    if stderr.is_empty() {
        return String::new();
    }

    let lines: Vec<&str> = stderr.split('\n').collect();
    let kept = if max_lines > 0 && lines.len() > max_lines {
        &lines[..max_lines]
    } else {
        &lines[..]
    };

    let joined = kept.join("\n");
    let trimmed = joined.trim();
    if max_chars > 0 && trimmed.chars().count() > max_chars {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        trimmed.to_string()
    }
}

/// Parses an octal permission string such as `"0600"`. Empty or invalid input falls back to `0o600`.
pub fn parse_file_permissions(perm: &str) -> u32 {
    const DEFAULT_PERM: u32 = 0o600;

    let perm = perm.trim();
    if perm.is_empty() {
        return DEFAULT_PERM;
    }
    match u32::from_str_radix(perm, 8) {
        Ok(p) if p <= 0o7777 => p,
        _ => {
            tracing::warn!("Invalid file permissions '{}', using default 0600", perm);
            DEFAULT_PERM
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_stderr_caps_lines_and_chars() {
        let stderr = "line1\nline2\nline3\nline4";
        assert_eq!(summarize_stderr(stderr, 2, 0), "line1\nline2");
        assert_eq!(summarize_stderr(stderr, 0, 7), "line1\nl...");
        assert_eq!(summarize_stderr("", 5, 5), "");
        assert_eq!(summarize_stderr("  short \n", 5, 500), "short");
    }

    #[test]
    fn test_summarize_stderr_respects_char_boundaries() {
        let stderr = "ééééé";
        assert_eq!(summarize_stderr(stderr, 1, 3), "ééé...");
    }

    #[test]
    fn test_parse_file_permissions() {
        assert_eq!(parse_file_permissions("0644"), 0o644);
        assert_eq!(parse_file_permissions(""), 0o600);
        assert_eq!(parse_file_permissions("rw-r--r--"), 0o600);
        assert_eq!(parse_file_permissions("99"), 0o600);
    }
}
