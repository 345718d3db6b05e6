// dumpvault/src/backup/monitor.rs
//! Passthrough writer that watches the dump stream for `-- Current Database:` markers.

use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::info;

use crate::utils::format::format_duration;

const MARKER: &[u8] = b"-- Current Database: ";
/// Bytes kept from the previous write so a marker split across writes is still seen.
const CARRY_LEN: usize = 512;
const MAX_IDENTIFIER_LEN: usize = 256;

enum Identifier {
    Complete(String, usize),
    Incomplete,
    Invalid,
}

/// Reads a backtick-quoted identifier; a doubled backtick is an escaped backtick.
fn parse_backtick_identifier(bytes: &[u8]) -> Identifier {
    if bytes.is_empty() {
        return Identifier::Incomplete;
    }
    if bytes[0] != b'`' {
        return Identifier::Invalid;
    }

    let mut name = Vec::new();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'`' => match bytes.get(i + 1) {
                Some(b'`') => {
                    name.push(b'`');
                    i += 2;
                }
                Some(_) => return Identifier::Complete(String::from_utf8_lossy(&name).into_owned(), i + 1),
                None => return Identifier::Incomplete,
            },
            b'\n' | b'\r' => return Identifier::Invalid,
            b => {
                name.push(b);
                i += 1;
            }
        }
        if name.len() > MAX_IDENTIFIER_LEN {
            return Identifier::Invalid;
        }
    }
    Identifier::Incomplete
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Forwards every byte to `inner` unchanged and logs database boundaries as a side channel.
pub struct ProgressMonitor<W: Write> {
    inner: W,
    carry: Vec<u8>,
    current: Option<(String, Instant)>,
    seen: Vec<String>,
}

impl<W: Write> ProgressMonitor<W> {
    pub fn new(inner: W) -> Self {
        ProgressMonitor { inner, carry: Vec::new(), current: None, seen: Vec::new() }
    }

    /// Databases announced by the stream, in order.
    pub fn databases_seen(&self) -> &[String] {
        &self.seen
    }

    pub fn current_database(&self) -> Option<&str> {
        self.current.as_ref().map(|(name, _)| name.as_str())
    }

    fn observe(&mut self, name: String) {
        if self.current_database() == Some(name.as_str()) {
            return;
        }
        if let Some((prev, started)) = self.current.take() {
            info!("✓ Database {} ({})", prev, format_duration(started.elapsed()));
        }
        info!("Processing database: {}", name);
        self.seen.push(name.clone());
        self.current = Some((name, Instant::now()));
    }

    fn scan(&mut self, chunk: &[u8]) {
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(chunk);

        let mut offset = 0;
        while let Some(pos) = find(&window[offset..], MARKER) {
            let start = offset + pos + MARKER.len();
            match parse_backtick_identifier(&window[start..]) {
                Identifier::Complete(name, used) => {
                    self.observe(name);
                    offset = start + used;
                }
                Identifier::Invalid => offset = start,
                Identifier::Incomplete => break,
            }
        }

        let keep_from = offset.max(window.len().saturating_sub(CARRY_LEN));
        self.carry = window.split_off(keep_from);
    }

    /// Logs completion of the last database when the dump succeeded. Returns the elapsed time of that database.
    pub fn finish(&mut self, success: bool) -> Option<Duration> {
        let (name, started) = self.current.take()?;
        let elapsed = started.elapsed();
        if success {
            info!("✓ Database {} ({})", name, format_duration(elapsed));
        }
        Some(elapsed)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ProgressMonitor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.scan(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
