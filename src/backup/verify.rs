// dumpvault/src/backup/verify.rs
//! Reads an artifact back through its layers and checks the dump trailer.

use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup::paths::detect_layers;
use crate::backup::pipeline::open_artifact_reader;
use crate::backup::types::CompressionType;
use crate::errors::Result;
use crate::utils::format::format_file_size;

pub const DUMP_COMPLETED_MARKER: &str = "-- Dump completed";
const TAIL_WINDOW: usize = 4096;
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub path: PathBuf,
    pub compression: CompressionType,
    pub encrypted: bool,
    /// Plain SQL bytes after decryption and decompression.
    pub bytes: u64,
    /// The dump ends with the tool's completion trailer.
    pub completed: bool,
}

/// Decrypts and decompresses the whole artifact. Layers are taken from the file name.
/// A corrupt or truncated stream is an error; a missing trailer only clears `completed`.
pub fn verify_artifact(path: &Path, key: Option<&str>) -> Result<VerifyReport> {
    let (compression, encrypted) = detect_layers(path);
    let mut reader = open_artifact_reader(path, compression, encrypted, key)?;

    let mut buf = vec![0u8; READ_CHUNK];
    let mut tail: Vec<u8> = Vec::with_capacity(TAIL_WINDOW * 2);
    let mut bytes = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        bytes += n as u64;
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > TAIL_WINDOW {
            tail.drain(..tail.len() - TAIL_WINDOW);
        }
    }

    let completed = String::from_utf8_lossy(&tail).contains(DUMP_COMPLETED_MARKER);
    if completed {
        info!("✓ {} verified ({} of SQL)", path.display(), format_file_size(bytes));
    } else {
        warn!("{} decodes cleanly but has no completion trailer", path.display());
    }

    Ok(VerifyReport { path: path.to_path_buf(), compression, encrypted, bytes, completed })
}
