// dumpvault/src/backup/pipeline.rs
//! Writer chain: buffered file sink <- encryption <- compression.
//!
//! Each layer owns the layer beneath it. Closing finalizes the outermost layer first, which
//! yields the next one down, so trailing bytes (gzip footer, final cipher chunk) always pass
//! through every lower layer before that layer is finalized.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::backup::compress::{CompressingWriter, decompressing_reader};
use crate::backup::crypto::{DecryptReader, EncryptWriter};
use crate::backup::types::{CompressionSettings, CompressionType, EncryptionOptions};
use crate::errors::{BackupError, Result};

pub const WRITER_BUFFER_SIZE: usize = 256 * 1024;

/// One decorator in the output chain.
pub trait StreamLayer: Write + Send {
    fn name(&self) -> &'static str;

    /// Writes this layer's trailing bytes and returns the layer beneath it (`None` for the sink).
    fn finalize(self: Box<Self>) -> io::Result<Option<Box<dyn StreamLayer>>>;
}

struct FileSink {
    writer: BufWriter<File>,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl StreamLayer for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn finalize(mut self: Box<Self>) -> io::Result<Option<Box<dyn StreamLayer>>> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(None)
    }
}

impl StreamLayer for EncryptWriter<Box<dyn StreamLayer>> {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn finalize(self: Box<Self>) -> io::Result<Option<Box<dyn StreamLayer>>> {
        (*self).finish().map(Some)
    }
}

impl StreamLayer for CompressingWriter<Box<dyn StreamLayer>> {
    fn name(&self) -> &'static str {
        self.codec_name()
    }

    fn finalize(self: Box<Self>) -> io::Result<Option<Box<dyn StreamLayer>>> {
        (*self).finish().map(Some)
    }
}

/// Creates (truncating) the artifact with the given unix permission bits.
pub fn create_output_file(path: &Path, permissions: u32) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(permissions);
    }
    #[cfg(not(unix))]
    let _ = permissions;
    opts.open(path)
}

/// The composed output chain for one artifact.
pub struct Pipeline {
    outer: Option<Box<dyn StreamLayer>>,
    layers: Vec<&'static str>,
}

impl Pipeline {
    /// Builds file sink -> encryption (if enabled) -> compression (if enabled).
    pub fn create(
        output_path: &Path,
        compression: &CompressionSettings,
        encryption: &EncryptionOptions,
        permissions: u32,
    ) -> Result<Pipeline> {
        let file = create_output_file(output_path, permissions)?;
        let sink = FileSink { writer: BufWriter::with_capacity(WRITER_BUFFER_SIZE, file) };

        let mut layers = vec![sink.name()];
        let mut writer: Box<dyn StreamLayer> = Box::new(sink);

        if encryption.enabled {
            let encryptor = EncryptWriter::new(writer, encryption.key.as_bytes())
                .map_err(|e| BackupError::Encryption(format!("failed to create encrypting writer: {}", e)))?;
            layers.push(StreamLayer::name(&encryptor));
            writer = Box::new(encryptor);
        }

        writer = match CompressingWriter::new(writer, compression) {
            Ok(compressor) => {
                layers.push(StreamLayer::name(&compressor));
                Box::new(compressor)
            }
            Err(unchanged) => unchanged,
        };

        Ok(Pipeline { outer: Some(writer), layers })
    }

    /// Layer names in construction order, innermost first.
    pub fn layers(&self) -> &[&'static str] {
        &self.layers
    }

    /// Finalizes every layer from the outside in and returns the order they were finalized in.
    pub fn close(mut self) -> io::Result<Vec<&'static str>> {
        let mut finalized = Vec::with_capacity(self.layers.len());
        let mut current = self.outer.take();
        while let Some(layer) = current {
            finalized.push(layer.name());
            current = layer.finalize()?;
        }
        Ok(finalized)
    }
}

impl Write for Pipeline {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.outer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::other("pipeline already closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.outer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

/// Opens an artifact through the inverse chain: decrypt (if `encrypted`) then decompress.
pub fn open_artifact_reader(
    path: &Path,
    compression: CompressionType,
    encrypted: bool,
    key: Option<&str>,
) -> Result<Box<dyn Read>> {
    let file = BufReader::with_capacity(WRITER_BUFFER_SIZE, File::open(path)?);
    let plain: Box<dyn Read> = if encrypted {
        let key = key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BackupError::Encryption("artifact is encrypted but no key was provided".to_string()))?;
        Box::new(DecryptReader::new(file, key.as_bytes())?)
    } else {
        Box::new(file)
    };
    Ok(decompressing_reader(plain, compression))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::crypto::CHUNK_SIZE;
    use tempfile::TempDir;

    const KEY: &str = "pipeline-test-key";

    fn combos() -> Vec<(CompressionSettings, EncryptionOptions)> {
        vec![
            (CompressionSettings::disabled(), EncryptionOptions::disabled()),
            (CompressionSettings::gzip(6), EncryptionOptions::disabled()),
            (CompressionSettings::disabled(), EncryptionOptions::with_key(KEY)),
            (CompressionSettings::gzip(6), EncryptionOptions::with_key(KEY)),
        ]
    }

    fn read_back(path: &Path, c: &CompressionSettings, e: &EncryptionOptions) -> anyhow::Result<Vec<u8>> {
        let mut reader = open_artifact_reader(path, c.effective_type(), e.enabled, Some(KEY))?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_round_trip_every_layer_combination() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let sizes = [0usize, 10, CHUNK_SIZE - 3, CHUNK_SIZE, 2 * CHUNK_SIZE + 5];
        for (i, (compression, encryption)) in combos().iter().enumerate() {
            for size in sizes {
                // pseudo-random bytes so compression cannot hide truncation
                let data: Vec<u8> = (0..size as u64)
                    .map(|x| (x.wrapping_mul(2_654_435_761) >> 13) as u8)
                    .collect();
                let path = dir.path().join(format!("combo{}_{}.sql", i, size));
                let mut pipeline = Pipeline::create(&path, compression, encryption, 0o600)?;
                for piece in data.chunks(7_919) {
                    pipeline.write_all(piece)?;
                }
                pipeline.close()?;
                assert_eq!(read_back(&path, compression, encryption)?, data, "combo {} size {}", i, size);
            }
        }
        Ok(())
    }

    #[test]
    fn test_close_finalizes_in_reverse_construction_order() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("order.sql.gz.enc");
        let pipeline = Pipeline::create(
            &path,
            &CompressionSettings::gzip(6),
            &EncryptionOptions::with_key(KEY),
            0o600,
        )?;
        assert_eq!(pipeline.layers(), &["file", "encryption", "gzip"]);
        let finalized = pipeline.close()?;
        assert_eq!(finalized, vec!["gzip", "encryption", "file"]);
        Ok(())
    }

    #[test]
    fn test_plain_pipeline_is_a_single_sink() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("nested/dir/plain.sql");
        let mut pipeline = Pipeline::create(&path, &CompressionSettings::disabled(), &EncryptionOptions::disabled(), 0o640)?;
        assert_eq!(pipeline.layers(), &["file"]);
        pipeline.write_all(b"-- Dump completed\n")?;
        pipeline.close()?;
        assert_eq!(fs::read(&path)?, b"-- Dump completed\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o640);
        }
        Ok(())
    }

    #[test]
    fn test_encrypted_reader_requires_key() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("x.sql.enc");
        let mut pipeline = Pipeline::create(&path, &CompressionSettings::disabled(), &EncryptionOptions::with_key(KEY), 0o600)?;
        pipeline.write_all(b"data")?;
        pipeline.close()?;
        assert!(open_artifact_reader(&path, CompressionType::None, true, None).is_err());
        Ok(())
    }
}
