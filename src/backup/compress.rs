// dumpvault/src/backup/compress.rs
use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{Read, Write};

use crate::backup::types::{CompressionSettings, CompressionType};

const DEFAULT_LEVEL: u32 = 6;

/// Levels outside 1..=9 fall back to the codec default.
fn compression_level(level: u32) -> Compression {
    if (1..=9).contains(&level) {
        Compression::new(level)
    } else {
        Compression::new(DEFAULT_LEVEL)
    }
}

/// A compressing writer around `inner`. Callers must finish it to emit the codec trailer.
pub enum CompressingWriter<W: Write> {
    Gzip(GzEncoder<W>),
    Zlib(ZlibEncoder<W>),
}

impl<W: Write> CompressingWriter<W> {
    /// Hands `inner` back unchanged when compression is disabled or the type is `none`.
    pub fn new(inner: W, settings: &CompressionSettings) -> Result<Self, W> {
        let level = compression_level(settings.level);
        match settings.effective_type() {
            CompressionType::Gzip => Ok(CompressingWriter::Gzip(GzEncoder::new(inner, level))),
            CompressionType::Zlib => Ok(CompressingWriter::Zlib(ZlibEncoder::new(inner, level))),
            CompressionType::None => Err(inner),
        }
    }

    pub fn codec_name(&self) -> &'static str {
        match self {
            CompressingWriter::Gzip(_) => "gzip",
            CompressingWriter::Zlib(_) => "zlib",
        }
    }

    /// Writes the codec trailer and hands back the inner writer.
    pub fn finish(self) -> std::io::Result<W> {
        match self {
            CompressingWriter::Gzip(enc) => enc.finish(),
            CompressingWriter::Zlib(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for CompressingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CompressingWriter::Gzip(enc) => enc.write(buf),
            CompressingWriter::Zlib(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CompressingWriter::Gzip(enc) => enc.flush(),
            CompressingWriter::Zlib(enc) => enc.flush(),
        }
    }
}

/// Wraps `inner` in the matching decompressor.
pub fn decompressing_reader<'a, R: Read + 'a>(inner: R, compression: CompressionType) -> Box<dyn Read + 'a> {
    match compression {
        CompressionType::Gzip => Box::new(GzDecoder::new(inner)),
        CompressionType::Zlib => Box::new(ZlibDecoder::new(inner)),
        CompressionType::None => Box::new(inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() -> anyhow::Result<()> {
        let payload = b"-- MySQL dump\nINSERT INTO t VALUES (1);\n".repeat(200);
        let mut writer = match CompressingWriter::new(Vec::new(), &CompressionSettings::gzip(9)) {
            Ok(w) => w,
            Err(_) => anyhow::bail!("gzip should produce a compressing writer"),
        };
        assert_eq!(writer.codec_name(), "gzip");
        writer.write_all(&payload)?;
        let compressed = writer.finish()?;
        assert!(compressed.len() < payload.len());

        let mut out = Vec::new();
        decompressing_reader(&compressed[..], CompressionType::Gzip).read_to_end(&mut out)?;
        assert_eq!(out, payload);
        Ok(())
    }

    #[test]
    fn test_disabled_compression_returns_inner() {
        let settings = CompressionSettings { enabled: false, compression_type: CompressionType::Gzip, level: 6 };
        assert!(CompressingWriter::new(Vec::<u8>::new(), &settings).is_err());
    }

    #[test]
    fn test_out_of_range_level_uses_default() {
        assert_eq!(compression_level(0).level(), DEFAULT_LEVEL);
        assert_eq!(compression_level(42).level(), DEFAULT_LEVEL);
        assert_eq!(compression_level(3).level(), 3);
    }
}
