// dumpvault/src/backup/crypto.rs
//! Chunked AES-256-GCM stream framing used for encrypted artifacts.
//!
//! Layout: `Salted__` | salt (8) | base nonce (12) | `[u32 BE prefix][ciphertext]`...
//! Each chunk holds up to 64 KiB of plaintext. The chunk nonce is the base nonce with its
//! last 8 bytes replaced by the big-endian chunk counter. The top bit of the prefix marks the
//! last chunk and the same flag is the chunk's associated data, so a stream cut at a chunk
//! boundary never authenticates as complete. Nothing may follow the last chunk.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use std::io::{self, Read, Write};

use crate::errors::{BackupError, Result};

pub const SALTED_HEADER: &[u8; 8] = b"Salted__";
pub const SALT_LEN: usize = 8;
pub const NONCE_LEN: usize = 12;
pub const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const FINAL_FLAG: u32 = 1 << 31;

// scrypt cost parameters: N = 2^15, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

fn derive_cipher(passphrase: &[u8], salt: &[u8]) -> Result<Aes256Gcm> {
    if passphrase.is_empty() {
        return Err(BackupError::Encryption("encryption key is empty".to_string()));
    }
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
        .map_err(|e| BackupError::Encryption(format!("invalid scrypt parameters: {}", e)))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(passphrase, salt, &params, &mut key)
        .map_err(|e| BackupError::Encryption(format!("key derivation failed: {}", e)))?;
    Aes256Gcm::new_from_slice(&key)
        .map_err(|_| BackupError::Encryption("invalid derived key length".to_string()))
}

fn chunk_nonce(base: &[u8; NONCE_LEN], counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = *base;
    nonce[NONCE_LEN - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn truncated() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "encrypted stream truncated: final chunk missing",
    )
}

/// Streaming encryptor. Plaintext is buffered until a full chunk is available;
/// `finish` seals whatever is buffered (possibly nothing) as the final chunk.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    buffer: Vec<u8>,
    counter: u64,
    finished: bool,
}

impl<W: Write> EncryptWriter<W> {
    /// Writes the stream header to `inner` immediately.
    pub fn new(mut inner: W, passphrase: &[u8]) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let cipher = derive_cipher(passphrase, &salt)?;

        let mut base_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut base_nonce);

        inner.write_all(SALTED_HEADER)?;
        inner.write_all(&salt)?;
        inner.write_all(&base_nonce)?;

        Ok(EncryptWriter {
            inner,
            cipher,
            base_nonce,
            buffer: Vec::with_capacity(CHUNK_SIZE),
            counter: 0,
            finished: false,
        })
    }

    fn flush_chunk(&mut self, last: bool) -> io::Result<()> {
        let nonce = chunk_nonce(&self.base_nonce, self.counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: self.buffer.as_slice(), aad: &[u8::from(last)] })
            .map_err(|_| io::Error::other("chunk encryption failed"))?;
        let len = u32::try_from(ciphertext.len()).map_err(|_| io::Error::other("chunk too large"))?;
        let prefix = if last { len | FINAL_FLAG } else { len };

        self.inner.write_all(&prefix.to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;

        self.buffer.clear();
        self.counter += 1;
        Ok(())
    }

    /// Seals the final chunk. Safe to call more than once; only the first call writes anything.
    pub fn try_finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush_chunk(true)?;
        self.finished = true;
        Ok(())
    }

    /// Finalizes the stream and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.try_finish()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::other("encrypting writer already finished"));
        }
        let mut rest = buf;
        while !rest.is_empty() {
            let take = (CHUNK_SIZE - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() >= CHUNK_SIZE {
                self.flush_chunk(false)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming decryptor for the framing written by `EncryptWriter`.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: Aes256Gcm,
    base_nonce: [u8; NONCE_LEN],
    counter: u64,
    plain: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, passphrase: &[u8]) -> Result<Self> {
        let mut header = [0u8; 8];
        inner.read_exact(&mut header)?;
        if &header != SALTED_HEADER {
            return Err(BackupError::Encryption("not an encrypted backup stream (bad header)".to_string()));
        }
        let mut salt = [0u8; SALT_LEN];
        inner.read_exact(&mut salt)?;
        let mut base_nonce = [0u8; NONCE_LEN];
        inner.read_exact(&mut base_nonce)?;

        let cipher = derive_cipher(passphrase, &salt)?;
        Ok(DecryptReader {
            inner,
            cipher,
            base_nonce,
            counter: 0,
            plain: Vec::new(),
            pos: 0,
            done: false,
        })
    }

    fn read_exact_or_truncated(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof { truncated() } else { e }
        })
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let mut prefix_buf = [0u8; 4];
        self.read_exact_or_truncated(&mut prefix_buf)?;
        let prefix = u32::from_be_bytes(prefix_buf);
        let last = prefix & FINAL_FLAG != 0;
        let len = (prefix & !FINAL_FLAG) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid encrypted chunk length {}", len),
            ));
        }

        let mut ciphertext = vec![0u8; len];
        self.read_exact_or_truncated(&mut ciphertext)?;
        let nonce = chunk_nonce(&self.base_nonce, self.counter);
        self.plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext.as_slice(), aad: &[u8::from(last)] })
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "chunk authentication failed (wrong key or corrupted data)",
                )
            })?;
        self.pos = 0;
        self.counter += 1;

        if last {
            let mut trailing = [0u8; 1];
            if self.inner.read(&mut trailing)? != 0 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "data after the final encrypted chunk"));
            }
            self.done = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.plain.len() {
                let n = (self.plain.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.next_chunk()?;
        }
    }
}
