use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Size of a fingerprint in bytes
pub const FINGERPRINT_LEN: usize = 32;

const READ_CHUNK: usize = 64 * 1024;

/// SHA-256 digest over the full byte contents of a file
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Fingerprint(bytes)
    }

    /// Rebuild a fingerprint from a stored key, `None` if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; FINGERPRINT_LEN]>::try_from(bytes).ok().map(Fingerprint)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Digest an arbitrary reader, streaming it in fixed-size chunks
    pub fn from_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..read]);
        }
        Ok(Fingerprint(hasher.finalize().into()))
    }

    /// Digest the file at `path`
    pub fn of_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
        Self::from_reader(file)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))
    }

    /// Digest the file at `path` on the blocking pool
    pub async fn of_file_async(path: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::of_file(&path))
            .await
            .context("Hashing task panicked")?
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell records apart in logs
        write!(f, "Fingerprint({})", &hex::encode(self.0)[..12])
    }
}
