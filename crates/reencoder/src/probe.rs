use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use async_trait::async_trait;
use log::debug;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use crate::config::ReencodeConfig;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to execute {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata probe failed (exit code {code}) for {path}: {stderr}")]
    Failed {
        path: PathBuf,
        code: i32,
        stderr: String,
    },
}

/// Reads the identity of the encoder that last wrote a file
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    /// Encoder identity embedded in `path`, or an empty string if there is none
    async fn encoder_identity(&self, path: &Path) -> Result<String, ProbeError>;
}

/// Probe backed by `metaflac --show-vendor-tag`
#[derive(Debug, Clone)]
pub struct Metaflac {
    bin: PathBuf,
}

impl Metaflac {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    pub fn from_config(cfg: &ReencodeConfig) -> Self {
        Self::new(&cfg.probe_bin)
    }
}

fn vendor_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"libFLAC (\d+\.\d+(?:\.\d+)?)").expect("static regex"))
}

/// Extract the libFLAC version from a vendor string such as
/// `reference libFLAC 1.4.3 20230623`
pub fn parse_vendor(vendor: &str) -> String {
    vendor_pattern()
        .captures(vendor)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl MetadataProbe for Metaflac {
    async fn encoder_identity(&self, path: &Path) -> Result<String, ProbeError> {
        let output = Command::new(&self.bin)
            .arg("--show-vendor-tag")
            .arg(path)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let vendor = String::from_utf8_lossy(&output.stdout);
        let identity = parse_vendor(&vendor);
        debug!("metaflac: {} vendor {:?} -> {:?}", path.display(), vendor.trim(), identity);
        Ok(identity)
    }
}
