use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;
use crate::config::ReencodeConfig;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to execute {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder failed (exit code {code}) for {path}: {stderr}")]
    Failed {
        path: PathBuf,
        code: i32,
        stderr: String,
    },
    #[error("encoder was interrupted while processing {path}")]
    Interrupted { path: PathBuf },
}

impl EncodeError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, EncodeError::Interrupted { .. })
    }
}

/// Rewrites a file's bytes in place with the target encoder
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&self, path: &Path) -> Result<(), EncodeError>;
}

/// Encoder backed by the `flac` command line tool
#[derive(Debug, Clone)]
pub struct FlacEncoder {
    bin: PathBuf,
    args: Vec<String>,
}

impl FlacEncoder {
    pub fn new(bin: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            bin: bin.into(),
            args,
        }
    }

    pub fn from_config(cfg: &ReencodeConfig) -> Self {
        Self::new(&cfg.encoder_bin, cfg.encode_args.clone())
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Query the installed encoder for its version, used as the target encoder identity
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.bin)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("Failed to execute {} --version", self.bin.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} --version failed (exit code {}): {}",
                self.bin.display(),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_version(&stdout)
            .with_context(|| format!("Unexpected version output from {}: {:?}", self.bin.display(), stdout.trim()))
    }
}

/// Extract `1.4.3` from `flac 1.4.3`
pub fn parse_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .nth(1)
        .map(|v| v.to_string())
}

#[async_trait]
impl Encoder for FlacEncoder {
    async fn encode(&self, path: &Path) -> Result<(), EncodeError> {
        let mut std_cmd = std::process::Command::new(&self.bin);
        std_cmd.args(&self.args).arg(path);

        // Own process group: a terminal Ctrl-C must not kill an encode mid-write
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);

        debug!("encode command: {} {} {}", self.bin.display(), self.args.join(" "), path.display());

        let output = cmd.output().await.map_err(|source| EncodeError::Spawn {
            bin: self.bin.clone(),
            source,
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if killed_by_signal(&output.status) || stderr.contains("interrupt") {
            return Err(EncodeError::Interrupted {
                path: path.to_path_buf(),
            });
        }

        Err(EncodeError::Failed {
            path: path.to_path_buf(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }
}

#[cfg(unix)]
fn killed_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &std::process::ExitStatus) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_output_is_parsed() {
        assert_eq!(parse_version("flac 1.4.3\n"), Some("1.4.3".to_string()));
        assert_eq!(parse_version("flac"), None);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let encoder = FlacEncoder::new("/nonexistent/flac", vec!["-8f".to_string()]);
        let err = encoder.encode(Path::new("a.flac")).await.unwrap_err();
        assert!(matches!(err, EncodeError::Spawn { .. }));
        assert!(!err.is_interrupted());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_failure() {
        let encoder = FlacEncoder::new("false", Vec::new());
        let err = encoder.encode(Path::new("a.flac")).await.unwrap_err();
        assert!(matches!(err, EncodeError::Failed { code: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_is_success() {
        let encoder = FlacEncoder::new("true", Vec::new());
        encoder.encode(Path::new("a.flac")).await.unwrap();
    }
}
