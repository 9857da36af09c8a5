use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Arguments handed to the encoder when none are configured
pub const DEFAULT_ENCODE_ARGS: &[&str] = &["-8f"];

/// Configuration for a reencoder run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReencodeConfig {
    /// Directory holding the ledger; `None` lets the caller pick a platform default
    pub ledger_dir: Option<PathBuf>,
    /// File extension to track (without the dot)
    pub extension: String,
    /// Encoder executable, also queried for the target encoder identity
    pub encoder_bin: PathBuf,
    /// Metadata probe executable
    pub probe_bin: PathBuf,
    /// Arguments passed to the encoder before the file path
    pub encode_args: Vec<String>,
    /// Maximum number of files fingerprinted and probed at once
    pub scan_workers: usize,
    /// Maximum number of encoder processes running at once
    pub encode_workers: usize,
    /// Log a progress line every N classified files during a scan
    pub progress_every: u64,
}

impl Default for ReencodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ReencodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ledger_dir: None,
            extension: "flac".to_string(),
            encoder_bin: PathBuf::from("flac"),
            probe_bin: PathBuf::from("metaflac"),
            encode_args: DEFAULT_ENCODE_ARGS.iter().map(|s| s.to_string()).collect(),
            scan_workers: 100,
            encode_workers: 4,
            progress_every: 500,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config.normalized())
    }

    /// Clamp worker limits and restore defaults for empty values
    pub fn normalized(mut self) -> Self {
        self.scan_workers = self.scan_workers.max(1);
        self.encode_workers = self.encode_workers.max(1);
        self.progress_every = self.progress_every.max(1);
        if self.encode_args.is_empty() {
            self.encode_args = DEFAULT_ENCODE_ARGS.iter().map(|s| s.to_string()).collect();
        }
        let ext = self.extension.trim_start_matches('.').to_lowercase();
        self.extension = if ext.is_empty() { "flac".to_string() } else { ext };
        self
    }

    /// Whether `path` carries the tracked extension
    pub fn is_tracked(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }
}
