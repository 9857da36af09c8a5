use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use crate::encode::{EncodeError, Encoder};
use crate::probe::{MetadataProbe, ProbeError};

const MARKER: &str = "\nencoded-by:";

pub fn write_file(root: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    path
}

fn file_name_matches(path: &Path, names: &Mutex<Vec<String>>) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    names.lock().unwrap().iter().any(|n| n == name)
}

/// Reports the identity left behind by [`FakeEncoder`], or a fixed fallback
#[derive(Default)]
pub struct FakeProbe {
    fallback: Mutex<String>,
    failing: Mutex<Vec<String>>,
    cancel_on_call: Mutex<Option<CancellationToken>>,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn set_identity(&self, identity: &str) {
        *self.fallback.lock().unwrap() = identity.to_string();
    }

    pub fn fail_on(&self, file_name: &str) {
        self.failing.lock().unwrap().push(file_name.to_string());
    }

    /// Raise `token` on the first probe, before it answers
    pub fn cancel_on_call(&self, token: CancellationToken) {
        *self.cancel_on_call.lock().unwrap() = Some(token);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataProbe for FakeProbe {
    async fn encoder_identity(&self, path: &Path) -> Result<String, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let token = self.cancel_on_call.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if file_name_matches(path, &self.failing) {
            return Err(ProbeError::Failed {
                path: path.to_path_buf(),
                code: 1,
                stderr: "not a FLAC file".to_string(),
            });
        }
        let contents = std::fs::read(path).unwrap();
        let text = String::from_utf8_lossy(&contents);
        match text.rfind(MARKER) {
            Some(at) => Ok(text[at + MARKER.len()..].trim().to_string()),
            None => Ok(self.fallback.lock().unwrap().clone()),
        }
    }
}

/// Appends an encoder marker to the file so its bytes (and fingerprint) change
pub struct FakeEncoder {
    version: String,
    failing: Mutex<Vec<String>>,
    interrupted: Mutex<Vec<String>>,
    vanishing: Mutex<Vec<String>>,
    cancel_on_start: Mutex<Option<CancellationToken>>,
    encoded: Mutex<Vec<PathBuf>>,
}

impl FakeEncoder {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            failing: Mutex::default(),
            interrupted: Mutex::default(),
            vanishing: Mutex::default(),
            cancel_on_start: Mutex::default(),
            encoded: Mutex::default(),
        }
    }

    pub fn fail_on(&self, file_name: &str) {
        self.failing.lock().unwrap().push(file_name.to_string());
    }

    pub fn interrupt_on(&self, file_name: &str) {
        self.interrupted.lock().unwrap().push(file_name.to_string());
    }

    /// Report success but delete the file, so it cannot be fingerprinted afterwards
    pub fn vanish_on(&self, file_name: &str) {
        self.vanishing.lock().unwrap().push(file_name.to_string());
    }

    /// Raise `token` as soon as the first encode starts
    pub fn cancel_on_start(&self, token: CancellationToken) {
        *self.cancel_on_start.lock().unwrap() = Some(token);
    }

    pub fn encoded(&self) -> Vec<PathBuf> {
        self.encoded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn encode(&self, path: &Path) -> Result<(), EncodeError> {
        let token = self.cancel_on_start.lock().unwrap().take();
        if let Some(token) = token {
            token.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if file_name_matches(path, &self.failing) {
            return Err(EncodeError::Failed {
                path: path.to_path_buf(),
                code: 1,
                stderr: "ERROR: input file has an unsupported format".to_string(),
            });
        }
        if file_name_matches(path, &self.interrupted) {
            return Err(EncodeError::Interrupted {
                path: path.to_path_buf(),
            });
        }

        if file_name_matches(path, &self.vanishing) {
            std::fs::remove_file(path).unwrap();
            return Ok(());
        }

        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        write!(file, "{}{}", MARKER, self.version).unwrap();
        self.encoded.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }
}
