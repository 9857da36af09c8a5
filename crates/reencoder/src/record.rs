use std::path::PathBuf;
use serde::{Deserialize, Serialize};

/// Ledger entry for one content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Last known absolute location of this content
    pub absolute_path: PathBuf,
    /// Encoder that last produced these bytes, empty when unknown
    pub encoder_identity: String,
    /// Content still needs to go through the encoder
    pub pending: bool,
}

impl Record {
    pub fn new(absolute_path: PathBuf, encoder_identity: impl Into<String>, pending: bool) -> Self {
        Self {
            absolute_path,
            encoder_identity: encoder_identity.into(),
            pending,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
