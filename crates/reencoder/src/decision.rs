use std::fmt;
use std::path::PathBuf;
use crate::fingerprint::Fingerprint;
use crate::record::Record;

/// Outcome of comparing an observed file against its ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Content never seen before
    New,
    /// Same content, same location, same encoder
    UpToDate,
    /// Same content and encoder at a different location
    Moved,
    /// Content must go through the encoder (again)
    NeedsReencode,
}

impl Classification {
    /// Whether the resulting record is marked pending
    pub fn requires_work(self) -> bool {
        matches!(self, Classification::New | Classification::NeedsReencode)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::UpToDate => "up to date",
            Classification::Moved => "moved",
            Classification::NeedsReencode => "needs reencode",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freshly observed state of one file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub absolute_path: PathBuf,
    pub fingerprint: Fingerprint,
    /// Encoder identity reported by the metadata probe, empty if none
    pub encoder_identity: String,
}

/// Classification plus the record that must be written for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub classification: Classification,
    pub record: Record,
}

/// Classify an observation given the record stored under its fingerprint.
///
/// Rules apply in order: no record is `New`, an unfinished record is
/// `NeedsReencode`, an encoder mismatch is `NeedsReencode`, a path change is
/// `Moved`, anything else is `UpToDate`.
pub fn classify(observed: &Observation, existing: Option<&Record>, target_encoder: &str) -> Classification {
    let Some(existing) = existing else {
        return Classification::New;
    };
    if existing.pending {
        return Classification::NeedsReencode;
    }
    if existing.encoder_identity != target_encoder {
        return Classification::NeedsReencode;
    }
    if existing.absolute_path != observed.absolute_path {
        return Classification::Moved;
    }
    Classification::UpToDate
}

/// Classify and build the record to upsert.
///
/// The record always carries the observed path and encoder identity so the
/// next run compares against the latest observation.
pub fn decide(observed: &Observation, existing: Option<&Record>, target_encoder: &str) -> Decision {
    let classification = classify(observed, existing, target_encoder);
    let record = Record {
        absolute_path: observed.absolute_path.clone(),
        encoder_identity: observed.encoder_identity.clone(),
        pending: classification.requires_work(),
    };
    Decision { classification, record }
}
