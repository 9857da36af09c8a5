mod memory;
mod redb_store;

pub use memory::MemoryLedger;
pub use redb_store::RedbLedger;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use anyhow::Context;
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::record::Record;

/// Entries fetched per round trip by [`Entries`]
pub const PAGE_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger directory does not exist: {0}")]
    MissingDir(PathBuf),
    #[error("ledger is already opened by another process: {0}")]
    Locked(PathBuf),
    #[error("failed to open ledger {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: redb::DatabaseError,
    },
    #[error("ledger storage error: {0}")]
    Storage(#[from] redb::Error),
    #[error("failed to encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("stored key has {0} bytes, expected 32")]
    CorruptKey(usize),
}

/// One pending mutation inside a [`Batch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Upsert(Fingerprint, Record),
    Delete(Fingerprint),
}

/// Mutations applied in order by a single [`Ledger::commit`]
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, key: Fingerprint, record: Record) {
        self.ops.push(BatchOp::Upsert(key, record));
    }

    pub fn delete(&mut self, key: Fingerprint) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Batch handle shared between concurrent workers of one pass
#[derive(Debug, Clone, Default)]
pub struct SharedBatch {
    inner: Arc<Mutex<Batch>>,
}

impl SharedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Batch> {
        // A worker that panicked mid-push leaves the Vec intact
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn upsert(&self, key: Fingerprint, record: Record) {
        self.lock().upsert(key, record);
    }

    pub fn delete(&self, key: Fingerprint) {
        self.lock().delete(key);
    }

    /// Replace `old` with `new` under the same lock so no other write lands in between
    pub fn rekey(&self, old: Fingerprint, new: Fingerprint, record: Record) {
        let mut batch = self.lock();
        batch.delete(old);
        batch.upsert(new, record);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take the accumulated mutations, leaving an empty batch behind
    pub fn take(&self) -> Batch {
        std::mem::take(&mut *self.lock())
    }
}

/// Capability set every ledger backend provides
pub trait Ledger: Send + Sync {
    /// Point lookup; a missing key is `Ok(None)`
    fn get(&self, key: &Fingerprint) -> Result<Option<Record>, LedgerError>;

    /// Up to `limit` entries with keys strictly greater than `after`, in key order
    fn page(
        &self,
        after: Option<&Fingerprint>,
        limit: usize,
    ) -> Result<Vec<(Fingerprint, Record)>, LedgerError>;

    /// Apply every operation of `batch` atomically
    fn commit(&self, batch: Batch) -> Result<(), LedgerError>;

    fn upsert(&self, key: Fingerprint, record: Record) -> Result<(), LedgerError> {
        let mut batch = Batch::new();
        batch.upsert(key, record);
        self.commit(batch)
    }

    fn delete(&self, key: &Fingerprint) -> Result<(), LedgerError> {
        let mut batch = Batch::new();
        batch.delete(*key);
        self.commit(batch)
    }

    /// Reclaim space left behind by deletions; `Ok(false)` when nothing was done
    fn compact(&self) -> Result<bool, LedgerError> {
        Ok(false)
    }
}

/// Lazy iterator over every entry of a ledger, fetched page by page
pub struct Entries<'a, L: Ledger + ?Sized> {
    ledger: &'a L,
    buffered: VecDeque<(Fingerprint, Record)>,
    last: Option<Fingerprint>,
    exhausted: bool,
}

impl<'a, L: Ledger + ?Sized> Iterator for Entries<'a, L> {
    type Item = Result<(Fingerprint, Record), LedgerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            match self.ledger.page(self.last.as_ref(), PAGE_SIZE) {
                Ok(page) => {
                    self.exhausted = page.len() < PAGE_SIZE;
                    self.buffered.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let (key, record) = self.buffered.pop_front()?;
        self.last = Some(key);
        Some(Ok((key, record)))
    }
}

/// Iterate every entry in `ledger`; each call starts from the beginning
pub fn iter_all<L: Ledger + ?Sized>(ledger: &L) -> Entries<'_, L> {
    Entries {
        ledger,
        buffered: VecDeque::new(),
        last: None,
        exhausted: false,
    }
}

/// Number of pending records located under `root`
pub fn count_pending<L: Ledger + ?Sized>(ledger: &L, root: &Path) -> Result<u64, LedgerError> {
    let mut count = 0;
    for entry in iter_all(ledger) {
        let (_, record) = entry?;
        if record.pending && record.absolute_path.starts_with(root) {
            count += 1;
        }
    }
    Ok(count)
}

// Backends block on disk I/O, so async callers go through the blocking pool.

/// [`Ledger::get`] on the blocking pool
pub async fn get_blocking(ledger: Arc<dyn Ledger>, key: Fingerprint) -> anyhow::Result<Option<Record>> {
    tokio::task::spawn_blocking(move || ledger.get(&key))
        .await
        .context("Ledger read task panicked")?
        .map_err(anyhow::Error::from)
}

/// [`Ledger::page`] on the blocking pool
pub async fn page_blocking(
    ledger: Arc<dyn Ledger>,
    after: Option<Fingerprint>,
    limit: usize,
) -> anyhow::Result<Vec<(Fingerprint, Record)>> {
    tokio::task::spawn_blocking(move || ledger.page(after.as_ref(), limit))
        .await
        .context("Ledger read task panicked")?
        .map_err(anyhow::Error::from)
}

/// [`count_pending`] on the blocking pool
pub async fn count_pending_blocking(ledger: Arc<dyn Ledger>, root: PathBuf) -> anyhow::Result<u64> {
    tokio::task::spawn_blocking(move || count_pending(ledger.as_ref(), &root))
        .await
        .context("Ledger read task panicked")?
        .context("Failed to count pending records")
}
