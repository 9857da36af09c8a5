use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};
use log::debug;
use redb::{Database, DatabaseError, ReadableDatabase, TableDefinition};

use super::{Batch, BatchOp, Ledger, LedgerError};
use crate::fingerprint::Fingerprint;
use crate::record::Record;

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

fn storage(err: impl Into<redb::Error>) -> LedgerError {
    LedgerError::Storage(err.into())
}

/// Durable ledger in a single redb file.
///
/// redb takes an exclusive lock on the file, so a second process opening the
/// same ledger gets [`LedgerError::Locked`] instead of a shared handle.
pub struct RedbLedger {
    // Transactions are owned, so the read side is only held while one begins;
    // compaction takes the write side.
    db: RwLock<Database>,
    path: PathBuf,
}

impl RedbLedger {
    pub const FILE_NAME: &'static str = "reencoder.redb";

    /// Open (or create) the ledger file inside `dir`, which must already exist
    pub fn open(dir: &Path) -> Result<Self, LedgerError> {
        if !dir.is_dir() {
            return Err(LedgerError::MissingDir(dir.to_path_buf()));
        }
        let path = dir.join(Self::FILE_NAME);

        let db = Database::create(&path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => LedgerError::Locked(path.clone()),
            source => LedgerError::Open {
                path: path.clone(),
                source,
            },
        })?;

        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(RECORDS).map_err(storage)?;
        txn.commit().map_err(storage)?;

        debug!("Opened ledger at {}", path.display());
        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> RwLockReadGuard<'_, Database> {
        self.db.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RedbLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbLedger").field("path", &self.path).finish()
    }
}

impl Ledger for RedbLedger {
    fn get(&self, key: &Fingerprint) -> Result<Option<Record>, LedgerError> {
        let txn = self.db().begin_read().map_err(storage)?;
        let table = txn.open_table(RECORDS).map_err(storage)?;
        match table.get(&key.as_bytes()[..]).map_err(storage)? {
            Some(value) => Ok(Some(Record::from_bytes(value.value())?)),
            None => Ok(None),
        }
    }

    fn page(
        &self,
        after: Option<&Fingerprint>,
        limit: usize,
    ) -> Result<Vec<(Fingerprint, Record)>, LedgerError> {
        let txn = self.db().begin_read().map_err(storage)?;
        let table = txn.open_table(RECORDS).map_err(storage)?;

        let lower: Bound<&[u8]> = match after {
            Some(key) => Bound::Excluded(&key.as_bytes()[..]),
            None => Bound::Unbounded,
        };
        let range = table.range::<&[u8]>((lower, Bound::Unbounded)).map_err(storage)?;

        let mut entries = Vec::with_capacity(limit);
        for entry in range.take(limit) {
            let (key, value) = entry.map_err(storage)?;
            let raw_key = key.value();
            let fingerprint = Fingerprint::from_slice(raw_key)
                .ok_or(LedgerError::CorruptKey(raw_key.len()))?;
            entries.push((fingerprint, Record::from_bytes(value.value())?));
        }
        Ok(entries)
    }

    fn commit(&self, batch: Batch) -> Result<(), LedgerError> {
        let ops = batch.len();
        let txn = self.db().begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(RECORDS).map_err(storage)?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Upsert(key, record) => {
                        let value = record.to_bytes()?;
                        table
                            .insert(&key.as_bytes()[..], value.as_slice())
                            .map_err(storage)?;
                    }
                    BatchOp::Delete(key) => {
                        table.remove(&key.as_bytes()[..]).map_err(storage)?;
                    }
                }
            }
        }
        // Dropping an uncommitted transaction aborts it, so an error above leaves nothing behind
        txn.commit().map_err(storage)?;
        debug!("Committed {} ledger operation(s) to {}", ops, self.path.display());
        Ok(())
    }

    fn compact(&self) -> Result<bool, LedgerError> {
        let mut db = self.db.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let compacted = db.compact().map_err(storage)?;
        debug!("Compacted ledger {} (space reclaimed: {})", self.path.display(), compacted);
        Ok(compacted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FINGERPRINT_LEN;
    use crate::ledger::iter_all;

    fn key(n: u8) -> Fingerprint {
        Fingerprint::from_bytes([n; FINGERPRINT_LEN])
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = RedbLedger::open(dir.path()).unwrap();
            let mut batch = Batch::new();
            batch.upsert(key(1), Record::new(PathBuf::from("/m/a.flac"), "", true));
            batch.upsert(key(2), Record::new(PathBuf::from("/m/b.flac"), "1.4.3", false));
            ledger.commit(batch).unwrap();
        }

        let ledger = RedbLedger::open(dir.path()).unwrap();
        assert_eq!(
            ledger.get(&key(1)).unwrap(),
            Some(Record::new(PathBuf::from("/m/a.flac"), "", true))
        );
        assert_eq!(iter_all(&ledger).count(), 2);
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RedbLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.get(&key(9)).unwrap(), None);
    }

    #[test]
    fn batch_applies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RedbLedger::open(dir.path()).unwrap();
        ledger
            .upsert(key(1), Record::new(PathBuf::from("/m/a.flac"), "", true))
            .unwrap();

        let mut batch = Batch::new();
        batch.delete(key(1));
        batch.upsert(key(2), Record::new(PathBuf::from("/m/a.flac"), "1.4.3", false));
        ledger.commit(batch).unwrap();

        assert_eq!(ledger.get(&key(1)).unwrap(), None);
        assert!(!ledger.get(&key(2)).unwrap().unwrap().pending);
    }

    #[test]
    fn paging_resumes_after_key() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RedbLedger::open(dir.path()).unwrap();
        let mut batch = Batch::new();
        for n in 1..=5 {
            batch.upsert(key(n), Record::new(PathBuf::from(format!("/m/{n}.flac")), "", false));
        }
        ledger.commit(batch).unwrap();

        let first = ledger.page(None, 2).unwrap();
        assert_eq!(first.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![key(1), key(2)]);
        let rest = ledger.page(Some(&key(2)), 10).unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[0].0, key(3));
    }

    #[test]
    fn compaction_keeps_remaining_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RedbLedger::open(dir.path()).unwrap();
        let mut batch = Batch::new();
        for n in 1..=50 {
            batch.upsert(key(n), Record::new(PathBuf::from(format!("/m/{n}.flac")), "1.4.3", false));
        }
        ledger.commit(batch).unwrap();
        let mut batch = Batch::new();
        for n in 2..=50 {
            batch.delete(key(n));
        }
        ledger.commit(batch).unwrap();

        ledger.compact().unwrap();

        assert_eq!(iter_all(&ledger).count(), 1);
        assert_eq!(ledger.get(&key(1)).unwrap().unwrap().absolute_path, PathBuf::from("/m/1.flac"));
        // Still writable afterwards
        ledger
            .upsert(key(7), Record::new(PathBuf::from("/m/7.flac"), "", true))
            .unwrap();
        assert!(ledger.get(&key(7)).unwrap().unwrap().pending);
    }

    #[test]
    fn second_open_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let _first = RedbLedger::open(dir.path()).unwrap();
        let second = RedbLedger::open(dir.path());
        assert!(matches!(second, Err(LedgerError::Locked(_))));
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(RedbLedger::open(&missing), Err(LedgerError::MissingDir(_))));
    }
}
