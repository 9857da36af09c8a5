use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{Batch, BatchOp, Ledger, LedgerError};
use crate::fingerprint::Fingerprint;
use crate::record::Record;

/// Non-durable ledger kept in a `BTreeMap`
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<BTreeMap<Fingerprint, Record>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Fingerprint, Record>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<Fingerprint, Record>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Ledger for MemoryLedger {
    fn get(&self, key: &Fingerprint) -> Result<Option<Record>, LedgerError> {
        Ok(self.read().get(key).cloned())
    }

    fn page(
        &self,
        after: Option<&Fingerprint>,
        limit: usize,
    ) -> Result<Vec<(Fingerprint, Record)>, LedgerError> {
        let lower = match after {
            Some(key) => Bound::Excluded(*key),
            None => Bound::Unbounded,
        };
        Ok(self
            .read()
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    fn commit(&self, batch: Batch) -> Result<(), LedgerError> {
        let mut records = self.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Upsert(key, record) => {
                    records.insert(key, record);
                }
                BatchOp::Delete(key) => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }
}
