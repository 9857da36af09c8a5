pub mod config;
pub mod fingerprint;
pub mod record;
pub mod ledger;
pub mod decision;
pub mod probe;
pub mod encode;
pub mod pool;
pub mod scan;
pub mod reconcile;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ReencodeConfig;
pub use decision::{classify, decide, Classification, Decision, Observation};
pub use encode::{EncodeError, Encoder, FlacEncoder};
pub use fingerprint::Fingerprint;
pub use ledger::{Batch, Ledger, LedgerError, MemoryLedger, RedbLedger};
pub use pipeline::{run, Collaborators, Mode, RunReport};
pub use pool::RunContext;
pub use probe::{Metaflac, MetadataProbe, ProbeError};
pub use record::Record;
