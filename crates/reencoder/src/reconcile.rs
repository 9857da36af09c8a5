use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use crate::config::ReencodeConfig;
use crate::encode::Encoder;
use crate::fingerprint::Fingerprint;
use crate::ledger::{count_pending_blocking, page_blocking, Ledger, SharedBatch, PAGE_SIZE};
use crate::pool::{Dispatch, Progress, RunContext, WorkerPool};
use crate::record::Record;

/// Result of handing one pending file to the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    Encoded,
    Failed,
    Interrupted,
}

/// Counts gathered by one reconciliation pass
#[derive(Debug, Clone)]
pub struct ReconcileSummary {
    pub root: PathBuf,
    /// Records whose file no longer exists, deleted from the ledger
    pub removed: u64,
    pub encoded: u64,
    pub failed: u64,
    pub interrupted: u64,
    /// Pending records under the root that were not handed to the encoder
    pub left_pending: u64,
    /// Extra pending records for a path already handed to the encoder, deleted
    pub duplicates: u64,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileSummary {
    fn new(root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            root,
            removed: 0,
            encoded: 0,
            failed: 0,
            interrupted: 0,
            left_pending: 0,
            duplicates: 0,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Walk the ledger for records under `root`: drop records whose file is gone
/// and, when `encode` is set, reencode pending files and re-key their records.
///
/// Encoder failures are logged and leave the record pending. Ledger and
/// hashing errors abort the pass without committing.
pub async fn reconcile_pass(
    ctx: &RunContext,
    cfg: &ReencodeConfig,
    ledger: Arc<dyn Ledger>,
    encoder: Arc<dyn Encoder>,
    root: &Path,
    target_encoder: &str,
    encode: bool,
) -> Result<ReconcileSummary> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve root: {}", root.display()))?;

    let mut total = ctx.progress.queued();
    if total == 0 && encode {
        total = count_pending_blocking(ledger.clone(), root.clone()).await?;
    }
    if encode {
        info!("Reencoding {} pending file(s) under {}", total, root.display());
    } else {
        info!("Cleaning ledger entries under {}", root.display());
    }

    let mut summary = ReconcileSummary::new(root.clone());
    let batch = SharedBatch::new();
    let target: Arc<str> = Arc::from(target_encoder);
    let mut pool = WorkerPool::new("reencode", cfg.encode_workers, ctx.token.clone());
    let mut dispatched_paths = HashSet::new();
    let mut pass_error = None;
    let mut after = None;

    'pages: loop {
        let page = match page_blocking(ledger.clone(), after, PAGE_SIZE)
            .await
            .context("Failed to read ledger")
        {
            Ok(page) => page,
            Err(e) => {
                pass_error = Some(e);
                break;
            }
        };
        let last_page = page.len() < PAGE_SIZE;

        for (key, record) in page {
            after = Some(key);
            if ctx.is_cancelled() {
                summary.cancelled = true;
                break 'pages;
            }
            if pool.has_failed() {
                break 'pages;
            }

            // Records from other roots are left alone
            if !record.absolute_path.starts_with(&root) {
                continue;
            }

            match record.absolute_path.try_exists() {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Removing vanished file from ledger: {}", record.absolute_path.display());
                    batch.delete(key);
                    summary.removed += 1;
                    continue;
                }
                Err(e) => {
                    pass_error = Some(anyhow::Error::new(e).context(format!(
                        "Failed to check {}",
                        record.absolute_path.display()
                    )));
                    break 'pages;
                }
            }

            if !record.pending {
                continue;
            }
            if !encode {
                summary.left_pending += 1;
                continue;
            }

            // The file already being encoded produces the only record this path needs
            if dispatched_paths.contains(&record.absolute_path) {
                debug!("Dropping duplicate ledger record for {}", record.absolute_path.display());
                batch.delete(key);
                summary.duplicates += 1;
                continue;
            }
            dispatched_paths.insert(record.absolute_path.clone());

            let work = encode_file(
                key,
                record,
                encoder.clone(),
                batch.clone(),
                ctx.progress.clone(),
                total,
                target.clone(),
            );
            if pool.dispatch(work).await == Dispatch::Cancelled {
                summary.cancelled = true;
                break 'pages;
            }
        }

        if last_page {
            break;
        }
    }

    if summary.cancelled {
        warn!("Reencoding cancelled, waiting for {} encode(s) already running", pool.in_flight());
    }

    let outcomes = pool.finish().await?;
    if let Some(e) = pass_error {
        return Err(e);
    }
    for outcome in outcomes {
        match outcome {
            EncodeOutcome::Encoded => summary.encoded += 1,
            EncodeOutcome::Failed => summary.failed += 1,
            EncodeOutcome::Interrupted => summary.interrupted += 1,
        }
    }

    ledger
        .commit(batch.take())
        .with_context(|| format!("Failed to commit reconciliation results for {}", root.display()))?;

    summary.finished_at = Utc::now();
    info!(
        "Finished {} under {}: {} reencoded, {} failed, {} interrupted, {} removed from ledger{}",
        if encode { "reencoding" } else { "cleaning" },
        root.display(),
        summary.encoded,
        summary.failed,
        summary.interrupted,
        summary.removed,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(summary)
}

async fn encode_file(
    key: Fingerprint,
    record: Record,
    encoder: Arc<dyn Encoder>,
    batch: SharedBatch,
    progress: Arc<Progress>,
    total: u64,
    target_encoder: Arc<str>,
) -> Result<EncodeOutcome> {
    let path = record.absolute_path;

    if let Err(e) = encoder.encode(&path).await {
        if e.is_interrupted() {
            warn!("{}", e);
            return Ok(EncodeOutcome::Interrupted);
        }
        error!("Failed to reencode {}: {}", path.display(), e);
        return Ok(EncodeOutcome::Failed);
    }

    let new_key = Fingerprint::of_file_async(path.clone())
        .await
        .with_context(|| format!("Failed to fingerprint reencoded file {}", path.display()))?;
    let updated = Record::new(path, &*target_encoder, false);
    let done = progress.complete_one();
    info!("[{}/{}] Reencoded {}", done, total, updated.absolute_path.display());

    if new_key == key {
        batch.upsert(key, updated);
    } else {
        batch.rekey(key, new_key, updated);
    }
    Ok(EncodeOutcome::Encoded)
}
