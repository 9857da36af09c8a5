use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use walkdir::WalkDir;
use crate::config::ReencodeConfig;
use crate::decision::{decide, Classification, Observation};
use crate::fingerprint::Fingerprint;
use crate::ledger::{get_blocking, Ledger, SharedBatch};
use crate::pool::{Dispatch, Progress, RunContext, WorkerPool};
use crate::probe::MetadataProbe;

/// Counts gathered by one scan pass
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub root: PathBuf,
    /// Tracked files handed to a worker
    pub files_dispatched: u64,
    pub new: u64,
    pub up_to_date: u64,
    pub moved: u64,
    pub needs_reencode: u64,
    /// Tracked files left out because their path cannot be stored
    pub skipped: u64,
    /// Records written by the final commit
    pub records_written: usize,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScanSummary {
    fn new(root: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            root,
            files_dispatched: 0,
            new: 0,
            up_to_date: 0,
            moved: 0,
            needs_reencode: 0,
            skipped: 0,
            records_written: 0,
            cancelled: false,
            started_at: now,
            finished_at: now,
        }
    }

    fn tally(&mut self, classification: Classification) {
        match classification {
            Classification::New => self.new += 1,
            Classification::UpToDate => self.up_to_date += 1,
            Classification::Moved => self.moved += 1,
            Classification::NeedsReencode => self.needs_reencode += 1,
        }
    }

    /// Files that ended up pending
    pub fn to_process(&self) -> u64 {
        self.new + self.needs_reencode
    }
}

/// Walk `root`, classify every tracked file and write the resulting records.
///
/// Any walk, hashing, probing or ledger error aborts the pass and nothing is
/// committed. Cancellation stops dispatching; files already dispatched are
/// still classified and committed.
pub async fn scan_pass(
    ctx: &RunContext,
    cfg: &ReencodeConfig,
    ledger: Arc<dyn Ledger>,
    probe: Arc<dyn MetadataProbe>,
    root: &Path,
    target_encoder: &str,
) -> Result<ScanSummary> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve scan root: {}", root.display()))?;
    if !root.is_dir() {
        anyhow::bail!("Scan root is not a directory: {}", root.display());
    }

    info!("Scanning {} for .{} files (target encoder {:?})", root.display(), cfg.extension, target_encoder);

    let mut summary = ScanSummary::new(root.clone());
    let batch = SharedBatch::new();
    let target: Arc<str> = Arc::from(target_encoder);
    let mut pool = WorkerPool::new("scan", cfg.scan_workers, ctx.token.clone());
    let mut walk_error = None;

    for entry in WalkDir::new(&root).follow_links(false) {
        if ctx.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        if pool.has_failed() {
            break;
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                walk_error = Some(anyhow::Error::new(e).context(format!("Failed to walk {}", root.display())));
                break;
            }
        };

        // Directories, symlinks and special files are ignored
        if !entry.file_type().is_file() || !cfg.is_tracked(entry.path()) {
            continue;
        }
        // Records store paths as text
        if entry.path().to_str().is_none() {
            warn!("Skipping file with a non UTF-8 path: {}", entry.path().display());
            summary.skipped += 1;
            continue;
        }

        let work = scan_file(
            entry.into_path(),
            ledger.clone(),
            probe.clone(),
            batch.clone(),
            ctx.progress.clone(),
            target.clone(),
        );
        match pool.dispatch(work).await {
            Dispatch::Started => summary.files_dispatched += 1,
            Dispatch::Cancelled => {
                summary.cancelled = true;
                break;
            }
        }

        if summary.files_dispatched % cfg.progress_every == 0 {
            info!(
                "Scanned {} file(s) so far in {}, {} to process",
                summary.files_dispatched,
                root.display(),
                ctx.progress.queued()
            );
        }
    }

    if summary.cancelled {
        warn!("Scan cancelled, waiting for {} file(s) already in progress", pool.in_flight());
    }

    let classifications = pool.finish().await?;
    if let Some(e) = walk_error {
        return Err(e);
    }
    for classification in classifications {
        summary.tally(classification);
    }

    let pending = batch.take();
    summary.records_written = pending.len();
    ledger
        .commit(pending)
        .with_context(|| format!("Failed to commit scan results for {}", root.display()))?;

    summary.finished_at = Utc::now();
    info!(
        "Done indexing {}: {} file(s), {} new, {} need reencoding, {} moved, {} up to date, {} skipped{}",
        root.display(),
        summary.files_dispatched,
        summary.new,
        summary.needs_reencode,
        summary.moved,
        summary.up_to_date,
        summary.skipped,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    Ok(summary)
}

async fn scan_file(
    path: PathBuf,
    ledger: Arc<dyn Ledger>,
    probe: Arc<dyn MetadataProbe>,
    batch: SharedBatch,
    progress: Arc<Progress>,
    target_encoder: Arc<str>,
) -> Result<Classification> {
    let fingerprint = Fingerprint::of_file_async(path.clone()).await?;
    let encoder_identity = probe
        .encoder_identity(&path)
        .await
        .with_context(|| format!("Failed to probe encoder of {}", path.display()))?;

    let existing = get_blocking(ledger, fingerprint)
        .await
        .with_context(|| format!("Failed to look up {} ({})", path.display(), fingerprint))?;

    let observed = Observation {
        absolute_path: path,
        fingerprint,
        encoder_identity,
    };
    let decision = decide(&observed, existing.as_ref(), &target_encoder);
    debug!("{}: {} ({:?})", observed.absolute_path.display(), decision.classification, fingerprint);

    if decision.classification.requires_work() {
        progress.add_queued();
    }
    batch.upsert(fingerprint, decision.record);
    Ok(decision.classification)
}
