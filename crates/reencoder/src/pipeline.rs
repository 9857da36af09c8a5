use std::path::Path;
use std::sync::Arc;
use anyhow::{Context, Result};
use log::{info, warn};
use crate::config::ReencodeConfig;
use crate::encode::Encoder;
use crate::ledger::{count_pending_blocking, Ledger};
use crate::pool::RunContext;
use crate::probe::MetadataProbe;
use crate::reconcile::{reconcile_pass, ReconcileSummary};
use crate::scan::{scan_pass, ScanSummary};

/// Which passes a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Scan, then reencode pending files and clean vanished ones
    #[default]
    Full,
    /// Scan only
    IndexOnly,
    /// Scan, then report how many files are pending
    DryRun,
    /// Drop ledger records whose file is gone, without scanning or encoding
    Clean,
}

/// Everything a run did, per pass
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub scan: Option<ScanSummary>,
    pub reconcile: Option<ReconcileSummary>,
    /// Pending records under the root, reported by dry runs
    pub pending: Option<u64>,
    /// Whether a clean run reclaimed ledger space
    pub compacted: bool,
}

impl RunReport {
    pub fn cancelled(&self) -> bool {
        self.scan.as_ref().is_some_and(|s| s.cancelled)
            || self.reconcile.as_ref().is_some_and(|r| r.cancelled)
    }
}

/// The collaborators a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub probe: Arc<dyn MetadataProbe>,
    pub encoder: Arc<dyn Encoder>,
}

/// Run the passes selected by `mode` against `root`
pub async fn run(
    ctx: &RunContext,
    cfg: &ReencodeConfig,
    parts: &Collaborators,
    root: &Path,
    target_encoder: &str,
    mode: Mode,
) -> Result<RunReport> {
    let mut report = RunReport::default();

    if mode != Mode::Clean {
        let scan = scan_pass(ctx, cfg, parts.ledger.clone(), parts.probe.clone(), root, target_encoder).await?;
        report.scan = Some(scan);
    }

    match mode {
        Mode::IndexOnly => {}
        Mode::DryRun => {
            let root = root
                .canonicalize()
                .with_context(|| format!("Failed to resolve root: {}", root.display()))?;
            let pending = count_pending_blocking(parts.ledger.clone(), root).await?;
            info!("Files to reencode:\t{}", pending);
            report.pending = Some(pending);
        }
        Mode::Full | Mode::Clean => {
            if report.cancelled() {
                info!("Run cancelled during scan, skipping reencoding");
            } else {
                let reconcile = reconcile_pass(
                    ctx,
                    cfg,
                    parts.ledger.clone(),
                    parts.encoder.clone(),
                    root,
                    target_encoder,
                    mode == Mode::Full,
                )
                .await?;
                if mode == Mode::Clean && reconcile.removed > 0 {
                    report.compacted = compact(parts.ledger.clone()).await;
                }
                report.reconcile = Some(reconcile);
            }
        }
    }

    Ok(report)
}

/// Reclaim the space freed by a clean. The deletions are already committed,
/// so a failure here is only logged.
async fn compact(ledger: Arc<dyn Ledger>) -> bool {
    match tokio::task::spawn_blocking(move || ledger.compact()).await {
        Ok(Ok(compacted)) => {
            info!("Ledger compacted: {}", compacted);
            compacted
        }
        Ok(Err(e)) => {
            warn!("Failed to compact ledger: {}", e);
            false
        }
        Err(e) => {
            warn!("Ledger compaction task panicked: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::ledger::{iter_all, RedbLedger};
    use crate::record::Record;
    use crate::testing::{write_file, FakeEncoder, FakeProbe};

    fn parts(ledger: Arc<dyn Ledger>, encoder: Arc<FakeEncoder>) -> Collaborators {
        Collaborators {
            ledger,
            probe: Arc::new(FakeProbe::default()),
            encoder,
        }
    }

    fn all_records(ledger: &dyn Ledger) -> Vec<(Fingerprint, Record)> {
        iter_all(ledger).map(|e| e.unwrap()).collect()
    }

    #[tokio::test]
    async fn single_file_end_to_end() {
        let music = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let path = write_file(music.path(), "a.flac", b"fLaC never touched").canonicalize().unwrap();
        let h1 = Fingerprint::of_file(&path).unwrap();

        let ledger: Arc<dyn Ledger> = Arc::new(RedbLedger::open(db.path()).unwrap());
        let encoder = Arc::new(FakeEncoder::new("1.4.3"));
        let parts = parts(ledger.clone(), encoder.clone());
        let cfg = ReencodeConfig::default_config();

        // Scan alone records the file as pending under its original fingerprint
        let ctx = RunContext::new();
        run(&ctx, &cfg, &parts, music.path(), "1.4.3", Mode::IndexOnly).await.unwrap();
        assert_eq!(all_records(ledger.as_ref()), vec![(h1, Record::new(path.clone(), "", true))]);

        let report = run(&RunContext::new(), &cfg, &parts, music.path(), "1.4.3", Mode::Full).await.unwrap();
        assert_eq!(report.reconcile.unwrap().encoded, 1);
        assert_eq!(encoder.encoded(), vec![path.clone()]);

        let h2 = Fingerprint::of_file(&path).unwrap();
        assert_ne!(h1, h2);
        assert_eq!(all_records(ledger.as_ref()), vec![(h2, Record::new(path, "1.4.3", false))]);
    }

    #[tokio::test]
    async fn second_run_finds_nothing_to_do() {
        let music = tempfile::tempdir().unwrap();
        write_file(music.path(), "a.flac", b"one");
        write_file(music.path(), "disc 2/b.flac", b"two");
        write_file(music.path(), "disc 2/c.flac", b"three");

        let ledger: Arc<dyn Ledger> = Arc::new(crate::ledger::MemoryLedger::new());
        let encoder = Arc::new(FakeEncoder::new("1.4.3"));
        let parts = parts(ledger.clone(), encoder.clone());
        let cfg = ReencodeConfig::default_config();

        let first = run(&RunContext::new(), &cfg, &parts, music.path(), "1.4.3", Mode::Full).await.unwrap();
        assert_eq!(first.scan.unwrap().new, 3);
        assert_eq!(first.reconcile.unwrap().encoded, 3);

        let second = run(&RunContext::new(), &cfg, &parts, music.path(), "1.4.3", Mode::Full).await.unwrap();
        let scan = second.scan.unwrap();
        assert_eq!(scan.up_to_date, 3);
        assert_eq!(scan.to_process(), 0);
        assert_eq!(second.reconcile.unwrap().encoded, 0);
        assert_eq!(encoder.encoded().len(), 3);
        assert!(all_records(ledger.as_ref()).iter().all(|(_, r)| !r.pending));
    }

    #[tokio::test]
    async fn encoder_upgrade_triggers_reencode() {
        let music = tempfile::tempdir().unwrap();
        write_file(music.path(), "a.flac", b"one");
        let ledger: Arc<dyn Ledger> = Arc::new(crate::ledger::MemoryLedger::new());
        let cfg = ReencodeConfig::default_config();

        let old = parts(ledger.clone(), Arc::new(FakeEncoder::new("1.4.3")));
        run(&RunContext::new(), &cfg, &old, music.path(), "1.4.3", Mode::Full).await.unwrap();

        let upgraded = parts(ledger.clone(), Arc::new(FakeEncoder::new("1.5.0")));
        let report = run(&RunContext::new(), &cfg, &upgraded, music.path(), "1.5.0", Mode::Full).await.unwrap();

        assert_eq!(report.scan.unwrap().needs_reencode, 1);
        let records = all_records(ledger.as_ref());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.encoder_identity, "1.5.0");
        assert!(!records[0].1.pending);
    }

    #[tokio::test]
    async fn dry_run_counts_without_encoding() {
        let music = tempfile::tempdir().unwrap();
        write_file(music.path(), "a.flac", b"one");
        write_file(music.path(), "b.flac", b"two");
        let ledger: Arc<dyn Ledger> = Arc::new(crate::ledger::MemoryLedger::new());
        let encoder = Arc::new(FakeEncoder::new("1.4.3"));
        let parts = parts(ledger, encoder.clone());

        let report = run(
            &RunContext::new(),
            &ReencodeConfig::default_config(),
            &parts,
            music.path(),
            "1.4.3",
            Mode::DryRun,
        )
        .await
        .unwrap();

        assert_eq!(report.pending, Some(2));
        assert!(report.reconcile.is_none());
        assert!(encoder.encoded().is_empty());
    }

    #[tokio::test]
    async fn clean_mode_skips_scan() {
        let music = tempfile::tempdir().unwrap();
        let gone = write_file(music.path(), "gone.flac", b"bye").canonicalize().unwrap();
        let key = Fingerprint::of_file(&gone).unwrap();
        std::fs::remove_file(&gone).unwrap();
        write_file(music.path(), "unindexed.flac", b"new");

        let ledger: Arc<dyn Ledger> = Arc::new(crate::ledger::MemoryLedger::new());
        ledger.upsert(key, Record::new(gone, "1.4.3", false)).unwrap();
        let parts = parts(ledger.clone(), Arc::new(FakeEncoder::new("1.4.3")));

        let report = run(
            &RunContext::new(),
            &ReencodeConfig::default_config(),
            &parts,
            music.path(),
            "1.4.3",
            Mode::Clean,
        )
        .await
        .unwrap();

        assert!(report.scan.is_none());
        assert_eq!(report.reconcile.unwrap().removed, 1);
        assert!(all_records(ledger.as_ref()).is_empty());
    }

    #[tokio::test]
    async fn clean_mode_compacts_durable_ledger() {
        let music = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let kept = write_file(music.path(), "kept.flac", b"stays").canonicalize().unwrap();
        let gone = write_file(music.path(), "gone.flac", b"bye").canonicalize().unwrap();
        let kept_key = Fingerprint::of_file(&kept).unwrap();
        let gone_key = Fingerprint::of_file(&gone).unwrap();
        std::fs::remove_file(&gone).unwrap();

        let ledger: Arc<dyn Ledger> = Arc::new(RedbLedger::open(db.path()).unwrap());
        ledger.upsert(kept_key, Record::new(kept.clone(), "1.4.3", false)).unwrap();
        ledger.upsert(gone_key, Record::new(gone, "1.4.3", false)).unwrap();
        let parts = parts(ledger.clone(), Arc::new(FakeEncoder::new("1.4.3")));

        let report = run(
            &RunContext::new(),
            &ReencodeConfig::default_config(),
            &parts,
            music.path(),
            "1.4.3",
            Mode::Clean,
        )
        .await
        .unwrap();

        assert_eq!(report.reconcile.unwrap().removed, 1);
        assert_eq!(all_records(ledger.as_ref()), vec![(kept_key, Record::new(kept, "1.4.3", false))]);
        // The ledger stays usable after compaction
        assert_eq!(ledger.get(&gone_key).unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_scan_skips_reconciliation() {
        let music = tempfile::tempdir().unwrap();
        write_file(music.path(), "a.flac", b"one");
        let ledger: Arc<dyn Ledger> = Arc::new(crate::ledger::MemoryLedger::new());
        let encoder = Arc::new(FakeEncoder::new("1.4.3"));
        let parts = parts(ledger, encoder.clone());
        let ctx = RunContext::new();
        ctx.cancel();

        let report = run(&ctx, &ReencodeConfig::default_config(), &parts, music.path(), "1.4.3", Mode::Full)
            .await
            .unwrap();

        assert!(report.cancelled());
        assert!(report.reconcile.is_none());
        assert!(encoder.encoded().is_empty());
    }
}
