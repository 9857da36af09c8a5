use anyhow::{Context, Result};
use clap::Parser;
use directories::BaseDirs;
use log::{info, warn};
use reencoder::{
    config::ReencodeConfig,
    pipeline::{self, Collaborators, Mode, RunReport},
    FlacEncoder, Metaflac, RedbLedger, RunContext,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Indexes FLAC files, checks their encoder and reencodes the outdated ones
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Folder with files to index and reencode
    #[arg(short, long, default_value = ".")]
    path: PathBuf,

    /// Ledger directory (defaults to the platform data directory)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Encoder argument to use when reencoding, can be given multiple times
    #[arg(short = 'a', long = "flac", allow_hyphen_values = true)]
    flac_args: Vec<String>,

    /// Number of files reencoded at once
    #[arg(short, long)]
    threads: Option<usize>,

    /// Number of files fingerprinted and probed at once
    #[arg(long)]
    scan_workers: Option<usize>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only index files, do not reencode
    #[arg(short, long, conflicts_with_all = ["dry_run", "clean"])]
    index_only: bool,

    /// Index files and report how many need reencoding
    #[arg(long, conflicts_with = "clean")]
    dry_run: bool,

    /// Remove ledger entries for files that no longer exist
    #[arg(long)]
    clean: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.index_only {
            Mode::IndexOnly
        } else if self.dry_run {
            Mode::DryRun
        } else if self.clean {
            Mode::Clean
        } else {
            Mode::Full
        }
    }

    /// Command line values win over the configuration file
    fn apply(&self, mut cfg: ReencodeConfig) -> ReencodeConfig {
        if let Some(db) = &self.db {
            cfg.ledger_dir = Some(db.clone());
        }
        if !self.flac_args.is_empty() {
            cfg.encode_args = self.flac_args.clone();
        }
        if let Some(threads) = self.threads {
            cfg.encode_workers = threads;
        }
        if let Some(workers) = self.scan_workers {
            cfg.scan_workers = workers;
        }
        cfg.normalized()
    }
}

/// Resolve the ledger directory: a configured one must exist, the default one is created
fn ledger_dir(cfg: &ReencodeConfig) -> Result<PathBuf> {
    if let Some(dir) = &cfg.ledger_dir {
        if !dir.is_dir() {
            anyhow::bail!("Ledger directory does not exist: {}", dir.display());
        }
        return Ok(dir.clone());
    }

    let base = BaseDirs::new().context("Failed to locate application data folder")?;
    let dir = base.data_dir().join("reencoder");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create ledger directory: {}", dir.display()))?;
    Ok(dir)
}

fn log_report(report: &RunReport) {
    if let Some(scan) = &report.scan {
        info!(
            "Scan: {} file(s), {} to process, {} skipped, elapsed {}s",
            scan.files_dispatched,
            scan.to_process(),
            scan.skipped,
            (scan.finished_at - scan.started_at).num_seconds()
        );
    }
    if let Some(reconcile) = &report.reconcile {
        info!(
            "Reencode: {} done, {} failed, {} removed from ledger, {} duplicate(s) dropped, elapsed {}s",
            reconcile.encoded,
            reconcile.failed,
            reconcile.removed,
            reconcile.duplicates,
            (reconcile.finished_at - reconcile.started_at).num_seconds()
        );
    }
    if report.compacted {
        info!("Ledger compacted after cleaning");
    }
    if report.cancelled() {
        warn!("Run was interrupted; unfinished files stay pending for the next run");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = args.apply(
        ReencodeConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?,
    );

    if !args.path.is_dir() {
        anyhow::bail!("Path is not a directory: {}", args.path.display());
    }

    let dir = ledger_dir(&cfg)?;
    let ledger = RedbLedger::open(&dir)
        .with_context(|| format!("Failed to open ledger in {}", dir.display()))?;

    let encoder = FlacEncoder::from_config(&cfg);
    let target_encoder = encoder
        .version()
        .await
        .context("Failed to query the installed encoder version")?;

    info!("Reencoder starting");
    info!("  Path: {}", args.path.display());
    info!("  Ledger: {}", ledger.path().display());
    info!("  Target encoder: {}", target_encoder);
    info!("  Encoder arguments: {:?}", encoder.args());
    info!("  Workers: {} scan, {} encode", cfg.scan_workers, cfg.encode_workers);

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, letting running work finish...");
                token.cancel();
            }
        }
    });

    let parts = Collaborators {
        ledger: Arc::new(ledger),
        probe: Arc::new(Metaflac::from_config(&cfg)),
        encoder: Arc::new(encoder),
    };
    let ctx = RunContext::with_token(token);

    let report = pipeline::run(&ctx, &cfg, &parts, &args.path, &target_encoder, args.mode()).await?;
    log_report(&report);

    Ok(())
}
