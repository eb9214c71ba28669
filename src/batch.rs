use crate::error::ItemError;
use crate::matcher;
use crate::remux::{RemuxJob, Remuxer};

use crossbeam_channel::{bounded, unbounded};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info, warn};

pub const DEFAULT_EXTENSION: &str = "mp4";

/// Result of processing one discovered manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Success { output: PathBuf },
    Failure { reason: String },
    Skipped { existing: PathBuf },
    /// Manifest parsed but one or both streams were not found.
    Incomplete { missing: Vec<&'static str> },
}

#[derive(Debug, Clone)]
pub struct ItemReport {
    pub manifest: PathBuf,
    pub outcome: MergeOutcome,
}

/// Observer for batch progress. Called from worker threads.
pub trait BatchEvents: Send + Sync {
    fn discovered(&self, manifest: &Path);
    fn started(&self, worker: usize, manifest: &Path);
    fn finished(&self, worker: usize, report: &ItemReport);
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub output_dir: PathBuf,
    pub extension: String,
    pub workers: usize,
}

impl BatchConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            workers: 1,
        }
    }

    pub fn output_path(&self, stem: &str) -> PathBuf {
        let ext = self.extension.trim_start_matches('.');
        self.output_dir.join(format!("{}.{}", stem, ext))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub discovered: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub incomplete: usize,
    /// Manifest path and cause for every failure, sorted by path.
    pub failures: Vec<(PathBuf, String)>,
}

impl BatchSummary {
    pub fn record(&mut self, report: &ItemReport) {
        match &report.outcome {
            MergeOutcome::Success { .. } => self.success += 1,
            MergeOutcome::Skipped { .. } => self.skipped += 1,
            MergeOutcome::Incomplete { .. } => self.incomplete += 1,
            MergeOutcome::Failure { reason } => {
                self.failed += 1;
                self.failures.push((report.manifest.clone(), reason.clone()));
            }
        }
    }

    pub fn processed(&self) -> usize {
        self.success + self.failed + self.skipped + self.incomplete
    }
}

/// Output paths taken during this run. The first claimer owns a name.
#[derive(Debug, Default)]
pub struct OutputClaims(Mutex<HashSet<PathBuf>>);

impl OutputClaims {
    pub fn claim(&self, path: &Path) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_path_buf())
    }
}

/// Match, skip-check and remux a single manifest.
pub fn process_manifest(
    manifest: &Path,
    config: &BatchConfig,
    remuxer: &dyn Remuxer,
    claims: &OutputClaims,
) -> MergeOutcome {
    match try_process_manifest(manifest, config, remuxer, claims) {
        Ok(outcome) => outcome,
        Err(err) => MergeOutcome::Failure {
            reason: err.to_string(),
        },
    }
}

fn try_process_manifest(
    manifest: &Path,
    config: &BatchConfig,
    remuxer: &dyn Remuxer,
    claims: &OutputClaims,
) -> Result<MergeOutcome, ItemError> {
    let unit = matcher::match_manifest(manifest)?;
    let output = config.output_path(&unit.title.file_stem());

    let Some(pair) = unit.stream_pair() else {
        return Ok(MergeOutcome::Incomplete {
            missing: unit.missing_streams(),
        });
    };

    if !claims.claim(&output) {
        debug!(output = %output.display(), "output already claimed in this run");
        return Ok(MergeOutcome::Skipped { existing: output });
    }
    if output.exists() {
        return Ok(MergeOutcome::Skipped { existing: output });
    }

    let job = RemuxJob {
        video: pair.video,
        audio: pair.audio,
        output,
    };
    debug!(
        title = %unit.title,
        video = %job.video.display(),
        audio = %job.audio.display(),
        "remuxing"
    );

    let report = remuxer.remux(&job);
    // Anything at the claimed path after a failure is a partial write from this run.
    if !report.success() && job.output.exists() {
        if let Err(err) = std::fs::remove_file(&job.output) {
            warn!(output = %job.output.display(), error = %err, "could not remove partial output");
        }
    }
    report.into_result(remuxer.binary())?;
    Ok(MergeOutcome::Success { output: job.output })
}

/// Drive every manifest under `root` through `process_manifest` on a pool of
/// `config.workers` threads and reduce the reports into a summary.
pub fn run_batch(
    root: &Path,
    config: &BatchConfig,
    remuxer: &dyn Remuxer,
    events: &dyn BatchEvents,
) -> BatchSummary {
    let workers = config.workers.max(1);
    let claims = OutputClaims::default();
    let (job_tx, job_rx) = bounded::<PathBuf>(workers * 2);
    let (report_tx, report_rx) = unbounded::<ItemReport>();

    info!(
        root = %root.display(),
        output = %config.output_dir.display(),
        workers,
        "starting batch"
    );

    let mut summary = thread::scope(|s| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let report_tx = report_tx.clone();
            let claims = &claims;
            s.spawn(move || {
                for manifest in job_rx.iter() {
                    events.started(worker, &manifest);
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        process_manifest(&manifest, config, remuxer, claims)
                    }))
                    .unwrap_or_else(|_| MergeOutcome::Failure {
                        reason: ItemError::Panicked(manifest.clone()).to_string(),
                    });
                    log_outcome(&manifest, &outcome);
                    let report = ItemReport { manifest, outcome };
                    events.finished(worker, &report);
                    if report_tx.send(report).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(report_tx);

        let feeder = s.spawn(move || {
            let mut discovered = 0usize;
            for manifest in matcher::discover_manifests(root) {
                discovered += 1;
                events.discovered(&manifest);
                if job_tx.send(manifest).is_err() {
                    break;
                }
            }
            discovered
        });

        let mut summary = report_rx
            .iter()
            .fold(BatchSummary::default(), |mut acc, report| {
                acc.record(&report);
                acc
            });
        summary.discovered = feeder.join().unwrap_or(summary.processed());
        summary
    });

    summary.failures.sort();
    summary
}

fn log_outcome(manifest: &Path, outcome: &MergeOutcome) {
    match outcome {
        MergeOutcome::Success { output } => {
            debug!(output = %output.display(), "merged");
        }
        MergeOutcome::Skipped { existing } => {
            debug!(existing = %existing.display(), "skipped, output exists");
        }
        MergeOutcome::Incomplete { missing } => {
            debug!(manifest = %manifest.display(), missing = ?missing, "incomplete cache unit");
        }
        MergeOutcome::Failure { reason } => {
            debug!(manifest = %manifest.display(), %reason, "merge failed");
        }
    }
}
