use crate::batch::{BatchEvents, ItemReport, MergeOutcome};

use clap::ValueEnum;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    pub idle_threshold: Duration,
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            idle_threshold: Duration::from_secs(120),
            plain_interval: Duration::from_secs(5),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        self.mode.resolve(
            self.tty_override
                .unwrap_or_else(|| std::io::stderr().is_terminal()),
        )
    }
}

impl ProgressMode {
    fn resolve(self, stderr_is_tty: bool) -> ResolvedProgressMode {
        match self {
            ProgressMode::Auto => {
                if stderr_is_tty {
                    ResolvedProgressMode::Rich
                } else {
                    ResolvedProgressMode::Plain
                }
            }
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub total_items: u64,
    pub tally: OutcomeTally,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// Running count of finished items by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub merged: u64,
    pub skipped: u64,
    pub incomplete: u64,
    pub failed: u64,
}

impl OutcomeTally {
    fn record(&mut self, outcome: &MergeOutcome) {
        match outcome {
            MergeOutcome::Success { .. } => self.merged += 1,
            MergeOutcome::Skipped { .. } => self.skipped += 1,
            MergeOutcome::Incomplete { .. } => self.incomplete += 1,
            MergeOutcome::Failure { .. } => self.failed += 1,
        }
    }

    pub fn finished(&self) -> u64 {
        self.merged + self.skipped + self.incomplete + self.failed
    }
}

impl std::fmt::Display for OutcomeTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "merged={} skipped={} incomplete={} failed={}",
            self.merged, self.skipped, self.incomplete, self.failed
        )
    }
}

#[derive(Debug, Clone)]
struct ProgressSnapshot {
    stage: String,
    total_items: u64,
    tally: OutcomeTally,
    elapsed: Duration,
    active_units: Vec<String>,
}

/// Cloneable sink for batch events; safe to share across workers.
#[derive(Clone)]
pub struct ProgressHandle {
    inner: Arc<ProgressInner>,
}

pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

struct ProgressInner {
    label: String,
    mode: ResolvedProgressMode,
    idle_threshold: Duration,
    plain_interval: Duration,
    state: Mutex<ProgressState>,
    rich: Option<RichUi>,
    stop: AtomicBool,
    finalized: AtomicBool,
}

struct RichUi {
    multi: MultiProgress,
    overall: ProgressBar,
    stage: ProgressBar,
    ops: Mutex<HashMap<String, ProgressBar>>,
}

#[derive(Debug)]
struct ProgressState {
    started: Instant,
    stage: String,
    total_items: u64,
    tally: OutcomeTally,
    last_progress: Instant,
    last_plain_emit: Instant,
    last_idle_warn: Option<Instant>,
    operations: HashMap<String, String>,
    warnings: Vec<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let now = Instant::now();

        let rich = if mode == ResolvedProgressMode::Rich {
            Some(RichUi::new(&label))
        } else {
            None
        };

        let inner = Arc::new(ProgressInner {
            label,
            mode,
            idle_threshold: config.idle_threshold,
            plain_interval: config.plain_interval,
            state: Mutex::new(ProgressState {
                started: now,
                stage: "initializing".to_string(),
                total_items: 0,
                tally: OutcomeTally::default(),
                last_progress: now,
                last_plain_emit: now.checked_sub(config.plain_interval).unwrap_or(now),
                last_idle_warn: None,
                operations: HashMap::new(),
                warnings: Vec::new(),
            }),
            rich,
            stop: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        });

        let ticker_inner = Arc::clone(&inner);
        let ticker = thread::spawn(move || {
            while !ticker_inner.stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(250));
                ticker_inner.tick_once();
            }
        });

        let handle = ProgressHandle { inner };
        handle.set_stage("starting");
        Self {
            handle,
            ticker: Some(ticker),
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.shutdown_ticker();
        self.handle.inner.finalize(Some(final_message.into()))
    }

    fn shutdown_ticker(&mut self) {
        self.handle.inner.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown_ticker();
        let _ = self.handle.inner.finalize(None);
    }
}

impl ProgressHandle {
    pub fn add_total(&self, delta: u64) {
        let snapshot = {
            let mut state = lock(&self.inner.state);
            state.total_items = state.total_items.saturating_add(delta);
            snapshot_locked(&state)
        };
        self.inner.render_snapshot(&snapshot, false);
    }

    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        let snapshot = {
            let mut state = lock(&self.inner.state);
            state.stage = stage;
            snapshot_locked(&state)
        };
        self.inner.render_snapshot(&snapshot, true);
    }

    pub fn record_outcome(&self, outcome: &MergeOutcome) {
        let snapshot = {
            let mut state = lock(&self.inner.state);
            state.tally.record(outcome);
            state.last_progress = Instant::now();
            snapshot_locked(&state)
        };
        self.inner.render_snapshot(&snapshot, false);
    }

    pub fn set_operation_status(&self, operation_id: impl Into<String>, status: impl Into<String>) {
        let op_id = operation_id.into();
        let status = status.into();

        let snapshot = {
            let mut state = lock(&self.inner.state);
            state.operations.insert(op_id.clone(), status.clone());
            snapshot_locked(&state)
        };

        if let Some(rich) = &self.inner.rich {
            rich.set_operation(&op_id, &status);
        }
        self.inner.render_snapshot(&snapshot, false);
    }

    pub fn clear_operation(&self, operation_id: &str) {
        let snapshot = {
            let mut state = lock(&self.inner.state);
            state.operations.remove(operation_id);
            snapshot_locked(&state)
        };

        if let Some(rich) = &self.inner.rich {
            rich.clear_operation(operation_id);
        }
        self.inner.render_snapshot(&snapshot, false);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.inner.emit_message("INFO", &message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        push_warning_locked(&mut lock(&self.inner.state), &message);
        self.inner.emit_message("WARN", &message);
    }
}

impl BatchEvents for ProgressHandle {
    fn discovered(&self, manifest: &std::path::Path) {
        tracing::trace!(manifest = %manifest.display(), "manifest discovered");
        self.add_total(1);
    }

    fn started(&self, worker: usize, manifest: &std::path::Path) {
        let unit = manifest
            .parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        self.set_operation_status(format!("w{:02}", worker), unit);
    }

    fn finished(&self, worker: usize, report: &ItemReport) {
        self.clear_operation(&format!("w{:02}", worker));
        match &report.outcome {
            MergeOutcome::Success { output } => {
                self.log(format!("merged {}", output.display()));
            }
            MergeOutcome::Skipped { existing } => {
                self.log(format!("skipped, already exists: {}", existing.display()));
            }
            MergeOutcome::Incomplete { missing } => {
                self.log(format!(
                    "incomplete unit {} (missing {})",
                    report.manifest.display(),
                    missing.join(", ")
                ));
            }
            MergeOutcome::Failure { reason } => {
                self.warn(format!("failed {}: {}", report.manifest.display(), reason));
            }
        }
        self.record_outcome(&report.outcome);
    }
}

impl ProgressInner {
    fn tick_once(&self) {
        if self.mode == ResolvedProgressMode::Quiet {
            return;
        }

        let (snapshot, plain_due, idle_warning) = {
            let mut state = lock(&self.state);
            let now = Instant::now();

            let plain_due = now.duration_since(state.last_plain_emit) >= self.plain_interval;
            if plain_due {
                state.last_plain_emit = now;
            }

            let idle_due = idle_warning_due(
                now,
                state.last_progress,
                state.last_idle_warn,
                self.idle_threshold,
                state.operations.len(),
            );
            let idle_warning = if idle_due {
                state.last_idle_warn = Some(now);
                let msg = format!(
                    "IDLE WARNING: no item finished for {}s (stage={}, active={})",
                    now.duration_since(state.last_progress).as_secs(),
                    state.stage,
                    join_or_dash(&active_units(&state.operations, 3))
                );
                push_warning_locked(&mut state, &msg);
                Some(msg)
            } else {
                None
            };

            (snapshot_locked(&state), plain_due, idle_warning)
        };

        if self.mode == ResolvedProgressMode::Rich {
            self.render_snapshot_rich(&snapshot);
        } else if plain_due {
            self.render_snapshot_plain(&snapshot);
        }

        if let Some(msg) = idle_warning {
            self.emit_message("WARN", &msg);
        }
    }

    fn render_snapshot(&self, snapshot: &ProgressSnapshot, force_plain: bool) {
        match self.mode {
            ResolvedProgressMode::Rich => self.render_snapshot_rich(snapshot),
            ResolvedProgressMode::Plain => {
                if force_plain {
                    self.render_snapshot_plain(snapshot);
                }
            }
            ResolvedProgressMode::Quiet => {}
        }
    }

    fn render_snapshot_rich(&self, snapshot: &ProgressSnapshot) {
        let Some(rich) = &self.rich else {
            return;
        };

        rich.overall.set_length(snapshot.total_items.max(1));
        rich.overall.set_position(snapshot.tally.finished());
        rich.overall.set_message(format!(
            "{} | {}",
            snapshot.tally,
            join_or_dash(&snapshot.active_units)
        ));

        rich.stage.set_message(format!(
            "{} | elapsed {}",
            snapshot.stage,
            format_duration(snapshot.elapsed)
        ));
    }

    fn render_snapshot_plain(&self, snapshot: &ProgressSnapshot) {
        eprintln!(
            "[PROGRESS] {} elapsed={} stage={} done={}/{} {} active={}",
            self.label,
            format_duration(snapshot.elapsed),
            snapshot.stage,
            snapshot.tally.finished(),
            snapshot.total_items,
            snapshot.tally,
            join_or_dash(&snapshot.active_units)
        );
    }

    fn emit_message(&self, level: &str, message: &str) {
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("[{}] {}: {}", level, self.label, message);
            }
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.stage
                        .println(format!("[{}] {}: {}", level, self.label, message));
                } else {
                    eprintln!("[{}] {}: {}", level, self.label, message);
                }
            }
        }
    }

    fn finalize(&self, final_message: Option<String>) -> ProgressOutcome {
        if self.finalized.swap(true, Ordering::Relaxed) {
            return self.current_outcome();
        }

        let outcome = self.current_outcome();
        let snapshot = snapshot_locked(&lock(&self.state));

        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                self.render_snapshot_plain(&snapshot);
                if let Some(msg) = final_message.as_deref() {
                    eprintln!("[DONE] {}: {}", self.label, msg);
                }
            }
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.overall.finish_with_message(format!(
                        "{} elapsed={}",
                        snapshot.tally,
                        format_duration(snapshot.elapsed)
                    ));
                    if let Some(msg) = final_message {
                        rich.stage.finish_with_message(msg);
                    } else {
                        rich.stage.finish_and_clear();
                    }
                    rich.clear_all_ops();
                }
            }
        }

        outcome
    }

    fn current_outcome(&self) -> ProgressOutcome {
        let state = lock(&self.state);
        ProgressOutcome {
            elapsed: state.started.elapsed(),
            total_items: state.total_items,
            tally: state.tally,
            warning_count: state.warnings.len(),
            warnings: state.warnings.clone(),
        }
    }
}

impl RichUi {
    fn new(label: &str) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(1));
        let stage = multi.add(ProgressBar::new_spinner());

        overall.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} | {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        overall.set_message(format!("{} starting", label));

        stage.set_style(
            ProgressStyle::with_template("{spinner:.yellow} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("|/-\\ "),
        );
        stage.enable_steady_tick(Duration::from_millis(120));
        stage.set_message("starting");

        Self {
            multi,
            overall,
            stage,
            ops: Mutex::new(HashMap::new()),
        }
    }

    fn set_operation(&self, op_id: &str, status: &str) {
        let mut ops = lock(&self.ops);
        let bar = ops.entry(op_id.to_string()).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::with_template("{spinner:.magenta} {prefix:.bold} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_chars("|/-\\ "),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            pb.set_prefix(op_id.to_string());
            pb
        });
        bar.set_message(status.to_string());
    }

    fn clear_operation(&self, op_id: &str) {
        if let Some(bar) = lock(&self.ops).remove(op_id) {
            bar.finish_and_clear();
        }
    }

    fn clear_all_ops(&self) {
        for (_id, bar) in lock(&self.ops).drain() {
            bar.finish_and_clear();
        }
    }
}

fn push_warning_locked(state: &mut ProgressState, message: &str) {
    if state.warnings.len() >= MAX_STORED_WARNINGS {
        state.warnings.remove(0);
    }
    state.warnings.push(message.to_string());
}

fn snapshot_locked(state: &ProgressState) -> ProgressSnapshot {
    ProgressSnapshot {
        stage: state.stage.clone(),
        total_items: state.total_items,
        tally: state.tally,
        elapsed: state.started.elapsed(),
        active_units: active_units(&state.operations, 4),
    }
}

/// Unit directory names currently being merged, sorted, at most `limit`.
fn active_units(ops: &HashMap<String, String>, limit: usize) -> Vec<String> {
    let mut units = ops.values().cloned().collect::<Vec<_>>();
    units.sort();
    units.truncate(limit);
    units
}

fn join_or_dash(values: &[String]) -> String {
    if values.is_empty() {
        "-".to_string()
    } else {
        values.join(",")
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

fn idle_warning_due(
    now: Instant,
    last_progress: Instant,
    last_idle_warn: Option<Instant>,
    idle_threshold: Duration,
    active_ops: usize,
) -> bool {
    if active_ops == 0 {
        return false;
    }
    if now.duration_since(last_progress) < idle_threshold {
        return false;
    }
    match last_idle_warn {
        Some(last_warn) => now.duration_since(last_warn) >= idle_threshold,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn mode_resolution_respects_tty_override() {
        let cfg_tty = ProgressConfig::new(ProgressMode::Auto).with_tty_override(true);
        assert_eq!(cfg_tty.resolve_mode(), ResolvedProgressMode::Rich);

        let cfg_not_tty = ProgressConfig::new(ProgressMode::Auto).with_tty_override(false);
        assert_eq!(cfg_not_tty.resolve_mode(), ResolvedProgressMode::Plain);

        let cfg_quiet = ProgressConfig::new(ProgressMode::Quiet).with_tty_override(true);
        assert_eq!(cfg_quiet.resolve_mode(), ResolvedProgressMode::Quiet);
    }

    #[test]
    fn tally_counts_each_outcome_kind() {
        let mut tally = OutcomeTally::default();
        tally.record(&MergeOutcome::Success {
            output: PathBuf::from("a.mp4"),
        });
        tally.record(&MergeOutcome::Skipped {
            existing: PathBuf::from("b.mp4"),
        });
        tally.record(&MergeOutcome::Incomplete {
            missing: vec!["audio.m4s"],
        });
        tally.record(&MergeOutcome::Failure {
            reason: "boom".into(),
        });
        assert_eq!(tally.finished(), 4);
        assert_eq!(
            tally.to_string(),
            "merged=1 skipped=1 incomplete=1 failed=1"
        );
    }

    #[test]
    fn active_units_are_sorted_and_capped() {
        let ops = HashMap::from([
            ("w02".to_string(), "c_9".to_string()),
            ("w00".to_string(), "c_1".to_string()),
            ("w01".to_string(), "c_5".to_string()),
        ]);
        assert_eq!(active_units(&ops, 2), vec!["c_1", "c_5"]);
        assert_eq!(join_or_dash(&active_units(&HashMap::new(), 3)), "-");
    }

    #[test]
    fn idle_warning_needs_active_work() {
        let now = Instant::now();
        let threshold = Duration::from_secs(30);
        assert!(idle_warning_due(now + threshold, now, None, threshold, 1));
        assert!(!idle_warning_due(now + threshold, now, None, threshold, 0));

        // If warning already emitted recently, no duplicate yet.
        assert!(!idle_warning_due(
            now + threshold,
            now,
            Some(now + Duration::from_secs(10)),
            threshold,
            1
        ));
    }

    #[test]
    fn handle_counts_events_and_keeps_failures_as_warnings() {
        let reporter = ProgressReporter::new("merge", ProgressConfig::new(ProgressMode::Quiet));
        let handle = reporter.handle();
        let manifest = PathBuf::from("/cache/a/entry.json");

        handle.discovered(&manifest);
        handle.discovered(&manifest);
        handle.started(0, &manifest);
        handle.finished(
            0,
            &ItemReport {
                manifest: manifest.clone(),
                outcome: MergeOutcome::Failure {
                    reason: "boom".into(),
                },
            },
        );

        let outcome = reporter.finish("done");
        assert_eq!(outcome.total_items, 2);
        assert_eq!(outcome.tally.failed, 1);
        assert_eq!(outcome.tally.finished(), 1);
        assert_eq!(outcome.warning_count, 1);
        assert!(outcome.warnings[0].contains("boom"));
    }
}
