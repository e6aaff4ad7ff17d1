//! Asynchronous analysis runs.
//!
//! A run walks every sample through `ReadingInput -> Classifying ->
//! Reconciling -> GeneratingReport` on a dedicated worker thread. Callers poll
//! [`AnalysisPipeline::status`] (atomics only) or subscribe to
//! [`AnalysisPipeline::events`], and collect the result with
//! [`AnalysisPipeline::wait`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::classify::{classify_batch, ClassificationCounts};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, FileReadError, IndexLoadError, RunWarning};
use crate::estimate;
use crate::index::ClassificationIndex;
use crate::reader::{estimate_memory, Reservoir, SequenceReader};
use crate::refdb::ReferenceDatabase;
use crate::report::Report;
use crate::sample::Sample;
use crate::types::{Read, Verdict};
use crate::verdict::{self, SampleQuality};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    LoadingIndex = 1,
    ReadingInput = 2,
    Classifying = 3,
    Reconciling = 4,
    GeneratingReport = 5,
    Done = 6,
    Error = 7,
}

impl PipelineState {
    const ALL: [PipelineState; 8] = [
        PipelineState::Idle,
        PipelineState::LoadingIndex,
        PipelineState::ReadingInput,
        PipelineState::Classifying,
        PipelineState::Reconciling,
        PipelineState::GeneratingReport,
        PipelineState::Done,
        PipelineState::Error,
    ];

    fn from_u8(v: u8) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(PipelineState::Error)
    }

    pub fn label(self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::LoadingIndex => "Loading reference index",
            PipelineState::ReadingInput => "Reading input files",
            PipelineState::Classifying => "Classifying reads",
            PipelineState::Reconciling => "Reconciling abundances",
            PipelineState::GeneratingReport => "Generating report",
            PipelineState::Done => "Done",
            PipelineState::Error => "Error",
        }
    }

    /// Coarse progress shown while a sample is in this state.
    pub fn progress_percent(self) -> u8 {
        match self {
            PipelineState::Idle | PipelineState::Error => 0,
            PipelineState::LoadingIndex => 10,
            PipelineState::ReadingInput => 25,
            PipelineState::Classifying => 50,
            PipelineState::Reconciling => 75,
            PipelineState::GeneratingReport => 90,
            PipelineState::Done => 100,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal pipeline transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// Fields written by the worker and read by any thread.
#[derive(Debug, Default)]
struct Progress {
    state: AtomicU8,
    sample_index: AtomicUsize,
    sample_count: AtomicUsize,
    reads_processed: AtomicU64,
    cancel: AtomicBool,
}

impl Progress {
    fn reset(&self, sample_count: usize) {
        self.state.store(PipelineState::Idle as u8, Ordering::Release);
        self.sample_index.store(0, Ordering::Relaxed);
        self.sample_count.store(sample_count, Ordering::Relaxed);
        self.reads_processed.store(0, Ordering::Relaxed);
        self.cancel.store(false, Ordering::Release);
    }
}

const ACTIVE: [PipelineState; 6] = [
    PipelineState::Idle,
    PipelineState::LoadingIndex,
    PipelineState::ReadingInput,
    PipelineState::Classifying,
    PipelineState::Reconciling,
    PipelineState::GeneratingReport,
];

/// Pipeline state with the legal transitions as named methods. Every change
/// is published to the shared progress block.
#[derive(Debug)]
pub struct StateMachine {
    state: PipelineState,
    progress: Arc<Progress>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::attached(Arc::new(Progress::default()))
    }

    fn attached(progress: Arc<Progress>) -> Self {
        Self {
            state: PipelineState::from_u8(progress.state.load(Ordering::Acquire)),
            progress,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn go(&mut self, from: &[PipelineState], to: PipelineState) -> Result<PipelineState, IllegalTransition> {
        if !from.contains(&self.state) {
            return Err(IllegalTransition { from: self.state, to });
        }
        log::debug!("Pipeline {:?} -> {:?}", self.state, to);
        self.state = to;
        self.progress.state.store(to as u8, Ordering::Release);
        Ok(to)
    }

    pub fn begin_run(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(&[PipelineState::Idle], PipelineState::LoadingIndex)
    }

    /// Also legal from `ReadingInput`/`Classifying` when the previous sample
    /// was abandoned after a read failure.
    pub fn begin_sample(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(
            &[
                PipelineState::LoadingIndex,
                PipelineState::GeneratingReport,
                PipelineState::ReadingInput,
                PipelineState::Classifying,
            ],
            PipelineState::ReadingInput,
        )
    }

    pub fn begin_classifying(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(&[PipelineState::ReadingInput], PipelineState::Classifying)
    }

    pub fn begin_reconciling(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(&[PipelineState::Classifying], PipelineState::Reconciling)
    }

    pub fn begin_report(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(&[PipelineState::Reconciling], PipelineState::GeneratingReport)
    }

    pub fn finish(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(
            &[
                PipelineState::GeneratingReport,
                PipelineState::ReadingInput,
                PipelineState::Classifying,
            ],
            PipelineState::Done,
        )
    }

    pub fn fail(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(&ACTIVE, PipelineState::Error)
    }

    pub fn cancel(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(&ACTIVE, PipelineState::Idle)
    }

    pub fn reset(&mut self) -> Result<PipelineState, IllegalTransition> {
        self.go(
            &[PipelineState::Idle, PipelineState::Done, PipelineState::Error],
            PipelineState::Idle,
        )
    }
}

// ---------------------------------------------------------------------------
//  Public run types
// ---------------------------------------------------------------------------

/// Inputs of one run.
#[derive(Debug, Clone)]
pub struct AnalysisContext {
    pub samples: Vec<Sample>,
    pub index_path: PathBuf,
    pub config: AnalysisConfig,
}

impl AnalysisContext {
    pub fn new(samples: Vec<Sample>, index_path: impl Into<PathBuf>) -> Self {
        Self {
            samples,
            index_path: index_path.into(),
            config: AnalysisConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: PipelineState,
    pub sample_index: usize,
    pub sample_count: usize,
    /// Reads pulled from input for the current sample.
    pub reads_processed: u64,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StateChanged(PipelineState),
    SampleStarted { index: usize, name: String },
    ReadsProcessed { index: usize, reads: u64 },
    SampleFinished { index: usize, name: String, verdict: Verdict },
    SampleFailed { index: usize, message: String },
    Warning(RunWarning),
    Finished { reports: usize, cancelled: bool, failed: bool },
}

/// Everything a finished run produced. Reports completed before an error or
/// a cancellation are kept.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub reports: Vec<Report>,
    pub error: Option<AnalysisError>,
    /// Samples skipped with `continue_on_file_error`.
    pub failures: Vec<FileReadError>,
    pub warnings: Vec<RunWarning>,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// Database and index as loaded from one index file, shared by all runs.
#[derive(Debug)]
pub struct LoadedIndex {
    pub database: ReferenceDatabase,
    pub index: ClassificationIndex,
}

type IndexCache = Arc<Mutex<Option<(PathBuf, Arc<LoadedIndex>)>>>;

// ---------------------------------------------------------------------------
//  Pipeline handle
// ---------------------------------------------------------------------------

/// Runs analyses one at a time on a background thread.
pub struct AnalysisPipeline {
    progress: Arc<Progress>,
    index_cache: IndexCache,
    worker: Mutex<Option<JoinHandle<RunOutcome>>>,
    events: Mutex<Receiver<ProgressEvent>>,
}

impl Default for AnalysisPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisPipeline {
    pub fn new() -> Self {
        let (_tx, rx) = unbounded();
        Self {
            progress: Arc::new(Progress::default()),
            index_cache: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
            events: Mutex::new(rx),
        }
    }

    /// Starts a run and returns immediately.
    pub fn start(&self, context: AnalysisContext) -> Result<(), AnalysisError> {
        context.config.validate()?;
        if context.samples.is_empty() {
            return Err(AnalysisError::NoSamples);
        }

        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(AnalysisError::AlreadyRunning);
        }
        if worker.take().is_some() {
            log::debug!("Discarding outcome of a previous run that was never collected");
        }

        self.progress.reset(context.samples.len());
        let (tx, rx) = unbounded();
        *self.events.lock() = rx;

        log::info!(
            "Starting analysis of {} sample(s) with index {}",
            context.samples.len(),
            context.index_path.display()
        );
        let job = Worker::new(
            context,
            Arc::clone(&self.progress),
            Arc::clone(&self.index_cache),
            tx,
        );
        let handle = thread::Builder::new()
            .name("halalseq-analysis".into())
            .spawn(move || job.run())
            .map_err(|e| AnalysisError::Worker(e.to_string()))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Requests cooperative cancellation. Checked between reads and between
    /// samples; the run then returns to `Idle`.
    pub fn cancel(&self) {
        log::info!("Cancellation requested");
        self.progress.cancel.store(true, Ordering::Release);
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: PipelineState::from_u8(self.progress.state.load(Ordering::Acquire)),
            sample_index: self.progress.sample_index.load(Ordering::Relaxed),
            sample_count: self.progress.sample_count.load(Ordering::Relaxed),
            reads_processed: self.progress.reads_processed.load(Ordering::Relaxed),
        }
    }

    /// Event stream of the current (or most recent) run. Receivers are
    /// clones of one channel, so each event goes to a single subscriber.
    pub fn events(&self) -> Receiver<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Blocks until the current run ends and returns its outcome. Without a
    /// run to collect, returns an empty outcome.
    pub fn wait(&self) -> RunOutcome {
        let handle = self.worker.lock().take();
        match handle {
            None => RunOutcome::default(),
            Some(h) => h.join().unwrap_or_else(|_| {
                self.progress
                    .state
                    .store(PipelineState::Error as u8, Ordering::Release);
                RunOutcome {
                    error: Some(AnalysisError::Worker("analysis thread panicked".into())),
                    ..RunOutcome::default()
                }
            }),
        }
    }
}

// ---------------------------------------------------------------------------
//  Worker
// ---------------------------------------------------------------------------

enum Stop {
    Cancelled,
    Failed(AnalysisError),
}

impl From<IllegalTransition> for Stop {
    fn from(e: IllegalTransition) -> Self {
        Stop::Failed(AnalysisError::Worker(e.to_string()))
    }
}

enum SampleStop {
    Read(FileReadError),
    Run(Stop),
}

impl From<FileReadError> for SampleStop {
    fn from(e: FileReadError) -> Self {
        SampleStop::Read(e)
    }
}

impl From<Stop> for SampleStop {
    fn from(s: Stop) -> Self {
        SampleStop::Run(s)
    }
}

impl From<IllegalTransition> for SampleStop {
    fn from(e: IllegalTransition) -> Self {
        SampleStop::Run(e.into())
    }
}

type Transition = fn(&mut StateMachine) -> Result<PipelineState, IllegalTransition>;

struct Worker {
    ctx: AnalysisContext,
    progress: Arc<Progress>,
    cache: IndexCache,
    events: Sender<ProgressEvent>,
    machine: StateMachine,
    outcome: RunOutcome,
}

impl Worker {
    fn new(ctx: AnalysisContext, progress: Arc<Progress>, cache: IndexCache, events: Sender<ProgressEvent>) -> Self {
        let machine = StateMachine::attached(Arc::clone(&progress));
        Self {
            ctx,
            progress,
            cache,
            events,
            machine,
            outcome: RunOutcome::default(),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn transition(&mut self, t: Transition) -> Result<(), IllegalTransition> {
        let state = t(&mut self.machine)?;
        self.emit(ProgressEvent::StateChanged(state));
        Ok(())
    }

    /// Final transition of a run. Nothing is left to unwind if it is refused.
    fn settle(&mut self, t: Transition) -> bool {
        match self.transition(t) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Run ended without reaching its final state: {}", e);
                false
            }
        }
    }

    fn warn(&mut self, warning: RunWarning) {
        log::warn!("{}", warning);
        self.emit(ProgressEvent::Warning(warning.clone()));
        self.outcome.warnings.push(warning);
    }

    fn check_cancel(&self) -> Result<(), Stop> {
        if self.progress.cancel.load(Ordering::Acquire) {
            Err(Stop::Cancelled)
        } else {
            Ok(())
        }
    }

    fn count_read(&self, sample_index: usize) {
        let n = self.progress.reads_processed.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.ctx.config.batch_size as u64 == 0 {
            self.emit(ProgressEvent::ReadsProcessed {
                index: sample_index,
                reads: n,
            });
        }
    }

    fn run(mut self) -> RunOutcome {
        match self.run_samples() {
            Ok(()) => {
                self.settle(StateMachine::finish);
                log::info!("Analysis finished: {} report(s)", self.outcome.reports.len());
            }
            Err(Stop::Cancelled) => {
                self.outcome.cancelled = true;
                self.settle(StateMachine::cancel);
                log::info!(
                    "Analysis cancelled after {} report(s)",
                    self.outcome.reports.len()
                );
            }
            Err(Stop::Failed(e)) => {
                log::error!("Analysis failed: {}", e);
                self.settle(StateMachine::fail);
                self.outcome.error = Some(e);
            }
        }
        self.emit(ProgressEvent::Finished {
            reports: self.outcome.reports.len(),
            cancelled: self.outcome.cancelled,
            failed: self.outcome.error.is_some(),
        });
        self.outcome
    }

    fn load_index(&self) -> Result<Arc<LoadedIndex>, IndexLoadError> {
        let mut cache = self.cache.lock();
        if let Some((path, loaded)) = cache.as_ref() {
            if *path == self.ctx.index_path {
                log::debug!("Reusing loaded index {}", path.display());
                return Ok(Arc::clone(loaded));
            }
        }
        let (database, index) = crate::index::load_index(&self.ctx.index_path)?;
        let loaded = Arc::new(LoadedIndex { database, index });
        *cache = Some((self.ctx.index_path.clone(), Arc::clone(&loaded)));
        Ok(loaded)
    }

    fn run_samples(&mut self) -> Result<(), Stop> {
        self.transition(StateMachine::begin_run)?;
        let loaded = self
            .load_index()
            .map_err(|e| Stop::Failed(AnalysisError::IndexLoad(e)))?;

        for i in 0..self.ctx.samples.len() {
            self.check_cancel()?;
            let sample = self.ctx.samples[i].clone();
            self.progress.sample_index.store(i, Ordering::Relaxed);
            self.progress.reads_processed.store(0, Ordering::Relaxed);
            self.transition(StateMachine::begin_sample)?;
            self.emit(ProgressEvent::SampleStarted {
                index: i,
                name: sample.name.clone(),
            });

            match self.process_sample(i, &sample, &loaded) {
                Ok(report) => {
                    self.emit(ProgressEvent::SampleFinished {
                        index: i,
                        name: sample.name.clone(),
                        verdict: report.verdict,
                    });
                    self.outcome.reports.push(report);
                }
                Err(SampleStop::Read(e)) => {
                    self.emit(ProgressEvent::SampleFailed {
                        index: i,
                        message: e.to_string(),
                    });
                    if !self.ctx.config.continue_on_file_error {
                        return Err(Stop::Failed(AnalysisError::FileRead(e)));
                    }
                    log::warn!("Skipping sample: {}", e);
                    self.outcome.failures.push(e);
                }
                Err(SampleStop::Run(stop)) => return Err(stop),
            }
        }
        Ok(())
    }

    fn classify_all(&self, reads: &[Read], index: &ClassificationIndex, counts: ClassificationCounts) -> ClassificationCounts {
        let threshold = self.ctx.config.acceptance_threshold;
        reads
            .chunks(self.ctx.config.batch_size)
            .fold(counts, |acc, batch| acc.merge(classify_batch(batch, index, threshold)))
    }

    fn process_sample(&mut self, i: usize, sample: &Sample, loaded: &LoadedIndex) -> Result<Report, SampleStop> {
        let config = self.ctx.config.clone();
        let index = &loaded.index;

        let mem = estimate_memory(sample)?;
        log::info!(
            "Sample '{}': {} bytes, ~{} reads, ~{} MB",
            sample.name,
            mem.file_bytes,
            mem.estimated_reads,
            mem.estimated_ram_mb
        );
        if !config.subsample {
            if let Some(w) = mem.check_budget(sample, config.ram_budget_mb) {
                self.warn(w.into());
            }
        }

        let mut reader = SequenceReader::open(sample)?;
        self.transition(StateMachine::begin_classifying)?;
        let mut counts = ClassificationCounts::new(index.species_count(), index.marker_count());

        let (subsampled, reads_seen) = if config.subsample {
            let mut reservoir = Reservoir::new(config.subsample_cap, config.sample_seed(i, 0));
            for read in reader.by_ref() {
                self.check_cancel()?;
                reservoir.offer(read?);
                self.count_read(i);
            }
            let (overflowed, seen) = (reservoir.overflowed(), reservoir.seen());
            if overflowed {
                log::info!(
                    "Sample '{}': kept {} of {} reads",
                    sample.name,
                    reservoir.len(),
                    seen
                );
            }
            let kept = reservoir.into_items();
            counts = self.classify_all(&kept, index, counts);
            (overflowed, seen)
        } else {
            let mut batch = Vec::with_capacity(config.batch_size.min(1 << 16));
            for read in reader.by_ref() {
                self.check_cancel()?;
                batch.push(read?);
                self.count_read(i);
                if batch.len() >= config.batch_size {
                    counts = self.classify_all(&batch, index, counts);
                    batch.clear();
                }
            }
            counts = self.classify_all(&batch, index, counts);
            (false, reader.emitted())
        };

        self.transition(StateMachine::begin_reconciling)?;
        let est = estimate::estimate(
            &sample.name,
            &counts,
            &loaded.database,
            &config.estimator,
            config.sample_seed(i, 1),
        );
        if let Some(w) = est.warning.clone() {
            self.warn(w.into());
        }

        self.transition(StateMachine::begin_report)?;
        let quality = SampleQuality {
            classified_reads: est.classified_reads,
            unmatched_pct: est.unmatched_pct,
            cross_marker_agreement: est.cross_marker_agreement,
            converged: est.converged,
        };
        let decision = verdict::decide(&est.species, &quality, &config.verdict);
        let report = Report::new(sample.name.clone(), est, decision, subsampled, reads_seen);
        log::info!(
            "Sample '{}': {} ({} of {} reads classified)",
            sample.name,
            report.verdict,
            report.classified_reads,
            report.total_reads
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileReadErrorKind;
    use crate::test_fixtures::{fixture_reads, noise_reads, write_fastq, write_fixture_index};
    use std::fs;
    use std::path::Path;

    fn quick_config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.estimator.bootstrap_draws = 50;
        config
    }

    fn cow_sample(dir: &Path, name: &str) -> Sample {
        let path = dir.join(format!("{}.fastq", name));
        let mut reads = fixture_reads(0, 0, 20);
        reads.extend(fixture_reads(0, 1, 20));
        write_fastq(&path, &reads);
        Sample::single(name, path)
    }

    #[test]
    fn test_state_machine_walk() {
        let mut m = StateMachine::new();
        assert_eq!(m.state(), PipelineState::Idle);
        m.begin_run().unwrap();
        m.begin_sample().unwrap();
        m.begin_classifying().unwrap();
        m.begin_reconciling().unwrap();
        m.begin_report().unwrap();
        m.begin_sample().unwrap();
        m.begin_classifying().unwrap();
        m.begin_reconciling().unwrap();
        m.begin_report().unwrap();
        assert_eq!(m.finish().unwrap(), PipelineState::Done);
        assert!(m.state().is_terminal());
        assert_eq!(m.reset().unwrap(), PipelineState::Idle);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut m = StateMachine::new();
        assert_eq!(
            m.begin_classifying(),
            Err(IllegalTransition {
                from: PipelineState::Idle,
                to: PipelineState::Classifying
            })
        );
        m.begin_run().unwrap();
        assert!(m.begin_reconciling().is_err());
        assert!(m.finish().is_err());
        m.fail().unwrap();
        assert!(m.cancel().is_err());
        assert!(m.begin_sample().is_err());
        assert_eq!(m.state(), PipelineState::Error);

        let mut m = StateMachine::new();
        m.begin_run().unwrap();
        m.begin_sample().unwrap();
        assert_eq!(m.cancel().unwrap(), PipelineState::Idle);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(PipelineState::Classifying.progress_percent(), 50);
        assert_eq!(PipelineState::from_u8(4), PipelineState::Reconciling);
        assert_eq!(PipelineState::from_u8(200), PipelineState::Error);
        assert_eq!(PipelineState::Done.label(), "Done");
    }

    #[test]
    fn test_start_rejects_bad_input() {
        let pipeline = AnalysisPipeline::new();
        let ctx = AnalysisContext::new(Vec::new(), "x.idx");
        assert!(matches!(pipeline.start(ctx), Err(AnalysisError::NoSamples)));

        let mut config = AnalysisConfig::default();
        config.batch_size = 0;
        let ctx = AnalysisContext::new(vec![Sample::single("a", "a.fq")], "x.idx").with_config(config);
        assert!(matches!(pipeline.start(ctx), Err(AnalysisError::Config(_))));
        assert_eq!(pipeline.wait().reports.len(), 0);
    }

    #[test]
    fn test_missing_index_fails_before_samples() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = AnalysisPipeline::new();
        let ctx = AnalysisContext::new(vec![cow_sample(dir.path(), "a")], dir.path().join("none.idx"))
            .with_config(quick_config());
        pipeline.start(ctx).unwrap();
        let outcome = pipeline.wait();
        assert!(matches!(outcome.error, Some(AnalysisError::IndexLoad(IndexLoadError::Missing(_)))));
        assert!(outcome.reports.is_empty());
        assert_eq!(pipeline.status().state, PipelineState::Error);
    }

    #[test]
    fn test_file_error_stops_run_but_keeps_reports() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let samples = vec![
            cow_sample(dir.path(), "first"),
            Sample::single("gone", dir.path().join("gone.fastq")),
            cow_sample(dir.path(), "third"),
        ];

        let pipeline = AnalysisPipeline::new();
        let events = {
            pipeline
                .start(AnalysisContext::new(samples.clone(), &index).with_config(quick_config()))
                .unwrap();
            pipeline.events()
        };
        let outcome = pipeline.wait();
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].sample, "first");
        match &outcome.error {
            Some(AnalysisError::FileRead(e)) => {
                assert_eq!(e.sample, "gone");
                assert!(matches!(e.kind, FileReadErrorKind::Open(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Error);
        assert_eq!(status.sample_index, 1);
        let events: Vec<ProgressEvent> = events.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, ProgressEvent::SampleFailed { index: 1, .. })));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Finished { reports: 1, failed: true, .. })
        ));

        let mut config = quick_config();
        config.continue_on_file_error = true;
        pipeline
            .start(AnalysisContext::new(samples, &index).with_config(config))
            .unwrap();
        let outcome = pipeline.wait();
        assert!(outcome.is_complete());
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(pipeline.status().state, PipelineState::Done);
    }

    #[test]
    fn test_subsampling_caps_reads() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let path = dir.path().join("big.fastq");
        let mut reads = fixture_reads(2, 0, 30);
        reads.extend(noise_reads(10));
        write_fastq(&path, &reads);

        let mut config = quick_config();
        config.subsample = true;
        config.subsample_cap = 12;
        config.batch_size = 5;
        let pipeline = AnalysisPipeline::new();
        pipeline
            .start(AnalysisContext::new(vec![Sample::single("big", path)], &index).with_config(config))
            .unwrap();
        let outcome = pipeline.wait();
        let report = &outcome.reports[0];
        assert!(report.subsampled);
        assert_eq!(report.total_reads, 12);
        assert_eq!(report.reads_seen, 40);
        assert_eq!(pipeline.status().reads_processed, 40);
    }

    #[test]
    fn test_memory_warning_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let mut config = quick_config();
        config.ram_budget_mb = 1;
        let pipeline = AnalysisPipeline::new();
        pipeline
            .start(AnalysisContext::new(vec![cow_sample(dir.path(), "m")], &index).with_config(config))
            .unwrap();
        let outcome = pipeline.wait();
        assert_eq!(outcome.reports.len(), 1);
        assert!(matches!(outcome.warnings[0], RunWarning::MemoryBudget(_)));
    }

    #[test]
    fn test_index_is_cached_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let samples = vec![cow_sample(dir.path(), "c")];
        let pipeline = AnalysisPipeline::new();

        pipeline
            .start(AnalysisContext::new(samples.clone(), &index).with_config(quick_config()))
            .unwrap();
        assert!(pipeline.wait().is_complete());

        fs::remove_file(&index).unwrap();
        pipeline
            .start(AnalysisContext::new(samples, &index).with_config(quick_config()))
            .unwrap();
        let outcome = pipeline.wait();
        assert!(outcome.is_complete());
        assert_eq!(outcome.reports[0].verdict, Verdict::Pass);
    }

    #[test]
    fn test_cancelled_run_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let ctx = AnalysisContext::new(vec![cow_sample(dir.path(), "c")], &index)
            .with_config(quick_config());

        let progress = Arc::new(Progress::default());
        progress.reset(1);
        progress.cancel.store(true, Ordering::Release);
        let (tx, rx) = unbounded();
        let outcome = Worker::new(ctx, Arc::clone(&progress), Arc::new(Mutex::new(None)), tx).run();

        assert!(outcome.cancelled);
        assert!(outcome.reports.is_empty());
        assert!(outcome.error.is_none());
        assert_eq!(
            PipelineState::from_u8(progress.state.load(Ordering::Acquire)),
            PipelineState::Idle
        );
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, ProgressEvent::Finished { cancelled: true, .. })));
    }

    #[test]
    fn test_cancel_mid_sample_keeps_finished_reports() {
        let dir = tempfile::tempdir().unwrap();
        let index = write_fixture_index(dir.path());
        let big = dir.path().join("second.fastq");
        let reads: Vec<Read> = fixture_reads(1, 0, 100).into_iter().cycle().take(100_000).collect();
        write_fastq(&big, &reads);
        let samples = vec![cow_sample(dir.path(), "first"), Sample::single("second", &big)];

        let pipeline = AnalysisPipeline::new();
        pipeline
            .start(AnalysisContext::new(samples, &index).with_config(quick_config()))
            .unwrap();
        let events = pipeline.events();
        for event in events.iter() {
            if matches!(event, ProgressEvent::SampleFinished { index: 0, .. }) {
                pipeline.cancel();
                break;
            }
        }
        let outcome = pipeline.wait();

        assert!(outcome.cancelled);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].sample, "first");
        let status = pipeline.status();
        assert_eq!(status.state, PipelineState::Idle);
        assert!(status.reads_processed < 100_000);
    }

    #[test]
    fn test_refused_final_transition_is_reported() {
        let ctx = AnalysisContext::new(vec![Sample::single("a", "a.fq")], "x.idx");
        let progress = Arc::new(Progress::default());
        let (tx, rx) = unbounded();
        let mut worker = Worker::new(ctx, Arc::clone(&progress), Arc::new(Mutex::new(None)), tx);

        assert!(!worker.settle(StateMachine::finish));
        assert_eq!(worker.machine.state(), PipelineState::Idle);
        assert!(rx.try_iter().next().is_none());
        worker.transition(StateMachine::begin_run).unwrap();
        assert!(worker.settle(StateMachine::fail));
        assert_eq!(
            PipelineState::from_u8(progress.state.load(Ordering::Acquire)),
            PipelineState::Error
        );
    }
}
