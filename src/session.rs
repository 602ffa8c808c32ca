//! Capture session orchestration.
//!
//! A session repeats capture → extract → record → navigate until it is
//! stopped, then deduplicates the buffer and writes it out exactly once.
//!
//! # States
//!
//! `Init → Capturing → Extracting → Recording → Navigating → Capturing ...`
//! and, once a stop is requested or a fatal capture/navigation error occurs,
//! `Stopping → Deduping → Done`. Per-cycle extraction failures never end the
//! session; they are retried with backoff and then skipped.

use crate::capture::Capturer;
use crate::change_detector::ChangeDetector;
use crate::config::{Config, SessionPlan};
use crate::dedup::Deduplicator;
use crate::extractors::Extractor;
use crate::navigator::Navigator;
use crate::observer::FrameBus;
use crate::recorder::{raw_path_for, write_csv, Recorder};
use crate::review::{AutoApprove, ReviewDecision, Reviewer};
use crate::types::{
    CaptureError, CaptureTarget, ConfigError, ExtractionError, Frame, Record, SequenceNumber,
    SessionError, Termination,
};
use image::DynamicImage;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Cooperative stop request shared between the session and its controller
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; safe to call from any thread, including signal handlers
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once a stop has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless stopped first
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

/// Where the state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Capturing,
    Extracting,
    Recording,
    Navigating,
    Stopping,
    Deduping,
    Done,
}

/// Summary of a finished session
#[derive(Debug)]
pub struct SessionReport {
    pub cycles: u64,
    pub failed_extractions: u64,
    pub skipped_unchanged: u64,
    /// Records captured before deduplication
    pub raw_records: usize,
    pub retained_records: usize,
    pub dropped_records: usize,
    /// Rows written to `output_path`
    pub rows_written: usize,
    pub output_path: PathBuf,
    /// Raw buffer artifact (debug mode only)
    pub raw_path: Option<PathBuf>,
    /// Reviewer's answer (debug mode only)
    pub review: Option<ReviewDecision>,
    /// Target in use when the session ended (after any fallback)
    pub final_target: CaptureTarget,
    /// State the cycle loop was in when it ended
    pub stopped_in: SessionState,
    pub termination: Termination,
    pub elapsed: Duration,
}

impl SessionReport {
    /// Whether the session ended without a fatal error
    pub fn is_success(&self) -> bool {
        !self.termination.is_fatal()
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Session {} after {} cycles ({:.1?}, last state {:?})",
            self.termination, self.cycles, self.elapsed, self.stopped_in
        )?;
        writeln!(
            f,
            "  rows: {} captured, {} kept, {} duplicates dropped",
            self.raw_records, self.retained_records, self.dropped_records
        )?;
        if self.failed_extractions > 0 || self.skipped_unchanged > 0 {
            writeln!(
                f,
                "  cycles without records: {} failed, {} unchanged",
                self.failed_extractions, self.skipped_unchanged
            )?;
        }
        if let Some(raw) = &self.raw_path {
            writeln!(f, "  raw data: {}", raw.display())?;
        }
        write!(f, "  output: {} ({} rows)", self.output_path.display(), self.rows_written)
    }
}

#[derive(Debug, Default)]
struct CycleStats {
    cycles: u64,
    failed_extractions: u64,
    skipped_unchanged: u64,
}

/// One capture session over a fixed schema
pub struct Session {
    plan: SessionPlan,
    capturer: Box<dyn Capturer>,
    extractor: Box<dyn Extractor>,
    navigator: Box<dyn Navigator>,
    reviewer: Box<dyn Reviewer>,
    stop: StopSignal,
    frames: Option<FrameBus>,
    state: SessionState,
}

impl Session {
    pub fn new(
        plan: SessionPlan,
        capturer: Box<dyn Capturer>,
        extractor: Box<dyn Extractor>,
        navigator: Box<dyn Navigator>,
        stop: StopSignal,
    ) -> Self {
        Self {
            plan,
            capturer,
            extractor,
            navigator,
            reviewer: Box::new(AutoApprove),
            stop,
            frames: None,
            state: SessionState::Init,
        }
    }

    /// Validate `config` and build a session; no cycle runs on error
    pub fn from_config(
        config: &Config,
        capturer: Box<dyn Capturer>,
        extractor: Box<dyn Extractor>,
        navigator: Box<dyn Navigator>,
        stop: StopSignal,
    ) -> Result<Self, ConfigError> {
        let plan = config.plan()?;
        Ok(Self::new(plan, capturer, extractor, navigator, stop))
    }

    pub fn with_reviewer(mut self, reviewer: Box<dyn Reviewer>) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_frame_bus(mut self, bus: FrameBus) -> Self {
        self.frames = Some(bus);
        self
    }

    pub fn plan(&self) -> &SessionPlan {
        &self.plan
    }

    fn transition(&mut self, next: SessionState) {
        trace!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run cycles until stopped, then dedupe and persist
    pub async fn run(mut self) -> Result<SessionReport, SessionError> {
        let started = Instant::now();
        info!(
            "▶️ Capturing {} every {:?} (columns: {})",
            self.plan.target, self.plan.capture_interval, self.plan.schema
        );

        let mut recorder = Recorder::new();
        let mut stats = CycleStats::default();
        let mut target = self.plan.target.clone();
        // A full-display target has nothing to fall back to
        let mut fallback_spent = !target.is_window();
        let mut detector = ChangeDetector::new(self.plan.hash_sensitivity);
        let mut seq: SequenceNumber = 0;

        let mut ticker = tokio::time::interval(self.plan.capture_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let termination = loop {
            if self.stop.is_triggered() {
                break Termination::Interrupted;
            }

            let interrupted = tokio::select! {
                _ = ticker.tick() => false,
                _ = self.stop.wait() => true,
            };
            if interrupted {
                break Termination::Interrupted;
            }

            seq += 1;
            stats.cycles += 1;

            self.transition(SessionState::Capturing);
            let image = match self
                .capture_with_fallback(&mut target, &mut fallback_spent, &mut detector)
                .await
            {
                Ok(image) => image,
                Err(e) => {
                    error!("Capture of {} failed: {}", target, e);
                    break Termination::CaptureFailed(e);
                }
            };

            let frame = Arc::new(Frame::new(seq, image, target.clone()));
            if let Some(bus) = &self.frames {
                bus.publish(frame.clone());
            }

            if self.stop.is_triggered() {
                break Termination::Interrupted;
            }

            if self.plan.skip_unchanged_frames && !detector.has_changed(&frame.image) {
                info!("Frame {} unchanged, skipping extraction", seq);
                stats.skipped_unchanged += 1;
            } else {
                self.transition(SessionState::Extracting);
                let extracted =
                    extract_with_retry(&self.plan, self.extractor.as_ref(), &self.stop, &frame)
                        .await;
                match extracted {
                    Some(records) => {
                        self.transition(SessionState::Recording);
                        info!("📝 Cycle {}: {} rows", seq, records.len());
                        recorder.append(records);
                    }
                    None => stats.failed_extractions += 1,
                }
            }

            if self.stop.is_triggered() {
                break Termination::Interrupted;
            }

            self.transition(SessionState::Navigating);
            if let Err(e) = self.navigator.advance(self.plan.navigation_steps).await {
                if e.is_fatal() {
                    error!("Navigation unavailable: {}", e);
                    break Termination::NavigationFailed(e);
                }
                warn!("Navigation failed in cycle {}: {}", seq, e);
            }

            if !self.stop.sleep(self.plan.settle_delay).await {
                break Termination::Interrupted;
            }
        };

        let stopped_in = self.state;
        self.transition(SessionState::Stopping);
        info!("⏹️ Stopping ({}), {} rows buffered", termination, recorder.len());
        let buffer = recorder.into_buffer();

        self.finish(buffer, stats, target, stopped_in, termination, started)
            .await
    }

    async fn capture_with_fallback(
        &mut self,
        target: &mut CaptureTarget,
        fallback_spent: &mut bool,
        detector: &mut ChangeDetector,
    ) -> Result<DynamicImage, CaptureError> {
        let first = self.capturer.capture(target).await;
        match first {
            Err(CaptureError::TargetUnavailable(reason)) if !*fallback_spent => {
                warn!(
                    "{} unavailable ({}), falling back to the full display",
                    target, reason
                );
                *fallback_spent = true;
                *target = CaptureTarget::FullDisplay;
                detector.reset();
                self.capturer.capture(target).await
            }
            result => result,
        }
    }

    async fn finish(
        &mut self,
        buffer: Vec<Record>,
        stats: CycleStats,
        final_target: CaptureTarget,
        stopped_in: SessionState,
        termination: Termination,
        started: Instant,
    ) -> Result<SessionReport, SessionError> {
        self.transition(SessionState::Deduping);
        let outcome = Deduplicator::new(self.plan.dedup).partition(&buffer);
        let output_path = self.plan.output_path.clone();
        let schema = self.plan.schema.clone();

        let mut raw_path = None;
        let mut review = None;

        if self.plan.debug_mode {
            let path = raw_path_for(&output_path);
            if let Err(source) = write_csv(&path, &schema, &buffer) {
                error!("Failed to write raw data: {}", source);
                return Err(SessionError::SinkWrite { source, buffer });
            }
            info!("Raw data ({} rows) saved to {}", buffer.len(), path.display());

            review = Some(self.reviewer.review(&outcome, &path).await);
            raw_path = Some(path);
        }

        let rows: &[Record] = match review {
            Some(ReviewDecision::KeepRaw) => {
                info!("Deduplication declined, keeping all {} rows", buffer.len());
                &buffer
            }
            _ => &outcome.retained,
        };
        let rows_written = rows.len();

        if let Err(source) = write_csv(&output_path, &schema, rows) {
            error!("Failed to write output: {}", source);
            return Err(SessionError::SinkWrite { source, buffer });
        }

        self.transition(SessionState::Done);

        Ok(SessionReport {
            cycles: stats.cycles,
            failed_extractions: stats.failed_extractions,
            skipped_unchanged: stats.skipped_unchanged,
            raw_records: buffer.len(),
            retained_records: outcome.retained.len(),
            dropped_records: outcome.dropped.len(),
            rows_written,
            output_path,
            raw_path,
            review,
            final_target,
            stopped_in,
            termination,
            elapsed: started.elapsed(),
        })
    }
}

/// Run the extractor with per-attempt timeout and backoff
///
/// Returns `None` when every attempt failed or a stop request arrived
/// between attempts.
async fn extract_with_retry(
    plan: &SessionPlan,
    extractor: &dyn Extractor,
    stop: &StopSignal,
    frame: &Frame,
) -> Option<Vec<Record>> {
    let schema = &plan.schema;

    for attempt in 1..=plan.max_attempts {
        if attempt > 1 {
            let backoff = plan.backoff_after(attempt - 1);
            debug!("Retrying frame {} in {:?}", frame.seq, backoff);
            if !stop.sleep(backoff).await {
                info!("Stop requested, abandoning extraction of frame {}", frame.seq);
                return None;
            }
        }

        let result = match tokio::time::timeout(
            plan.extraction_timeout,
            extractor.extract(frame, schema),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(plan.extraction_timeout)),
        };

        match result {
            Ok(records) => match records.iter().find(|r| !r.conforms_to(schema)) {
                None => return Some(records),
                Some(bad) => warn!(
                    "{} returned a row with columns [{}] for frame {} (attempt {}/{})",
                    extractor.name(),
                    bad.keys().join(", "),
                    frame.seq,
                    attempt,
                    plan.max_attempts
                ),
            },
            Err(e) => warn!(
                "{} failed on frame {} (attempt {}/{}): {}",
                extractor.name(),
                frame.seq,
                attempt,
                plan.max_attempts,
                e
            ),
        }
    }

    warn!(
        "Giving up on frame {} after {} attempts",
        frame.seq, plan.max_attempts
    );
    None
}
