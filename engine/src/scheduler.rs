use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::analysis::traits::FrameAnalyzer;
use crate::analysis::{AnalysisError, AnalysisResult};
use crate::source::FrameSource;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("analyzer {0} is not ready")]
    NotReady(String),
}

/// Counters shared between the sampling task and its handle.
#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    analyses: AtomicU64,
    skipped_busy: AtomicU64,
    skipped_no_frame: AtomicU64,
    invalid_frames: AtomicU64,
    degraded: AtomicU64,
}

/// Snapshot of a scheduler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub analyses: u64,
    pub skipped_busy: u64,
    pub skipped_no_frame: u64,
    pub invalid_frames: u64,
    pub degraded: u64,
}

/// Periodic, non-overlapping frame sampler.
///
/// Each tick pulls the newest frame and hands it to the analyzer on the
/// blocking pool. A tick that fires while an analysis is still pending is
/// dropped, never queued, so at most one analysis is in flight and results
/// come out in the order their frames were taken.
pub struct AnalysisScheduler<S, A> {
    source: Arc<S>,
    analyzer: Arc<A>,
    period: Duration,
    buffer: usize,
}

impl<S: FrameSource, A: FrameAnalyzer> AnalysisScheduler<S, A> {
    pub fn new(source: Arc<S>, analyzer: Arc<A>, period: Duration, buffer: usize) -> Self {
        Self {
            source,
            analyzer,
            period,
            buffer: buffer.max(1),
        }
    }

    /// Start sampling. Fails if the analyzer has not finished initializing.
    pub fn start(&self) -> Result<SchedulerHandle, SchedulerError> {
        if !self.analyzer.is_ready() {
            return Err(SchedulerError::NotReady(self.analyzer.name().to_string()));
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let counters = Arc::new(Counters::default());
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.source),
            Arc::clone(&self.analyzer),
            self.period,
            tx,
            Arc::clone(&counters),
        ));

        info!(
            analyzer = self.analyzer.name(),
            period_ms = self.period.as_millis() as u64,
            "analysis scheduler started"
        );
        Ok(SchedulerHandle {
            task,
            results: rx,
            counters,
        })
    }
}

/// A running scheduler. Dropping the handle stops it.
pub struct SchedulerHandle {
    task: JoinHandle<()>,
    results: mpsc::Receiver<AnalysisResult>,
    counters: Arc<Counters>,
}

impl SchedulerHandle {
    /// Next result in production order, `None` once the loop has ended.
    pub async fn next(&mut self) -> Option<AnalysisResult> {
        self.results.recv().await
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            analyses: c.analyses.load(Ordering::Relaxed),
            skipped_busy: c.skipped_busy.load(Ordering::Relaxed),
            skipped_no_frame: c.skipped_no_frame.load(Ordering::Relaxed),
            invalid_frames: c.invalid_frames.load(Ordering::Relaxed),
            degraded: c.degraded.load(Ordering::Relaxed),
        }
    }

    /// Cancel the timer and discard anything not yet received.
    pub fn stop(mut self) -> SchedulerStats {
        self.task.abort();
        self.results.close();
        let stats = self.stats();
        debug!(
            ticks = stats.ticks,
            analyses = stats.analyses,
            skipped_busy = stats.skipped_busy,
            "analysis scheduler stopped"
        );
        stats
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type PendingAnalysis = JoinHandle<Result<AnalysisResult, AnalysisError>>;

async fn run_loop<S: FrameSource, A: FrameAnalyzer>(
    source: Arc<S>,
    analyzer: Arc<A>,
    period: Duration,
    tx: mpsc::Sender<AnalysisResult>,
    counters: Arc<Counters>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Frame identity of the analysis in flight, for degraded results.
    let mut pending: Option<(PendingAnalysis, u64, i64)> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                counters.ticks.fetch_add(1, Ordering::Relaxed);
                if pending.is_some() {
                    counters.skipped_busy.fetch_add(1, Ordering::Relaxed);
                    debug!("previous analysis still running, skipping tick");
                    continue;
                }
                let Some(frame) = source.try_get_latest_frame() else {
                    counters.skipped_no_frame.fetch_add(1, Ordering::Relaxed);
                    debug!("no frame available yet, skipping tick");
                    continue;
                };
                if let Err(e) = frame.validate() {
                    counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error = %e,
                        seq = frame.seq,
                        "malformed frame from source, skipping tick"
                    );
                    continue;
                }

                counters.analyses.fetch_add(1, Ordering::Relaxed);
                let (seq, ts) = (frame.seq, frame.captured_at_ms);
                let analyzer = Arc::clone(&analyzer);
                // The frame and every buffer derived from it are dropped when the job returns.
                let job = tokio::task::spawn_blocking(move || analyzer.analyze(&frame));
                pending = Some((job, seq, ts));
            }
            Some(joined) = wait_pending(&mut pending) => {
                let Some((_, seq, ts)) = pending.take() else {
                    continue;
                };
                let result = match joined {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        counters.degraded.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, seq, "frame analysis failed");
                        AnalysisResult::degraded(seq, ts, e.to_string())
                    }
                    Err(e) => {
                        counters.degraded.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, seq, "frame analysis aborted");
                        AnalysisResult::degraded(seq, ts, format!("analysis aborted: {e}"))
                    }
                };
                if tx.send(result).await.is_err() {
                    debug!("result receiver gone, scheduler exiting");
                    return;
                }
            }
        }
    }
}

/// Resolves with the pending job's outcome; never resolves when idle.
async fn wait_pending(
    pending: &mut Option<(PendingAnalysis, u64, i64)>,
) -> Option<Result<Result<AnalysisResult, AnalysisError>, tokio::task::JoinError>> {
    match pending {
        Some((job, _, _)) => Some(job.await),
        None => std::future::pending().await,
    }
}
