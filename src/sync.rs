// =============================================================================
// LiveSync — one ordered, finalized candle sequence per series
// =============================================================================
//
// Replays a bounded historical preload oldest-to-newest, then tails the
// connector's broadcast subscription. A live candle is handed to the consumer
// only once a strictly later open time has been observed on the feed
// (finalize-on-next-bar); same-open-time updates refine the pending bar in
// place. A spacing mismatch between the two most recently emitted candles
// discards all live state and replays a fresh preload.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::exchange::CandleFetcher;
use crate::retry::RetryPolicy;
use crate::types::{Candle, Series};

/// Where the next emission comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Historical,
    Live,
}

/// Outcome of feeding one live update into the state machine.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    /// The previous pending candle is finalized; hand it to the consumer.
    Emit(Candle),
    /// No emission this round; keep waiting for updates.
    Wait,
    /// Feed discontinuity detected; discard live state, replay history.
    Reload,
}

// -----------------------------------------------------------------------------
// Pure state machine
// -----------------------------------------------------------------------------

/// Finalization state, independent of any I/O so the ordering rules can be
/// exercised directly.
struct SyncState {
    interval_ms: i64,
    staleness_ms: i64,
    phase: Phase,
    pending: Option<Candle>,
    /// Open times of the two most recent emissions (historical ones included),
    /// newest first.
    last_emitted: Option<i64>,
    prev_emitted: Option<i64>,
}

impl SyncState {
    fn new(interval_ms: i64, staleness_ms: i64) -> Self {
        Self {
            interval_ms,
            staleness_ms,
            phase: Phase::Historical,
            pending: None,
            last_emitted: None,
            prev_emitted: None,
        }
    }

    /// Record an emission so the spacing check sees historical and live
    /// candles alike.
    fn note_emitted(&mut self, open_time: i64) {
        self.prev_emitted = self.last_emitted;
        self.last_emitted = Some(open_time);
    }

    fn mark_live(&mut self) {
        self.phase = Phase::Live;
    }

    /// Reset everything live; the caller replays a fresh historical preload.
    fn reset(&mut self) {
        self.phase = Phase::Historical;
        self.pending = None;
        self.last_emitted = None;
        self.prev_emitted = None;
    }

    /// Feed one live update through the finalization rules.
    fn on_update(&mut self, candidate: Candle, now_ms: i64) -> Step {
        // Seed: the first observed update only establishes tracking.
        let Some(pending) = self.pending.as_mut() else {
            self.pending = Some(candidate);
            return Step::Wait;
        };

        // Freshness gate: a pending bar far from wall clock means the feed is
        // replaying or stalled; suppress emission this round.
        let fresh = (now_ms - pending.open_time).abs() < self.staleness_ms;

        // Spacing check over the two most recent emissions. A mismatch means
        // the feed skipped or replayed a bar; only a full reload restores the
        // invariant.
        if let (Some(last), Some(prev)) = (self.last_emitted, self.prev_emitted) {
            if last - prev != self.interval_ms {
                return Step::Reload;
            }
        }

        if candidate.open_time == pending.open_time {
            // In-place refinement of the still-open bar.
            pending.refine_from(&candidate);
            return Step::Wait;
        }

        if self.phase == Phase::Live && fresh {
            // Strictly new bar observed: the pending one is final. The
            // candidate takes the slot in the same transition, so a candle is
            // emitted exactly once.
            let emitted = std::mem::replace(pending, candidate);
            self.note_emitted(emitted.open_time);
            return Step::Emit(emitted);
        }

        // Not emittable this round (stale feed or history still replaying):
        // track the newest update and keep waiting.
        *pending = candidate;
        Step::Wait
    }
}

// -----------------------------------------------------------------------------
// Async driver
// -----------------------------------------------------------------------------

pub struct LiveSync {
    series: Series,
    fetcher: Arc<dyn CandleFetcher>,
    rx: broadcast::Receiver<Candle>,
    preload_depth: u32,
    retry: RetryPolicy,
    history: VecDeque<Candle>,
    state: SyncState,
}

impl LiveSync {
    /// Fetch the historical preload and attach to a connector subscription.
    ///
    /// The most recent preloaded row is presumed still open and is discarded.
    pub async fn start(
        series: Series,
        fetcher: Arc<dyn CandleFetcher>,
        rx: broadcast::Receiver<Candle>,
        preload_depth: u32,
        staleness: Duration,
        history_budget: Duration,
    ) -> Result<Self> {
        let state = SyncState::new(
            series.interval.duration_ms(),
            staleness.as_millis() as i64,
        );

        let mut sync = Self {
            series,
            fetcher,
            rx,
            preload_depth,
            retry: RetryPolicy::new(history_budget),
            history: VecDeque::new(),
            state,
        };
        sync.load_history().await?;
        Ok(sync)
    }

    async fn load_history(&mut self) -> Result<()> {
        let series = self.series.clone();
        let fetcher = self.fetcher.clone();
        let depth = self.preload_depth;

        let mut candles = self
            .retry
            .run("historical preload", || {
                let series = series.clone();
                let fetcher = fetcher.clone();
                async move {
                    fetcher
                        .fetch_candles(&series, None, None, Some(depth))
                        .await
                }
            })
            .await
            .with_context(|| format!("historical preload failed for {series}"))?;

        // Drop the newest row; it is presumed not yet closed.
        candles.pop();

        info!(series = %self.series, preloaded = candles.len(), "historical preload complete");
        self.history = candles.into();
        Ok(())
    }

    /// Obtain the next finalized candle, suspending until one is available.
    ///
    /// Returns `Ok(None)` once the underlying feed has stopped. A historical
    /// re-fetch failure after the retry budget is fatal for the series.
    pub async fn pull(&mut self) -> Result<Option<Candle>> {
        loop {
            if let Some(candle) = self.history.pop_front() {
                self.state.note_emitted(candle.open_time);
                if self.history.is_empty() {
                    debug!(series = %self.series, "historical replay complete, switching to live");
                    self.state.mark_live();
                }
                return Ok(Some(candle));
            }
            self.state.mark_live();

            match self.rx.recv().await {
                Ok(update) => {
                    let now_ms = Utc::now().timestamp_millis();
                    match self.state.on_update(update, now_ms) {
                        Step::Emit(candle) => return Ok(Some(candle)),
                        Step::Wait => continue,
                        Step::Reload => {
                            warn!(
                                series = %self.series,
                                "emitted spacing mismatch, reloading from history"
                            );
                            self.reload().await?;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(series = %self.series, "feed stopped, ending sequence");
                    return Ok(None);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        series = %self.series,
                        skipped,
                        "subscription lagged, reloading from history"
                    );
                    self.reload().await?;
                }
            }
        }
    }

    async fn reload(&mut self) -> Result<()> {
        self.state.reset();
        self.load_history().await
    }
}
