// =============================================================================
// Integrity Reconciler — keep the persisted series complete and current
// =============================================================================
//
// Runs forever on a fixed cadence: scan the persisted series for missing
// time buckets, refetch and repair them, then fold freshly observed live
// candles into storage. Partial repair (the exchange truncated a response)
// is not an error; the remainder is deferred to the next pass. Every write
// is idempotent per OpenTime row, so passes are safely re-runnable.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::exchange::CandleFetcher;
use crate::store::CandleStore;
use crate::types::{Candle, MissingInterval, Series};

/// Summary of a single reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Missing-interval spans found in this pass.
    pub gaps_found: usize,
    /// Rows written while repairing gaps.
    pub rows_inserted: usize,
    /// Whether every previously-missing boundary is now present.
    pub fully_repaired: bool,
    /// ISO-8601 timestamp of this pass.
    pub timestamp: String,
}

pub struct IntegrityReconciler {
    series: Series,
    store: CandleStore,
    fetcher: Arc<dyn CandleFetcher>,
    cadence: Duration,
    /// Ordered buffer of recently observed live candles, shared with the
    /// stream connector. Snapshot-read each pass; the newer/equal/older rule
    /// makes re-reads idempotent.
    observed: Arc<RwLock<Vec<Candle>>>,
}

impl IntegrityReconciler {
    pub fn new(
        series: Series,
        store: CandleStore,
        fetcher: Arc<dyn CandleFetcher>,
        cadence: Duration,
        observed: Arc<RwLock<Vec<Candle>>>,
    ) -> Self {
        Self {
            series,
            store,
            fetcher,
            cadence,
            observed,
        }
    }

    /// Run until the stop signal flips. Never terminates on its own.
    pub async fn run(&self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    info!(series = %self.series, "reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.reconcile_once().await {
                Ok(report) => {
                    if report.gaps_found > 0 {
                        info!(
                            series = %self.series,
                            gaps = report.gaps_found,
                            inserted = report.rows_inserted,
                            fully_repaired = report.fully_repaired,
                            "gap repair pass completed"
                        );
                    }
                }
                Err(e) => warn!(series = %self.series, error = %e, "reconciliation pass failed"),
            }

            match self.sync_observed() {
                Ok((0, 0)) => {}
                Ok((inserted, updated)) => {
                    debug!(series = %self.series, inserted, updated, "observed candles persisted")
                }
                Err(e) => warn!(series = %self.series, error = %e, "observed-candle sync failed"),
            }
        }
    }

    /// One gap-scan-and-repair pass over the persisted series.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let timestamp = Utc::now().to_rfc3339();
        let step = self.series.interval.duration_ms();

        let Some((min_time, max_time)) = self.store.min_max_open_time()? else {
            debug!(series = %self.series, "series table empty, skipping pass");
            return Ok(ReconcileReport {
                gaps_found: 0,
                rows_inserted: 0,
                fully_repaired: true,
                timestamp,
            });
        };

        let existing: HashSet<i64> = self.store.open_times()?.into_iter().collect();
        let gaps = missing_intervals(&existing, min_time, max_time, step);

        if gaps.is_empty() {
            debug!(series = %self.series, "series complete, nothing to repair");
            return Ok(ReconcileReport {
                gaps_found: 0,
                rows_inserted: 0,
                fully_repaired: true,
                timestamp,
            });
        }

        info!(series = %self.series, gaps = gaps.len(), "missing intervals found, refetching");

        let mut rows_inserted = 0usize;
        for gap in &gaps {
            match self.repair_gap(gap, step).await {
                Ok(n) => rows_inserted += n,
                // One failed repair does not abort the pass; the next cadence
                // retries whatever is still missing.
                Err(e) => error!(
                    series = %self.series,
                    since = gap.since,
                    until = gap.until,
                    error = %e,
                    "gap repair failed, deferring"
                ),
            }
        }

        // Re-walk the previously missing boundaries. Anything still absent
        // (e.g. the exchange truncated the response) waits for the next pass.
        let mut fully_repaired = true;
        'verify: for gap in &gaps {
            let mut t = gap.since;
            while t <= gap.until {
                if !self.store.exists_at(t)? {
                    fully_repaired = false;
                    info!(
                        series = %self.series,
                        open_time = t,
                        "boundary still missing after repair, deferred to next pass"
                    );
                    break 'verify;
                }
                t += step;
            }
        }

        Ok(ReconcileReport {
            gaps_found: gaps.len(),
            rows_inserted,
            fully_repaired,
            timestamp,
        })
    }

    /// Refetch one missing span and write it. The fetch window is widened by
    /// one interval on each side because the exchange excludes both boundary
    /// timestamps; any stale row at `since` is removed first.
    async fn repair_gap(&self, gap: &MissingInterval, step: i64) -> Result<usize> {
        let fetched = self
            .fetcher
            .fetch_candles(
                &self.series,
                Some(gap.since - step),
                Some(gap.until + step),
                None,
            )
            .await?;

        self.store.delete_at(gap.since)?;
        self.store.insert_batch(&fetched)?;
        Ok(fetched.len())
    }

    /// Fold freshly observed live candles into storage: strictly newer than
    /// the persisted maximum → insert; equal → update in place (still-open
    /// bar refinement); older → already superseded, ignore.
    pub fn sync_observed(&self) -> Result<(usize, usize)> {
        let snapshot: Vec<Candle> = self.observed.read().clone();
        if snapshot.is_empty() {
            return Ok((0, 0));
        }

        let max_persisted = self.store.max_open_time()?.unwrap_or(i64::MIN);

        let mut inserted = 0usize;
        let mut updated = 0usize;
        for candle in &snapshot {
            if candle.open_time > max_persisted {
                match self.store.insert(candle) {
                    Ok(()) => inserted += 1,
                    // Skip the single failed write; the gap scan repairs it.
                    Err(e) => error!(
                        series = %self.series,
                        open_time = candle.open_time,
                        error = %e,
                        "observed insert failed, skipping"
                    ),
                }
            } else if candle.open_time == max_persisted {
                match self.store.update_at(candle) {
                    Ok(true) => updated += 1,
                    Ok(false) => {}
                    Err(e) => error!(
                        series = %self.series,
                        open_time = candle.open_time,
                        error = %e,
                        "observed update failed, skipping"
                    ),
                }
            }
        }

        Ok((inserted, updated))
    }
}

/// Group every absent interval boundary in `[min_time, max_time]` into
/// maximal contiguous spans.
fn missing_intervals(
    existing: &HashSet<i64>,
    min_time: i64,
    max_time: i64,
    step: i64,
) -> Vec<MissingInterval> {
    let mut gaps = Vec::new();
    let mut open_since: Option<i64> = None;

    let mut t = min_time;
    while t <= max_time {
        if existing.contains(&t) {
            if let Some(since) = open_since.take() {
                gaps.push(MissingInterval {
                    since,
                    until: t - step,
                });
            }
        } else if open_since.is_none() {
            open_since = Some(t);
        }
        t += step;
    }
    // min/max are persisted rows, so a span cannot run off the end; guard
    // anyway against a caller passing a wider range.
    if let Some(since) = open_since {
        gaps.push(MissingInterval {
            since,
            until: max_time,
        });
    }

    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const MIN: i64 = 60_000;

    fn candle(t: i64, close: f64) -> Candle {
        Candle::new(t, close, close + 1.0, close - 1.0, close, 100.0)
    }

    fn test_series() -> Series {
        Series::new("BTC-USDT-SWAP", "1m".parse().unwrap())
    }

    // -- missing-interval grouping ------------------------------------------

    #[test]
    fn complete_range_has_no_gaps() {
        let existing: HashSet<i64> = (0..5).map(|i| i * MIN).collect();
        assert!(missing_intervals(&existing, 0, 4 * MIN, MIN).is_empty());
    }

    #[test]
    fn contiguous_absences_group_into_one_span() {
        // Rows at t0 and t0+3i; t0+i and t0+2i missing.
        let existing: HashSet<i64> = [0, 3 * MIN].into_iter().collect();
        let gaps = missing_intervals(&existing, 0, 3 * MIN, MIN);
        assert_eq!(
            gaps,
            vec![MissingInterval {
                since: MIN,
                until: 2 * MIN
            }]
        );
    }

    #[test]
    fn separate_absences_yield_separate_spans() {
        let existing: HashSet<i64> = [0, 2 * MIN, 5 * MIN].into_iter().collect();
        let gaps = missing_intervals(&existing, 0, 5 * MIN, MIN);
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0], MissingInterval { since: MIN, until: MIN });
        assert_eq!(
            gaps[1],
            MissingInterval {
                since: 3 * MIN,
                until: 4 * MIN
            }
        );
    }

    // -- scripted fetcher ----------------------------------------------------

    struct ScriptedFetcher {
        response: Vec<Candle>,
        calls: Mutex<Vec<(Option<i64>, Option<i64>)>>,
    }

    impl ScriptedFetcher {
        fn new(response: Vec<Candle>) -> Arc<Self> {
            Arc::new(Self {
                response,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl CandleFetcher for ScriptedFetcher {
        async fn fetch_candles(
            &self,
            _series: &Series,
            since: Option<i64>,
            until: Option<i64>,
            _limit: Option<u32>,
        ) -> Result<Vec<Candle>> {
            self.calls.lock().push((since, until));
            Ok(self.response.clone())
        }
    }

    fn reconciler(
        rows: &[Candle],
        fetcher: Arc<ScriptedFetcher>,
        observed: Vec<Candle>,
    ) -> IntegrityReconciler {
        let store = CandleStore::in_memory(&test_series()).unwrap();
        store.insert_batch(rows).unwrap();
        IntegrityReconciler::new(
            test_series(),
            store,
            fetcher,
            Duration::from_secs(15),
            Arc::new(RwLock::new(observed)),
        )
    }

    // -- gap repair ----------------------------------------------------------

    #[tokio::test]
    async fn repairs_two_bucket_gap_with_widened_fetch() {
        let fetcher = ScriptedFetcher::new(vec![candle(MIN, 2.0), candle(2 * MIN, 3.0)]);
        let rec = reconciler(&[candle(0, 1.0), candle(3 * MIN, 4.0)], fetcher.clone(), vec![]);

        let report = rec.reconcile_once().await.unwrap();
        assert_eq!(report.gaps_found, 1);
        assert_eq!(report.rows_inserted, 2);
        assert!(report.fully_repaired);

        // Endpoints widened by one interval each side.
        assert_eq!(fetcher.calls.lock()[0], (Some(0), Some(3 * MIN)));

        // A subsequent scan finds zero missing boundaries.
        let again = rec.reconcile_once().await.unwrap();
        assert_eq!(again.gaps_found, 0);
        assert_eq!(rec.store.count().unwrap(), 4);
    }

    #[tokio::test]
    async fn complete_series_produces_no_writes() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let rows: Vec<Candle> = (0..4).map(|i| candle(i * MIN, 1.0 + i as f64)).collect();
        let rec = reconciler(&rows, fetcher.clone(), vec![]);

        for _ in 0..2 {
            let report = rec.reconcile_once().await.unwrap();
            assert_eq!(report.gaps_found, 0);
            assert_eq!(report.rows_inserted, 0);
            assert!(report.fully_repaired);
        }
        assert_eq!(fetcher.call_count(), 0);
        assert_eq!(rec.store.count().unwrap(), 4);
    }

    #[tokio::test]
    async fn truncated_response_defers_to_next_pass() {
        // Two buckets missing but the exchange only returns one.
        let fetcher = ScriptedFetcher::new(vec![candle(MIN, 2.0)]);
        let rec = reconciler(&[candle(0, 1.0), candle(3 * MIN, 4.0)], fetcher, vec![]);

        let report = rec.reconcile_once().await.unwrap();
        assert_eq!(report.gaps_found, 1);
        assert_eq!(report.rows_inserted, 1);
        assert!(!report.fully_repaired);
        assert!(!rec.store.exists_at(2 * MIN).unwrap());
    }

    #[tokio::test]
    async fn empty_table_skips_pass() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let rec = reconciler(&[], fetcher.clone(), vec![]);

        let report = rec.reconcile_once().await.unwrap();
        assert_eq!(report.gaps_found, 0);
        assert_eq!(fetcher.call_count(), 0);
    }

    // -- observed-candle sync ------------------------------------------------

    #[test]
    fn observed_upsert_newer_equal_older() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let observed = vec![
            candle(MIN, 9.0),     // older than max: ignored
            candle(2 * MIN, 9.5), // equal to max: updated in place
            candle(3 * MIN, 4.0), // newer: inserted
            candle(4 * MIN, 5.0), // newer: inserted
        ];
        let rows: Vec<Candle> = (0..3).map(|i| candle(i * MIN, 1.0 + i as f64)).collect();
        let rec = reconciler(&rows, fetcher, observed);

        let (inserted, updated) = rec.sync_observed().unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(updated, 1);
        assert_eq!(rec.store.count().unwrap(), 5);

        // The still-open bar was refined, the older one untouched.
        let refined = &rec.store.fetch_range(2 * MIN, 2 * MIN).unwrap()[0];
        assert!((refined.close - 9.5).abs() < f64::EPSILON);
        let older = &rec.store.fetch_range(MIN, MIN).unwrap()[0];
        assert!((older.close - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn observed_sync_is_idempotent() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let observed = vec![candle(3 * MIN, 4.0)];
        let rows: Vec<Candle> = (0..3).map(|i| candle(i * MIN, 1.0 + i as f64)).collect();
        let rec = reconciler(&rows, fetcher, observed);

        assert_eq!(rec.sync_observed().unwrap(), (1, 0));
        // Second pass: the buffered candle is now the persisted maximum, so
        // it refreshes in place instead of duplicating.
        assert_eq!(rec.sync_observed().unwrap(), (0, 1));
        assert_eq!(rec.store.count().unwrap(), 4);
    }
}
