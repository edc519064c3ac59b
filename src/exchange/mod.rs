// =============================================================================
// Exchange collaborators — historical-fetch seam
// =============================================================================

pub mod rest;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::types::{Candle, Series};

/// Maximum rows one history request may return; the exchange truncates larger
/// requests silently.
pub const PAGE_LIMIT: u32 = 100;

/// Historical candle fetch contract.
///
/// `since` and `until` are epoch-millisecond boundaries the exchange treats as
/// **exclusive**: a returned page never contains a candle at either boundary.
/// For a window wider than one page the exchange serves the newest rows of the
/// window first, so callers page backwards from `until`.
#[async_trait]
pub trait CandleFetcher: Send + Sync {
    async fn fetch_candles(
        &self,
        series: &Series,
        since: Option<i64>,
        until: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>>;

    /// Fetch an entire span `(since, until)` by paging backwards: each request
    /// asks for rows older than the cursor, and the cursor moves to the oldest
    /// row returned. Tolerates short pages; rows at or beyond the cursor are
    /// dropped, so an endpoint-inclusive response cannot produce duplicates.
    /// The result is ascending by open time.
    async fn fetch_paged(&self, series: &Series, since: i64, until: i64) -> Result<Vec<Candle>> {
        let mut pages: Vec<Vec<Candle>> = Vec::new();
        let mut cursor = until;

        loop {
            let page = self
                .fetch_candles(series, Some(since), Some(cursor), Some(PAGE_LIMIT))
                .await?;

            let fresh: Vec<Candle> = page
                .into_iter()
                .filter(|c| c.open_time > since && c.open_time < cursor)
                .collect();
            // Pages are ascending; the cursor strictly decreases, so the walk
            // terminates once nothing older remains.
            let Some(oldest) = fresh.first().map(|c| c.open_time) else {
                break;
            };
            cursor = oldest;
            pages.push(fresh);
        }

        // Collected newest-span-first; flatten back to ascending.
        pages.reverse();
        let all: Vec<Candle> = pages.into_iter().flatten().collect();
        debug!(series = %series, count = all.len(), "paged fetch complete");
        Ok(all)
    }
}
