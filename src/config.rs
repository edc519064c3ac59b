// =============================================================================
// Feed configuration — JSON file with per-field defaults and atomic save
// =============================================================================
//
// Every field carries a serde default so that an older config file missing a
// new field still loads. Saving uses the tmp + rename pattern to avoid a
// corrupt file on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::interval::Interval;
use crate::types::Series;

fn default_series() -> Vec<SeriesConfig> {
    vec![SeriesConfig {
        symbol: "BTC-USDT-SWAP".to_string(),
        interval: "1m".to_string(),
    }]
}

fn default_ws_url() -> String {
    "wss://ws.okx.com:8443/ws/v5/business".to_string()
}

fn default_rest_url() -> String {
    "https://www.okx.com".to_string()
}

fn default_db_path() -> String {
    "meridian.db".to_string()
}

fn default_preload_depth() -> u32 {
    300
}

fn default_staleness_secs() -> u64 {
    70
}

fn default_reconcile_cadence_secs() -> u64 {
    15
}

fn default_connect_budget_secs() -> u64 {
    60
}

fn default_history_budget_secs() -> u64 {
    30
}

fn default_backfill_days() -> u32 {
    7
}

/// One series to keep live and reconciled: instrument id plus interval
/// encoding (e.g. "1m", "4h").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesConfig {
    pub symbol: String,
    pub interval: String,
}

impl SeriesConfig {
    pub fn to_series(&self) -> Result<Series> {
        let interval: Interval = self
            .interval
            .parse()
            .with_context(|| format!("series {}: bad interval {:?}", self.symbol, self.interval))?;
        Ok(Series::new(self.symbol.clone(), interval))
    }
}

/// Top-level configuration for the feed engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Series to subscribe, synchronize, and reconcile.
    #[serde(default = "default_series")]
    pub series: Vec<SeriesConfig>,

    /// Exchange WebSocket endpoint for the candle channel.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Exchange REST base URL for historical fetches.
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// SQLite database file holding one table per series.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Number of most-recent historical candles to preload before tailing
    /// the live feed.
    #[serde(default = "default_preload_depth")]
    pub preload_depth: u32,

    /// Feed-freshness threshold: emission is suppressed while the pending
    /// candle's open time is at least this far from wall clock.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,

    /// Sleep between reconciliation passes.
    #[serde(default = "default_reconcile_cadence_secs")]
    pub reconcile_cadence_secs: u64,

    /// Elapsed-time budget for one connect-with-retry call.
    #[serde(default = "default_connect_budget_secs")]
    pub connect_budget_secs: u64,

    /// Elapsed-time budget for one historical-preload-with-retry call.
    #[serde(default = "default_history_budget_secs")]
    pub history_budget_secs: u64,

    /// How far back to bulk-backfill an empty series table at startup.
    /// Zero disables backfill.
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            series: default_series(),
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            db_path: default_db_path(),
            preload_depth: default_preload_depth(),
            staleness_secs: default_staleness_secs(),
            reconcile_cadence_secs: default_reconcile_cadence_secs(),
            connect_budget_secs: default_connect_budget_secs(),
            history_budget_secs: default_history_budget_secs(),
            backfill_days: default_backfill_days(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            series = config.series.len(),
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` atomically (write `.tmp`, rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }
}
