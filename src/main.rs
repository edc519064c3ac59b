// =============================================================================
// Meridian Feed — Main Entry Point
// =============================================================================
//
// Per configured series: a stream connector tails the exchange candle
// channel, a live synchronizer turns updates into an ordered finalized
// stream, and an integrity reconciler keeps the persisted series gap-free.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod connector;
mod error;
mod exchange;
mod interval;
mod reconcile;
mod retry;
mod store;
mod sync;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{FeedConfig, SeriesConfig};
use crate::connector::StreamConnector;
use crate::exchange::rest::RestClient;
use crate::exchange::CandleFetcher;
use crate::reconcile::IntegrityReconciler;
use crate::store::CandleStore;
use crate::sync::LiveSync;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Feed — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = FeedConfig::load("feed_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = FeedConfig::default();
        // Seed a template so the defaults are editable next run.
        if let Err(e) = defaults.save("feed_config.json") {
            warn!(error = %e, "Failed to write default config");
        }
        defaults
    });

    // Override series from env if available, e.g.
    // MERIDIAN_SERIES="BTC-USDT-SWAP:1m,ETH-USDT-SWAP:5m"
    if let Ok(list) = std::env::var("MERIDIAN_SERIES") {
        config.series = list
            .split(',')
            .filter_map(|entry| {
                let (symbol, interval) = entry.trim().split_once(':')?;
                Some(SeriesConfig {
                    symbol: symbol.to_uppercase(),
                    interval: interval.to_string(),
                })
            })
            .collect();
    }
    if let Ok(url) = std::env::var("MERIDIAN_WS_URL") {
        config.ws_url = url;
    }
    if let Ok(url) = std::env::var("MERIDIAN_REST_URL") {
        config.rest_url = url;
    }

    if config.series.is_empty() {
        anyhow::bail!("no series configured");
    }
    info!(
        series = config.series.len(),
        ws_url = %config.ws_url,
        db_path = %config.db_path,
        "Configured series"
    );

    let rest = Arc::new(RestClient::new(config.rest_url.clone()));
    let fetcher: Arc<dyn CandleFetcher> = rest.clone();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connectors: Vec<Arc<StreamConnector>> = Vec::new();

    // ── 2. Per-series pipelines ──────────────────────────────────────────
    for sc in &config.series {
        let series = match sc.to_series() {
            Ok(s) => s,
            Err(e) => {
                error!(symbol = %sc.symbol, error = %e, "Bad series config, skipping");
                continue;
            }
        };

        let store = CandleStore::open(&config.db_path, &series)?;

        // Bulk-backfill an empty table before the reconciler takes over.
        if store.count()? == 0 && config.backfill_days > 0 {
            let until = chrono::Utc::now().timestamp_millis();
            let since = until - i64::from(config.backfill_days) * 86_400_000;
            info!(series = %series, days = config.backfill_days, "Empty table, backfilling");
            match rest.fetch_paged(&series, since, until).await {
                Ok(rows) => {
                    store.insert_batch(&rows)?;
                    info!(series = %series, rows = rows.len(), "Backfill complete");
                }
                // Not fatal: the reconciler repairs whatever is missing.
                Err(e) => warn!(series = %series, error = %e, "Backfill failed"),
            }
        }

        // Stream connector
        let connector = StreamConnector::new(
            series.clone(),
            config.ws_url.clone(),
            Duration::from_secs(config.connect_budget_secs),
        );
        {
            let conn = connector.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.run().await {
                    error!(error = %e, "Stream connector exited with error");
                }
            });
        }

        // Integrity reconciler
        let reconciler = IntegrityReconciler::new(
            series.clone(),
            store,
            fetcher.clone(),
            Duration::from_secs(config.reconcile_cadence_secs),
            connector.live_buffer(),
        );
        {
            let stop = stop_rx.clone();
            tokio::spawn(async move { reconciler.run(stop).await });
        }

        // Live synchronizer: ordered finalized stream.
        {
            let rx = connector.subscribe();
            let series = series.clone();
            let fetcher = fetcher.clone();
            let preload_depth = config.preload_depth;
            let staleness = Duration::from_secs(config.staleness_secs);
            let history_budget = Duration::from_secs(config.history_budget_secs);
            tokio::spawn(async move {
                let mut sync = match LiveSync::start(
                    series.clone(),
                    fetcher,
                    rx,
                    preload_depth,
                    staleness,
                    history_budget,
                )
                .await
                {
                    Ok(sync) => sync,
                    Err(e) => {
                        error!(series = %series, error = %e, "Live sync failed to start");
                        return;
                    }
                };

                loop {
                    match sync.pull().await {
                        Ok(Some(candle)) => info!(
                            series = %series,
                            open_time = candle.open_time,
                            close = candle.close,
                            volume = candle.volume,
                            "candle finalized"
                        ),
                        Ok(None) => {
                            info!(series = %series, "Live stream ended");
                            return;
                        }
                        Err(e) => {
                            error!(series = %series, error = %e, "Live sync failed");
                            return;
                        }
                    }
                }
            });
        }

        connectors.push(connector);
    }

    info!(count = connectors.len(), "All pipelines running. Press Ctrl+C to stop.");

    // ── 3. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let _ = stop_tx.send(true);
    for connector in &connectors {
        connector.stop();
    }
    // Give the pipelines a moment to drain and close their sockets.
    tokio::time::sleep(Duration::from_millis(500)).await;

    info!("Meridian Feed shut down complete.");
    Ok(())
}
