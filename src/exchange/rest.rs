// =============================================================================
// Exchange REST client — public market-candle endpoints
// =============================================================================
//
// Only public market data is fetched; no request signing is involved. The
// exchange returns candle rows newest-first as arrays of decimal strings;
// everything is normalized to ascending order of open time.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::exchange::CandleFetcher;
use crate::types::{Candle, Series};

/// REST client for the exchange's public market-data endpoints.
#[derive(Debug, Clone)]
pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// GET a candle endpoint and parse the standard response envelope.
    async fn get_candles(&self, url: &str) -> Result<Vec<Candle>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse candles response")?;

        if !status.is_success() {
            anyhow::bail!("exchange returned {status}: {body}");
        }

        parse_candles_response(&body)
    }
}

#[async_trait]
impl CandleFetcher for RestClient {
    /// GET /api/v5/market/history-candles (or /candles when unbounded).
    ///
    /// `since`/`until` map to the exchange's exclusive `before`/`after`
    /// pagination parameters.
    async fn fetch_candles(
        &self,
        series: &Series,
        since: Option<i64>,
        until: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>> {
        let bar = series.interval.exchange_bar();
        let endpoint = if since.is_some() || until.is_some() {
            "history-candles"
        } else {
            "candles"
        };

        let mut url = format!(
            "{}/api/v5/market/{}?instId={}&bar={}",
            self.base_url, endpoint, series.symbol, bar
        );
        if let Some(ts) = since {
            url.push_str(&format!("&before={ts}"));
        }
        if let Some(ts) = until {
            url.push_str(&format!("&after={ts}"));
        }
        if let Some(n) = limit {
            url.push_str(&format!("&limit={n}"));
        }

        let candles = self.get_candles(&url).await?;
        debug!(series = %series, count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

/// Parse the exchange response envelope into ascending candles.
///
/// Expected shape:
/// ```json
/// { "code": "0", "msg": "", "data": [["1700000000000","o","h","l","c","vol", ...], ...] }
/// ```
/// Rows arrive newest-first and are reversed to ascending open time.
fn parse_candles_response(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let code = body["code"].as_str().unwrap_or("");
    if code != "0" {
        anyhow::bail!(
            "exchange error code {code}: {}",
            body["msg"].as_str().unwrap_or("unknown")
        );
    }

    let rows = body["data"]
        .as_array()
        .context("candles response missing 'data' array")?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = row.as_array().context("candle row is not an array")?;
        if arr.len() < 6 {
            warn!("skipping malformed candle row with {} elements", arr.len());
            continue;
        }

        candles.push(Candle::new(
            parse_str_i64(&arr[0])?,
            parse_str_f64(&arr[1])?,
            parse_str_f64(&arr[2])?,
            parse_str_f64(&arr[3])?,
            parse_str_f64(&arr[4])?,
            parse_str_f64(&arr[5])?,
        ));
    }

    // Newest-first on the wire; consumers want oldest-first.
    candles.reverse();
    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

fn parse_str_i64(val: &serde_json::Value) -> Result<i64> {
    if let Some(s) = val.as_str() {
        s.parse::<i64>()
            .with_context(|| format!("failed to parse '{s}' as i64"))
    } else if let Some(n) = val.as_i64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}
