// =============================================================================
// Upstream futures REST client — warmup klines and funding rate.
// =============================================================================
//
// Both endpoints consumed here are public (no request signing) — retargeted
// from the teacher's `binance/client.rs` spot endpoints to the futures
// market-data endpoints this engine depends on. Timeout and `reqwest::Client`
// construction follow the same pattern as the teacher's client.

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::Bar;

#[derive(Clone)]
pub struct FuturesRestClient {
    base_url: String,
    client: reqwest::Client,
}

/// A single funding rate observation.
#[derive(Debug, Clone, Copy)]
pub struct FundingObservation {
    pub funding_time: i64,
    pub funding_rate: f64,
}

impl FuturesRestClient {
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

    /// GET /fapi/v1/klines — ordered oldest-first. Fields consumed: open_time(0),
    /// open(1), high(2), low(3), close(4), volume(5), close_time(6), trades(8).
    #[instrument(skip(self), name = "futures_rest::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        end_time: Option<i64>,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={end}"));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("futures GET /fapi/v1/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 9 {
                warn!(elements = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1])?;
            let high = parse_str_f64(&arr[2])?;
            let low = parse_str_f64(&arr[3])?;
            let close = parse_str_f64(&arr[4])?;
            let volume = parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);
            let trades = arr[8].as_i64().unwrap_or(0);

            bars.push(Bar {
                open_time,
                close_time,
                open,
                high,
                low,
                close,
                volume,
                trades,
                is_closed: true,
            });
        }

        debug!(symbol, interval, count = bars.len(), "warmup klines fetched");
        Ok(bars)
    }

    /// GET /fapi/v1/fundingRate?symbol=&limit=1.
    #[instrument(skip(self), name = "futures_rest::get_latest_funding_rate")]
    pub async fn get_latest_funding_rate(&self, symbol: &str) -> Result<Option<FundingObservation>> {
        let url = format!("{}/fapi/v1/fundingRate?symbol={}&limit=1", self.base_url, symbol);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/fundingRate request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse fundingRate response")?;

        if !status.is_success() {
            anyhow::bail!("futures GET /fapi/v1/fundingRate returned {}: {}", status, body);
        }

        let Some(entry) = body.as_array().and_then(|a| a.first()) else {
            return Ok(None);
        };

        let funding_time = entry["fundingTime"].as_i64().context("missing fundingTime")?;
        let funding_rate = parse_str_f64(&entry["fundingRate"])?;

        Ok(Some(FundingObservation {
            funding_time,
            funding_rate,
        }))
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>().with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_str_f64_handles_string_and_number() {
        assert_eq!(parse_str_f64(&serde_json::json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_str_f64(&serde_json::json!(2.5)).unwrap(), 2.5);
        assert!(parse_str_f64(&serde_json::json!(null)).is_err());
    }
}
