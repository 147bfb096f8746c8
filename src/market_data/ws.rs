// =============================================================================
// Bar ingestion WebSocket — combined kline stream for 15m + 1h.
// =============================================================================
//
// Adapted from the teacher's `candle_buffer.rs::run_kline_stream` parsing
// style, retargeted to the futures combined-stream URL and emitting `Bar`
// updates over a channel instead of mutating a shared ring directly — the
// caller (the bar ingestion task in `main.rs`) owns the ordering/commit
// decision (on_kline_update vs on_kline_close).

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::Bar;

/// One decoded kline frame: which interval it belongs to, the bar payload,
/// and whether it is the closed (final) revision of that bar.
#[derive(Debug, Clone)]
pub struct BarUpdate {
    pub interval: String,
    pub bar: Bar,
}

pub fn combined_stream_url(base_ws_url: &str, symbol: &str, intervals: &[&str]) -> String {
    let lower = symbol.to_lowercase();
    let streams: Vec<String> = intervals
        .iter()
        .map(|iv| format!("{lower}@kline_{iv}"))
        .collect();
    format!("{base_ws_url}/stream?streams={}", streams.join("/"))
}

/// Connect to the combined kline stream and forward decoded updates over
/// `tx` until the stream ends or errors. The caller is responsible for
/// reconnecting with backoff.
pub async fn run_bar_stream(
    base_ws_url: &str,
    symbol: &str,
    intervals: &[&str],
    tx: mpsc::Sender<BarUpdate>,
) -> Result<()> {
    let url = combined_stream_url(base_ws_url, symbol, intervals);
    info!(url = %url, symbol = %symbol, "connecting to bar ingestion WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to bar ingestion WebSocket")?;

    info!(symbol = %symbol, "bar ingestion WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_combined_frame(&text) {
                    Ok(update) => {
                        debug!(interval = %update.interval, close = update.bar.close, closed = update.bar.is_closed, "bar update");
                        if tx.send(update).await.is_err() {
                            warn!("bar ingestion channel closed — stopping stream reader");
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse bar frame"),
                }
            }
            Some(Ok(_)) => {
                // Ping/Pong/Binary/Close -- tungstenite handles pong replies itself.
            }
            Some(Err(e)) => {
                error!(error = %e, "bar ingestion WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "bar ingestion WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn parse_combined_frame(text: &str) -> Result<BarUpdate> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse frame JSON")?;
    let data = if root.get("data").is_some() { &root["data"] } else { &root };

    let k = &data["k"];
    let interval = k["i"].as_str().context("missing field k.i")?.to_string();
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;
    let open = parse_str_f64(&k["o"])?;
    let high = parse_str_f64(&k["h"])?;
    let low = parse_str_f64(&k["l"])?;
    let close = parse_str_f64(&k["c"])?;
    let volume = parse_str_f64(&k["v"])?;
    let trades = k["n"].as_i64().unwrap_or(0);
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok(BarUpdate {
        interval,
        bar: Bar {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            trades,
            is_closed,
        },
    })
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s.parse::<f64>().with_context(|| format!("failed to parse f64: {s}")),
        serde_json::Value::Number(n) => n.as_f64().context("not a valid f64"),
        _ => anyhow::bail!("unexpected JSON type for numeric field"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_contains_both_interval_streams() {
        let url = combined_stream_url("wss://fstream.binance.com", "BTCUSDT", &["15m", "1h"]);
        assert!(url.contains("btcusdt@kline_15m"));
        assert!(url.contains("btcusdt@kline_1h"));
        assert!(url.starts_with("wss://fstream.binance.com/stream?streams="));
    }

    #[test]
    fn parse_combined_frame_ok() {
        let json = r#"{
            "stream": "btcusdt@kline_15m",
            "data": { "e": "kline", "s": "BTCUSDT", "k": {
                "t": 1700000000000, "T": 1700000899999, "i": "15m",
                "o": "100.0", "h": "101.0", "l": "99.0", "c": "100.5",
                "v": "10.0", "n": 5, "x": true
            }}
        }"#;
        let update = parse_combined_frame(json).expect("should parse");
        assert_eq!(update.interval, "15m");
        assert!(update.bar.is_closed);
        assert!((update.bar.close - 100.5).abs() < f64::EPSILON);
    }
}
