use crate::structs::HistoricalTick;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

/// Deriv messages the relay cares about. Everything else is `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivMessage {
    Tick {
        symbol: String,
        quote: f64,
        epoch: u64,
        subscription_id: Option<String>,
    },
    /// `ticks_history` answer, oldest first
    History {
        symbol: String,
        ticks: Vec<HistoricalTick>,
    },
    Error { code: String, message: String },
    Other(String),
}

pub fn ws_url(base: &str, app_id: &str) -> String {
    format!("{}?app_id={}", base, app_id)
}

pub fn tick_history_request(symbol: &str, count: usize) -> Value {
    json!({
        "ticks_history": symbol,
        "adjust_start_time": 1,
        "count": count,
        "end": "latest",
        "style": "ticks"
    })
}

pub fn tick_subscribe_request(symbol: &str) -> Value {
    json!({
        "ticks": symbol,
        "subscribe": 1
    })
}

pub fn forget_all_ticks_request() -> Value {
    json!({ "forget_all": "ticks" })
}

// Deriv sends prices as numbers, but some proxies stringify them
fn as_f64_flexible(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str()?.parse().ok())
}

fn as_u64_flexible(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str()?.parse().ok())
}

pub fn parse_message(text: &str) -> Result<DerivMessage> {
    let v: Value = serde_json::from_str(text)?;

    if let Some(error) = v.get("error") {
        let code = error
            .get("code")
            .and_then(|c| c.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        return Ok(DerivMessage::Error { code, message });
    }

    let msg_type = v
        .get("msg_type")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    match msg_type.as_str() {
        "tick" => {
            let tick = v
                .get("tick")
                .ok_or_else(|| anyhow::anyhow!("tick message without tick body"))?;
            let symbol = tick
                .get("symbol")
                .and_then(|s| s.as_str())
                .ok_or_else(|| anyhow::anyhow!("tick without symbol"))?
                .to_string();
            let quote = tick
                .get("quote")
                .and_then(as_f64_flexible)
                .ok_or_else(|| anyhow::anyhow!("tick without quote for {}", symbol))?;
            let epoch = tick.get("epoch").and_then(as_u64_flexible).unwrap_or(0);
            let subscription_id = v
                .get("subscription")
                .and_then(|s| s.get("id"))
                .and_then(|id| id.as_str())
                .map(str::to_string);

            Ok(DerivMessage::Tick {
                symbol,
                quote,
                epoch,
                subscription_id,
            })
        }
        "history" => {
            let symbol = v
                .get("echo_req")
                .and_then(|e| e.get("ticks_history"))
                .and_then(|s| s.as_str())
                .unwrap_or_default()
                .to_string();
            let history = v.get("history");
            let prices = history
                .and_then(|h| h.get("prices"))
                .and_then(|p| p.as_array())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let times = history
                .and_then(|h| h.get("times"))
                .and_then(|t| t.as_array())
                .map(Vec::as_slice)
                .unwrap_or_default();

            // prices[i] was quoted at times[i]
            let ticks = prices
                .iter()
                .enumerate()
                .filter_map(|(i, price)| {
                    Some(HistoricalTick {
                        quote: as_f64_flexible(price)?,
                        epoch: times.get(i).and_then(as_u64_flexible).unwrap_or(0),
                    })
                })
                .collect();

            Ok(DerivMessage::History { symbol, ticks })
        }
        _ => Ok(DerivMessage::Other(msg_type)),
    }
}

/// One-shot fetch of the latest `count` ticks for `symbol`, oldest first.
pub async fn fetch_tick_history(
    ws_url: &str,
    symbol: &str,
    count: usize,
) -> Result<Vec<HistoricalTick>> {
    let url = Url::parse(ws_url)?;
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(tick_history_request(symbol, count).to_string()))
        .await?;

    while let Some(msg) = read.next().await {
        if let Message::Text(text) = msg? {
            match parse_message(&text)? {
                DerivMessage::History { ticks, .. } => {
                    let _ = write.close().await;
                    return Ok(ticks);
                }
                DerivMessage::Error { code, message } => {
                    return Err(anyhow::anyhow!(
                        "Deriv API Error for {}: {} ({})",
                        symbol,
                        message,
                        code
                    ));
                }
                _ => {}
            }
        }
    }

    Err(anyhow::anyhow!("Connection closed without history for {}", symbol))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tick() {
        let raw = r#"{
            "echo_req": {"subscribe": 1, "ticks": "R_100"},
            "msg_type": "tick",
            "subscription": {"id": "a1b2c3"},
            "tick": {"ask": 1234.57, "bid": 1234.55, "epoch": 1700000001,
                     "id": "a1b2c3", "pip_size": 2, "quote": 1234.56, "symbol": "R_100"}
        }"#;
        match parse_message(raw).unwrap() {
            DerivMessage::Tick {
                symbol,
                quote,
                epoch,
                subscription_id,
            } => {
                assert_eq!(symbol, "R_100");
                assert_eq!(quote, 1234.56);
                assert_eq!(epoch, 1700000001);
                assert_eq!(subscription_id.as_deref(), Some("a1b2c3"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_history() {
        let raw = r#"{
            "echo_req": {"ticks_history": "R_50", "count": 3, "end": "latest", "style": "ticks"},
            "history": {"prices": [101.11, "101.12", 101.13], "times": [1, 2, 3]},
            "msg_type": "history",
            "pip_size": 4
        }"#;
        assert_eq!(
            parse_message(raw).unwrap(),
            DerivMessage::History {
                symbol: "R_50".to_string(),
                ticks: vec![
                    HistoricalTick { quote: 101.11, epoch: 1 },
                    HistoricalTick { quote: 101.12, epoch: 2 },
                    HistoricalTick { quote: 101.13, epoch: 3 },
                ],
            }
        );
    }

    #[test]
    fn test_parse_history_keeps_prices_and_times_aligned() {
        let raw = r#"{
            "echo_req": {"ticks_history": "R_10"},
            "history": {"prices": [6.21, null, 6.23], "times": [998, "999", 1000]},
            "msg_type": "history"
        }"#;
        let ticks = match parse_message(raw).unwrap() {
            DerivMessage::History { ticks, .. } => ticks,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            ticks,
            vec![
                HistoricalTick { quote: 6.21, epoch: 998 },
                HistoricalTick { quote: 6.23, epoch: 1000 },
            ]
        );

        let no_times = r#"{"echo_req": {"ticks_history": "R_10"},
                           "history": {"prices": [6.21]}, "msg_type": "history"}"#;
        match parse_message(no_times).unwrap() {
            DerivMessage::History { ticks, .. } => assert_eq!(ticks[0].epoch, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_error() {
        let raw = r#"{"error": {"code": "InvalidSymbol", "message": "Symbol XYZ is invalid."},
                      "msg_type": "ticks"}"#;
        assert_eq!(
            parse_message(raw).unwrap(),
            DerivMessage::Error {
                code: "InvalidSymbol".to_string(),
                message: "Symbol XYZ is invalid.".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_other_and_garbage() {
        let raw = r#"{"msg_type": "ping", "ping": "pong"}"#;
        assert_eq!(
            parse_message(raw).unwrap(),
            DerivMessage::Other("ping".to_string())
        );
        assert!(parse_message("not json").is_err());
    }

    #[test]
    fn test_request_shapes() {
        let req = tick_history_request("R_100", 500);
        assert_eq!(req["ticks_history"], "R_100");
        assert_eq!(req["count"], 500);
        assert_eq!(req["style"], "ticks");
        assert_eq!(tick_subscribe_request("R_10")["subscribe"], 1);
        assert_eq!(
            ws_url("wss://ws.derivws.com/websockets/v3", "1089"),
            "wss://ws.derivws.com/websockets/v3?app_id=1089"
        );
    }
}
