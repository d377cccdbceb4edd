// Shared upstream tick stream
// One Deriv connection for the whole relay, fanned out to any number of listeners

use chrono::Utc;
use digit_stats::deriv_api::{
    forget_all_ticks_request, parse_message, tick_history_request, tick_subscribe_request,
    DerivMessage,
};
use digit_stats::StreamEvent;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const MAX_ERRORS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickStreamStatus {
    pub is_running: bool,
    pub connected: bool,
    pub symbols: Vec<String>,
    pub reconnects: u64,
    pub ticks_received: u64,
    pub duplicates_dropped: u64,
    pub last_tick_time: Option<String>,
    pub errors: Vec<String>,
}

impl TickStreamStatus {
    fn push_error(&mut self, error: String) {
        self.errors
            .push(format!("{}: {}", Utc::now().format("%H:%M:%S"), error));
        if self.errors.len() > MAX_ERRORS {
            self.errors.remove(0);
        }
    }
}

/// Exponential reconnect delay: starts at `initial`, doubles, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Drops ticks whose epoch is not newer than the last one seen for the symbol.
#[derive(Debug, Default)]
pub struct TickDeduper {
    last_epoch: HashMap<String, u64>,
}

impl TickDeduper {
    /// Mark everything up to `epoch` as seen, e.g. after history was loaded.
    pub fn prime(&mut self, symbol: &str, epoch: u64) {
        let last = self.last_epoch.entry(symbol.to_string()).or_insert(0);
        *last = (*last).max(epoch);
    }

    pub fn accept(&mut self, symbol: &str, epoch: u64) -> bool {
        match self.last_epoch.get(symbol) {
            Some(&last) if epoch <= last => false,
            _ => {
                self.last_epoch.insert(symbol.to_string(), epoch);
                true
            }
        }
    }
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

pub struct TickStream {
    url: String,
    tx: broadcast::Sender<StreamEvent>,
    status: Arc<RwLock<TickStreamStatus>>,
    task_handle: Arc<RwLock<Option<(JoinHandle<()>, mpsc::Sender<String>)>>>,
    history_count: usize,
}

impl TickStream {
    pub fn new(url: String, history_count: usize, channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self {
            url,
            tx,
            status: Arc::new(RwLock::new(TickStreamStatus::default())),
            task_handle: Arc::new(RwLock::new(None)),
            history_count,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    pub async fn status(&self) -> TickStreamStatus {
        self.status.read().await.clone()
    }

    /// Start streaming `symbols`. `seen` holds the newest epoch already
    /// counted per symbol (from startup history or the cache); live ticks at
    /// or before it are dropped.
    pub async fn start(
        &self,
        symbols: Vec<String>,
        seen: Vec<(String, u64)>,
    ) -> Result<(), String> {
        {
            let status = self.status.read().await;
            if status.is_running {
                return Err("Tick stream is already running".to_string());
            }
        }

        {
            let mut status = self.status.write().await;
            *status = TickStreamStatus {
                is_running: true,
                symbols: symbols.clone(),
                ..TickStreamStatus::default()
            };
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<String>(10);
        let url = self.url.clone();
        let tx = self.tx.clone();
        let status = self.status.clone();
        let history_count = self.history_count;

        let mut deduper = TickDeduper::default();
        for (symbol, epoch) in &seen {
            deduper.prime(symbol, *epoch);
        }

        let handle = tokio::spawn(async move {
            run_stream_loop(url, symbols, history_count, deduper, tx, status, cmd_rx).await;
        });

        {
            let mut task = self.task_handle.write().await;
            *task = Some((handle, cmd_tx));
        }

        info!("🚀 Tick stream started: {}", self.url);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), String> {
        let task = { self.task_handle.write().await.take() };

        match task {
            Some((handle, cmd_tx)) => {
                let _ = cmd_tx.send("FORGET".to_string()).await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                handle.abort();
            }
            None => return Err("Tick stream is not running".to_string()),
        }

        {
            let mut status = self.status.write().await;
            status.is_running = false;
            status.connected = false;
        }

        info!("⏹️ Tick stream stopped");
        Ok(())
    }
}

async fn run_stream_loop(
    url: String,
    symbols: Vec<String>,
    history_count: usize,
    mut deduper: TickDeduper,
    tx: broadcast::Sender<StreamEvent>,
    status: Arc<RwLock<TickStreamStatus>>,
    mut cmd_rx: mpsc::Receiver<String>,
) {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

    loop {
        let end = run_session(
            &url,
            &symbols,
            history_count,
            &tx,
            &status,
            &mut cmd_rx,
            &mut backoff,
            &mut deduper,
        )
        .await;

        let reason = match end {
            SessionEnd::Stopped => break,
            SessionEnd::Lost(reason) => reason,
        };

        warn!("❌ Tick stream lost: {}", reason);
        let _ = tx.send(StreamEvent::ConnectionLost {
            reason: reason.clone(),
        });
        {
            let mut s = status.write().await;
            s.connected = false;
            s.reconnects += 1;
            s.push_error(reason);
        }

        let delay = backoff.next_delay();
        info!("🔄 Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = cmd_rx.recv() => {
                if matches!(cmd.as_deref(), Some("FORGET") | None) {
                    break;
                }
            }
        }
    }

    let mut s = status.write().await;
    s.is_running = false;
    s.connected = false;
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    url: &str,
    symbols: &[String],
    history_count: usize,
    tx: &broadcast::Sender<StreamEvent>,
    status: &Arc<RwLock<TickStreamStatus>>,
    cmd_rx: &mut mpsc::Receiver<String>,
    backoff: &mut Backoff,
    deduper: &mut TickDeduper,
) -> SessionEnd {
    let ws_stream = match connect_async(url).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => return SessionEnd::Lost(format!("WebSocket connection failed: {}", e)),
    };
    let (mut write, mut read) = ws_stream.split();

    info!("✅ Connected to Deriv: {}", url);
    backoff.reset();
    status.write().await.connected = true;
    let _ = tx.send(StreamEvent::Connected {
        url: url.to_string(),
    });

    // history first on every session: it covers whatever happened while
    // nobody was subscribed, and consumers merge it by epoch
    for symbol in symbols {
        let req = tick_history_request(symbol, history_count);
        if let Err(e) = write.send(Message::Text(req.to_string())).await {
            return SessionEnd::Lost(format!("Failed to send history request: {}", e));
        }
        let req = tick_subscribe_request(symbol);
        if let Err(e) = write.send(Message::Text(req.to_string())).await {
            return SessionEnd::Lost(format!("Failed to subscribe {}: {}", symbol, e));
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                if matches!(cmd.as_deref(), Some("FORGET") | None) {
                    debug!("📤 Sending forget_all for ticks");
                    let _ = write
                        .send(Message::Text(forget_all_ticks_request().to_string()))
                        .await;
                    let _ = write.close().await;
                    return SessionEnd::Stopped;
                }
            }

            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SessionEnd::Lost(format!("WebSocket error: {}", e)),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                };

                match parse_message(&text) {
                    Ok(DerivMessage::Tick { symbol, quote, epoch, .. }) => {
                        let mut s = status.write().await;
                        if !deduper.accept(&symbol, epoch) {
                            s.duplicates_dropped += 1;
                            continue;
                        }
                        s.ticks_received += 1;
                        s.last_tick_time = Some(Utc::now().to_rfc3339());
                        drop(s);
                        let _ = tx.send(StreamEvent::TickArrived { symbol, quote, epoch });
                    }
                    Ok(DerivMessage::History { symbol, ticks }) => {
                        if symbol.is_empty() {
                            continue;
                        }
                        info!("📊 Received {} historical ticks for {}", ticks.len(), symbol);
                        if let Some(newest) = ticks.iter().map(|t| t.epoch).max() {
                            deduper.prime(&symbol, newest);
                        }
                        let _ = tx.send(StreamEvent::HistoryLoaded { symbol, ticks });
                    }
                    Ok(DerivMessage::Error { code, message }) => {
                        warn!("❌ API Error: {} ({})", message, code);
                        status.write().await.push_error(format!("{}: {}", code, message));
                    }
                    Ok(DerivMessage::Other(_)) => {}
                    Err(e) => warn!("⚠️ Unparsable Deriv message: {}", e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_deduper_drops_repeated_and_stale_epochs() {
        let mut d = TickDeduper::default();
        assert!(d.accept("R_10", 100));
        assert!(!d.accept("R_10", 100));
        assert!(!d.accept("R_10", 99));
        assert!(d.accept("R_10", 101));
        assert!(d.accept("R_25", 100));
    }

    #[test]
    fn test_primed_deduper_drops_tick_repeating_history() {
        let mut d = TickDeduper::default();
        d.prime("R_10", 1000);
        assert!(!d.accept("R_10", 1000));
        assert!(d.accept("R_10", 1001));

        // priming never moves backwards
        d.prime("R_10", 900);
        assert!(!d.accept("R_10", 1001));
        assert!(d.accept("R_10", 1002));
    }

    #[test]
    fn test_error_list_is_capped() {
        let mut s = TickStreamStatus::default();
        for i in 0..15 {
            s.push_error(format!("e{}", i));
        }
        assert_eq!(s.errors.len(), MAX_ERRORS);
        assert!(s.errors[0].ends_with("e5"));
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let stream = TickStream::new("wss://example.invalid".to_string(), 10, 16);
        assert!(stream.stop().await.is_err());
        assert!(!stream.status().await.is_running);
    }

    #[tokio::test]
    async fn test_subscribers_share_one_channel() {
        let stream = TickStream::new("wss://example.invalid".to_string(), 10, 16);
        let mut a = stream.subscribe();
        let mut b = stream.subscribe();
        let ev = StreamEvent::ConnectionLost {
            reason: "test".to_string(),
        };
        stream.tx.send(ev.clone()).unwrap();
        assert_eq!(a.recv().await.unwrap(), ev);
        assert_eq!(b.recv().await.unwrap(), ev);
    }
}
