// Browser-facing message types

use digit_stats::{DigitUpdate, FrequencySnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub reconnects: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub snapshot: FrequencySnapshot,
}

/// Everything pushed to dashboards over /ws.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    DigitUpdate(DigitUpdate),
    ConnectionStatus(ConnectionStatus),
    Snapshot(SymbolSnapshot),
    Error { message: String },
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClientCommand {
    pub command: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub window: Option<usize>,
}
