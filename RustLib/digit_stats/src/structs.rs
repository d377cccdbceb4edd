use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of distinct last digits (0-9).
pub const DIGIT_COUNT: usize = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    /// Maximum number of digits kept per symbol
    pub capacity: usize,
    /// Window used for snapshots pushed on every tick
    pub default_window: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            capacity: 500,
            default_window: 100,
        }
    }
}

impl TrackerOptions {
    pub fn validate(&self) -> Result<(), StatsError> {
        if self.capacity == 0 {
            return Err(StatsError::InvalidArgument(
                "capacity must be greater than 0".to_string(),
            ));
        }
        if self.default_window == 0 || self.default_window > self.capacity {
            return Err(StatsError::InvalidArgument(format!(
                "default_window {} outside [1, {}]",
                self.default_window, self.capacity
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigitCount {
    pub digit: u8,
    pub count: usize,
    pub percentage: u32,
}

/// Per-digit distribution over the newest `window` digits of a buffer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FrequencySnapshot {
    /// Requested window size
    pub window: usize,
    /// Digits actually counted: min(window, buffer length)
    pub sample_size: usize,
    /// Always ten entries, ordered by digit
    pub digits: Vec<DigitCount>,
}

impl FrequencySnapshot {
    pub fn count(&self, digit: u8) -> usize {
        self.digits
            .get(digit as usize)
            .map(|d| d.count)
            .unwrap_or(0)
    }

    pub fn percentage(&self, digit: u8) -> u32 {
        self.digits
            .get(digit as usize)
            .map(|d| d.percentage)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.digits.iter().map(|d| d.count).sum()
    }

    /// Digit with the highest count, lower digit wins ties. None when empty.
    pub fn most_frequent(&self) -> Option<u8> {
        if self.sample_size == 0 {
            return None;
        }
        self.digits
            .iter()
            .fold(None::<&DigitCount>, |best, d| match best {
                Some(b) if b.count >= d.count => Some(b),
                _ => Some(d),
            })
            .map(|d| d.digit)
    }

    /// Digit with the lowest count, lower digit wins ties. None when empty.
    pub fn least_frequent(&self) -> Option<u8> {
        if self.sample_size == 0 {
            return None;
        }
        self.digits
            .iter()
            .fold(None::<&DigitCount>, |best, d| match best {
                Some(b) if b.count <= d.count => Some(b),
                _ => Some(d),
            })
            .map(|d| d.digit)
    }
}

/// Exported buffer contents, newest digit first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TrackerState {
    pub capacity: usize,
    pub items: Vec<u8>,
}

/// Result of feeding one tick into a symbol's tracker.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DigitUpdate {
    pub symbol: String,
    pub quote: f64,
    pub digit: u8,
    pub epoch: u64,
    pub time_display: String,
    pub snapshot: FrequencySnapshot,
}

/// One quote from a `ticks_history` answer. `epoch` is 0 when the
/// broker did not send times.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct HistoricalTick {
    pub quote: f64,
    pub epoch: u64,
}

/// Events published by the shared tick stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected { url: String },
    TickArrived { symbol: String, quote: f64, epoch: u64 },
    /// Historical ticks, oldest first
    HistoryLoaded {
        symbol: String,
        ticks: Vec<HistoricalTick>,
    },
    ConnectionLost { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_from_counts(counts: [usize; DIGIT_COUNT]) -> FrequencySnapshot {
        let total: usize = counts.iter().sum();
        FrequencySnapshot {
            window: total.max(1),
            sample_size: total,
            digits: counts
                .iter()
                .enumerate()
                .map(|(d, &count)| DigitCount {
                    digit: d as u8,
                    count,
                    percentage: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(TrackerOptions::default().validate().is_ok());
        let zero = TrackerOptions {
            capacity: 0,
            default_window: 1,
        };
        assert!(matches!(zero.validate(), Err(StatsError::InvalidArgument(_))));
        let too_wide = TrackerOptions {
            capacity: 100,
            default_window: 101,
        };
        assert!(too_wide.validate().is_err());
    }

    #[test]
    fn test_most_and_least_frequent_break_ties_low() {
        let snap = snapshot_from_counts([2, 0, 5, 5, 1, 1, 1, 1, 1, 0]);
        assert_eq!(snap.most_frequent(), Some(2));
        assert_eq!(snap.least_frequent(), Some(1));
        assert_eq!(snap.total(), 17);
    }

    #[test]
    fn test_empty_snapshot_has_no_extremes() {
        let snap = snapshot_from_counts([0; DIGIT_COUNT]);
        assert_eq!(snap.most_frequent(), None);
        assert_eq!(snap.least_frequent(), None);
    }

    #[test]
    fn test_stream_event_is_tagged() {
        let ev = StreamEvent::TickArrived {
            symbol: "R_100".to_string(),
            quote: 1234.56,
            epoch: 1700000000,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "tick_arrived");
        assert_eq!(json["symbol"], "R_100");
    }

    #[test]
    fn test_history_event_carries_epochs() {
        let ev = StreamEvent::HistoryLoaded {
            symbol: "R_10".to_string(),
            ticks: vec![HistoricalTick {
                quote: 6.21,
                epoch: 1000,
            }],
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "history_loaded");
        assert_eq!(json["ticks"][0]["epoch"], 1000);
        assert_eq!(serde_json::from_value::<StreamEvent>(json).unwrap(), ev);
    }
}
