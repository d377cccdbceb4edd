use crate::deriv_api::fetch_tick_history;
use crate::structs::{
    DigitUpdate, FrequencySnapshot, HistoricalTick, StatsError, StreamEvent, TrackerOptions,
    TrackerState,
};
use crate::tracker::DigitFrequencyTracker;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use tokio::task;

/// Registry of one tracker per symbol.
///
/// Writers go through `get_mut`, which holds the shard lock for a single
/// ingest, so each symbol sees exactly one writer at a time.
///
/// `last_epochs` holds the newest tick epoch folded into each tracker, from
/// history or live. A tick at or before it is already counted. Lock order is
/// always `trackers` then `last_epochs`.
pub struct DigitManager {
    pub trackers: Arc<DashMap<String, DigitFrequencyTracker>>,
    last_epochs: Arc<DashMap<String, u64>>,
    pub options: TrackerOptions,
}

impl DigitManager {
    pub fn new(options: TrackerOptions) -> Result<Self, StatsError> {
        options.validate()?;
        Ok(Self {
            trackers: Arc::new(DashMap::new()),
            last_epochs: Arc::new(DashMap::new()),
            options,
        })
    }

    /// Ensure an (empty) tracker exists for `symbol`.
    pub fn track(&self, symbol: &str) -> Result<(), StatsError> {
        if self.trackers.contains_key(symbol) {
            return Ok(());
        }
        let tracker = DigitFrequencyTracker::new(self.options.capacity)?;
        self.trackers.entry(symbol.to_string()).or_insert(tracker);
        Ok(())
    }

    /// Rebuild `symbol` from historical ticks given oldest first.
    /// Returns how many digits the tracker holds afterwards.
    pub fn seed(&self, symbol: &str, ticks: &[HistoricalTick]) -> Result<usize, StatsError> {
        let mut tracker = DigitFrequencyTracker::new(self.options.capacity)?;
        let mut newest = 0;
        for tick in ticks {
            match tracker.ingest(tick.quote) {
                Ok(_) => newest = newest.max(tick.epoch),
                Err(e) => warn!("Skipping history quote for {}: {}", symbol, e),
            }
        }
        let kept = tracker.len();
        self.trackers.insert(symbol.to_string(), tracker);
        self.set_last_epoch(symbol, newest);
        debug!("Seeded {} with {} digits up to epoch {}", symbol, kept, newest);
        Ok(kept)
    }

    /// Fold history into `symbol` without counting a tick twice.
    ///
    /// When the tracker already holds digits up to a known epoch and the
    /// history reaches back to it, only the ticks after it are appended, which
    /// fills the gap left by an outage or a restored cache. History that
    /// starts after that epoch cannot bridge the gap, so the tracker is
    /// rebuilt with [`Self::seed`], as is a tracker with no known epoch.
    /// Empty history leaves an existing tracker alone.
    pub fn merge_history(
        &self,
        symbol: &str,
        ticks: &[HistoricalTick],
    ) -> Result<usize, StatsError> {
        if let Some(mut tracker) = self.trackers.get_mut(symbol) {
            let oldest = match ticks.first() {
                Some(tick) => tick.epoch,
                None => return Ok(tracker.len()),
            };
            let last = self.last_epoch(symbol).filter(|&last| oldest != 0 && oldest <= last);
            if let Some(last) = last {
                let mut newest = last;
                let mut appended = 0;
                for tick in ticks.iter().filter(|t| t.epoch > last) {
                    match tracker.ingest(tick.quote) {
                        Ok(_) => {
                            newest = newest.max(tick.epoch);
                            appended += 1;
                        }
                        Err(e) => warn!("Skipping history quote for {}: {}", symbol, e),
                    }
                }
                self.last_epochs.insert(symbol.to_string(), newest);
                debug!(
                    "Merged {} history ticks into {} up to epoch {}",
                    appended, symbol, newest
                );
                return Ok(tracker.len());
            }
        }
        self.seed(symbol, ticks)
    }

    /// Newest epoch counted for `symbol`, if any tick carried one.
    pub fn last_epoch(&self, symbol: &str) -> Option<u64> {
        self.last_epochs.get(symbol).map(|e| *e)
    }

    /// Every known `(symbol, newest epoch)`, sorted by symbol.
    pub fn last_epochs(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .last_epochs
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    // 0 means "no epoch known"
    fn set_last_epoch(&self, symbol: &str, epoch: u64) {
        if epoch == 0 {
            self.last_epochs.remove(symbol);
        } else {
            self.last_epochs.insert(symbol.to_string(), epoch);
        }
    }

    /// Fetch tick history for every symbol in parallel and merge it into the
    /// trackers (see [`Self::merge_history`]).
    pub async fn initialize(
        &self,
        ws_url: &str,
        symbols: Vec<String>,
        history_count: usize,
    ) -> Vec<(String, Result<usize, String>)> {
        let mut tasks = Vec::new();

        for symbol in symbols {
            let url = ws_url.to_string();
            tasks.push(task::spawn(async move {
                match fetch_tick_history(&url, &symbol, history_count).await {
                    Ok(ticks) => (symbol, Ok(ticks)),
                    Err(e) => (symbol, Err(e.to_string())),
                }
            }));
        }

        let mut results = Vec::new();

        for handle in tasks {
            match handle.await {
                Ok((symbol, Ok(ticks))) => {
                    let seeded = self.merge_history(&symbol, &ticks).map_err(|e| e.to_string());
                    results.push((symbol, seeded));
                }
                Ok((symbol, Err(e))) => {
                    // keep serving the symbol from live ticks
                    if let Err(track_err) = self.track(&symbol) {
                        warn!("Cannot track {}: {}", symbol, track_err);
                    }
                    results.push((symbol, Err(e)));
                }
                Err(join_err) => warn!("History task failed: {}", join_err),
            }
        }

        results
    }

    /// Feed one live tick. The tracker is created on the symbol's first tick.
    ///
    /// Returns `Ok(None)` when `epoch` is not newer than the last one counted
    /// for the symbol. Epoch 0 is never treated as a repeat.
    pub fn process_tick(
        &self,
        symbol: &str,
        quote: f64,
        epoch: u64,
    ) -> Result<Option<DigitUpdate>, StatsError> {
        self.track(symbol)?;

        let mut tracker = self
            .trackers
            .get_mut(symbol)
            .ok_or_else(|| StatsError::UnknownSymbol(symbol.to_string()))?;

        if epoch != 0 {
            if let Some(last) = self.last_epoch(symbol) {
                if epoch <= last {
                    debug!("Already counted {} tick at {} (last {})", symbol, epoch, last);
                    return Ok(None);
                }
            }
        }

        let digit = tracker.ingest(quote)?;
        if epoch != 0 {
            self.last_epochs.insert(symbol.to_string(), epoch);
        }
        let window = self.options.default_window.min(tracker.capacity());
        let snapshot = tracker.snapshot(window)?;

        Ok(Some(DigitUpdate {
            symbol: symbol.to_string(),
            quote,
            digit,
            epoch,
            time_display: format_epoch(epoch),
            snapshot,
        }))
    }

    /// Route a stream event to the right tracker. Only ticks produce an update.
    pub fn apply_event(&self, event: &StreamEvent) -> Option<DigitUpdate> {
        match event {
            StreamEvent::TickArrived {
                symbol,
                quote,
                epoch,
            } => match self.process_tick(symbol, *quote, *epoch) {
                Ok(update) => update,
                Err(e) => {
                    warn!("Dropping tick for {}: {}", symbol, e);
                    None
                }
            },
            StreamEvent::HistoryLoaded { symbol, ticks } => {
                if let Err(e) = self.merge_history(symbol, ticks) {
                    warn!("Cannot merge history for {}: {}", symbol, e);
                }
                None
            }
            StreamEvent::Connected { .. } | StreamEvent::ConnectionLost { .. } => None,
        }
    }

    pub fn snapshot(&self, symbol: &str, window: usize) -> Result<FrequencySnapshot, StatsError> {
        self.trackers
            .get(symbol)
            .ok_or_else(|| StatsError::UnknownSymbol(symbol.to_string()))?
            .snapshot(window)
    }

    /// Snapshot at the configured default window, narrowed to the tracker's
    /// capacity when it was restored with a smaller one.
    pub fn default_snapshot(&self, symbol: &str) -> Result<FrequencySnapshot, StatsError> {
        let tracker = self
            .trackers
            .get(symbol)
            .ok_or_else(|| StatsError::UnknownSymbol(symbol.to_string()))?;
        tracker.snapshot(self.options.default_window.min(tracker.capacity()))
    }

    /// Snapshots at the default window for every tracked symbol, sorted by symbol.
    pub fn all_snapshots(&self) -> Vec<(String, FrequencySnapshot)> {
        let mut out: Vec<(String, FrequencySnapshot)> = self
            .trackers
            .iter()
            .filter_map(|entry| {
                let window = self.options.default_window.min(entry.value().capacity());
                entry
                    .value()
                    .snapshot(window)
                    .ok()
                    .map(|s| (entry.key().clone(), s))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn reset(&self, symbol: &str) -> Result<(), StatsError> {
        self.trackers
            .get_mut(symbol)
            .ok_or_else(|| StatsError::UnknownSymbol(symbol.to_string()))?
            .reset();
        Ok(())
    }

    pub fn remove(&self, symbol: &str) -> bool {
        self.last_epochs.remove(symbol);
        self.trackers.remove(symbol).is_some()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.trackers.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn export_state(&self, symbol: &str) -> Result<TrackerState, StatsError> {
        Ok(self
            .trackers
            .get(symbol)
            .ok_or_else(|| StatsError::UnknownSymbol(symbol.to_string()))?
            .export_state())
    }

    pub fn export_all(&self) -> Vec<(String, TrackerState)> {
        let mut out: Vec<(String, TrackerState)> = self
            .trackers
            .iter()
            .map(|e| (e.key().clone(), e.value().export_state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Like [`Self::export_all`], paired with each buffer's newest epoch.
    /// The epoch is read under the tracker's lock so it matches the items.
    pub fn export_all_with_epochs(&self) -> Vec<(String, TrackerState, Option<u64>)> {
        let mut out: Vec<(String, TrackerState, Option<u64>)> = self
            .trackers
            .iter()
            .map(|e| {
                let last = self.last_epoch(e.key());
                (e.key().clone(), e.value().export_state(), last)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Replace `symbol` with an exported buffer. `last_epoch` is the epoch of
    /// its newest digit; pass `None` when unknown, so the next history is
    /// seeded rather than merged.
    pub fn restore(
        &self,
        symbol: &str,
        state: &TrackerState,
        last_epoch: Option<u64>,
    ) -> Result<(), StatsError> {
        let tracker = DigitFrequencyTracker::from_state(state)?;
        self.trackers.insert(symbol.to_string(), tracker);
        self.set_last_epoch(symbol, last_epoch.unwrap_or(0));
        Ok(())
    }
}

fn format_epoch(epoch: u64) -> String {
    chrono::DateTime::from_timestamp(epoch as i64, 0)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(quotes: &[f64], first_epoch: u64) -> Vec<HistoricalTick> {
        quotes
            .iter()
            .enumerate()
            .map(|(i, &quote)| HistoricalTick {
                quote,
                epoch: first_epoch + i as u64,
            })
            .collect()
    }

    fn manager(capacity: usize, default_window: usize) -> DigitManager {
        DigitManager::new(TrackerOptions {
            capacity,
            default_window,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_options() {
        assert!(DigitManager::new(TrackerOptions {
            capacity: 0,
            default_window: 0,
        })
        .is_err());
    }

    #[test]
    fn test_process_tick_creates_tracker() {
        let m = manager(10, 5);
        let update = m.process_tick("R_100", 1234.56, 1700000000).unwrap().unwrap();
        assert_eq!(update.digit, 6);
        assert_eq!(update.snapshot.window, 5);
        assert_eq!(update.snapshot.sample_size, 1);
        assert_eq!(update.snapshot.percentage(6), 100);
        assert_eq!(update.time_display, "22:13:20");
        assert_eq!(m.symbols(), vec!["R_100".to_string()]);
    }

    #[test]
    fn test_symbols_are_independent() {
        let m = manager(10, 10);
        m.process_tick("R_10", 1.11, 1).unwrap();
        m.process_tick("R_10", 1.12, 2).unwrap();
        m.process_tick("R_25", 9.99, 3).unwrap();

        assert_eq!(m.snapshot("R_10", 10).unwrap().total(), 2);
        assert_eq!(m.snapshot("R_25", 10).unwrap().count(9), 1);
        assert!(matches!(
            m.snapshot("R_50", 10),
            Err(StatsError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_seed_uses_oldest_first_history() {
        let m = manager(3, 3);
        let kept = m.seed("R_100", &history(&[1.01, 1.02, 1.03, 1.04], 50)).unwrap();
        assert_eq!(kept, 3);
        assert_eq!(m.export_state("R_100").unwrap().items, vec![4, 3, 2]);
        assert_eq!(m.last_epoch("R_100"), Some(53));
    }

    #[test]
    fn test_tick_repeating_last_history_tick_is_dropped() {
        let m = manager(10, 10);
        let loaded = StreamEvent::HistoryLoaded {
            symbol: "R_10".to_string(),
            ticks: history(&[1.21, 1.22, 1.23], 998),
        };
        assert!(m.apply_event(&loaded).is_none());

        let repeat = StreamEvent::TickArrived {
            symbol: "R_10".to_string(),
            quote: 1.23,
            epoch: 1000,
        };
        assert!(m.apply_event(&repeat).is_none());
        assert_eq!(m.export_state("R_10").unwrap().items, vec![3, 2, 1]);

        let next = StreamEvent::TickArrived {
            symbol: "R_10".to_string(),
            quote: 1.24,
            epoch: 1001,
        };
        assert_eq!(m.apply_event(&next).unwrap().digit, 4);
        assert_eq!(m.export_state("R_10").unwrap().items, vec![4, 3, 2, 1]);
        assert_eq!(m.last_epoch("R_10"), Some(1001));
    }

    #[test]
    fn test_reconnect_history_only_fills_the_gap() {
        let m = manager(10, 10);
        m.seed("R_25", &history(&[2.01, 2.02], 100)).unwrap();
        m.process_tick("R_25", 2.03, 102).unwrap().unwrap();

        // outage: 103 and 104 missed, history overlaps what is already counted
        let kept = m
            .merge_history("R_25", &history(&[2.01, 2.02, 2.03, 2.04, 2.05], 100))
            .unwrap();
        assert_eq!(kept, 5);
        assert_eq!(m.export_state("R_25").unwrap().items, vec![5, 4, 3, 2, 1]);
        assert_eq!(m.last_epoch("R_25"), Some(104));

        // the stream's first tick after resubscribing repeats 104
        assert!(m.process_tick("R_25", 2.05, 104).unwrap().is_none());
        assert_eq!(m.snapshot("R_25", 10).unwrap().total(), 5);
    }

    #[test]
    fn test_history_that_cannot_bridge_a_stale_cache_rebuilds() {
        let m = manager(10, 10);
        m.restore(
            "R_100",
            &TrackerState {
                capacity: 10,
                items: vec![9, 9, 9],
            },
            Some(100),
        )
        .unwrap();

        // ticks 101..=499 are unknown, so the cached digits cannot be kept
        let kept = m
            .merge_history("R_100", &history(&[7.71, 7.72], 500))
            .unwrap();
        assert_eq!(kept, 2);
        assert_eq!(m.export_state("R_100").unwrap().items, vec![2, 1]);
        assert_eq!(m.last_epoch("R_100"), Some(501));
    }

    #[test]
    fn test_empty_history_keeps_tracker() {
        let m = manager(10, 10);
        m.process_tick("R_75", 8.88, 5).unwrap().unwrap();
        assert_eq!(m.merge_history("R_75", &[]).unwrap(), 1);
        assert_eq!(m.export_state("R_75").unwrap().items, vec![8]);
    }

    #[test]
    fn test_history_without_times_rebuilds() {
        let m = manager(10, 10);
        m.process_tick("R_50", 3.31, 0).unwrap().unwrap();
        m.process_tick("R_50", 3.31, 0).unwrap().unwrap();
        assert_eq!(m.last_epoch("R_50"), None);

        let kept = m.merge_history("R_50", &history(&[3.37], 0)).unwrap();
        assert_eq!(kept, 1);
        assert_eq!(m.export_state("R_50").unwrap().items, vec![7]);
    }

    #[test]
    fn test_apply_event_dispatch() {
        let m = manager(10, 10);
        let loaded = StreamEvent::HistoryLoaded {
            symbol: "R_75".to_string(),
            ticks: history(&[5.55, 5.55], 8),
        };
        assert!(m.apply_event(&loaded).is_none());
        assert_eq!(m.snapshot("R_75", 10).unwrap().count(5), 2);

        let tick = StreamEvent::TickArrived {
            symbol: "R_75".to_string(),
            quote: 5.57,
            epoch: 10,
        };
        let update = m.apply_event(&tick).unwrap();
        assert_eq!(update.digit, 7);
        assert_eq!(update.snapshot.total(), 3);

        let lost = StreamEvent::ConnectionLost {
            reason: "eof".to_string(),
        };
        assert!(m.apply_event(&lost).is_none());
        // stale data stays available
        assert_eq!(m.snapshot("R_75", 10).unwrap().total(), 3);
    }

    #[test]
    fn test_bad_tick_is_dropped() {
        let m = manager(10, 10);
        let tick = StreamEvent::TickArrived {
            symbol: "R_10".to_string(),
            quote: f64::NAN,
            epoch: 1,
        };
        assert!(m.apply_event(&tick).is_none());
        assert_eq!(m.snapshot("R_10", 10).unwrap().total(), 0);
    }

    #[test]
    fn test_reset_remove_and_restore() {
        let m = manager(5, 5);
        for (epoch, q) in [(1, 1.01), (2, 1.02), (3, 1.03)] {
            m.process_tick("R_10", q, epoch).unwrap();
        }
        let state = m.export_state("R_10").unwrap();

        m.reset("R_10").unwrap();
        assert_eq!(m.snapshot("R_10", 5).unwrap().total(), 0);
        // a replayed tick stays counted-once after a reset
        assert!(m.process_tick("R_10", 1.03, 3).unwrap().is_none());

        m.restore("R_10", &state, Some(3)).unwrap();
        assert_eq!(m.export_state("R_10").unwrap(), state);
        assert_eq!(m.last_epochs(), vec![("R_10".to_string(), 3)]);
        assert_eq!(
            m.export_all_with_epochs(),
            vec![("R_10".to_string(), state.clone(), Some(3))]
        );

        assert!(m.remove("R_10"));
        assert!(!m.remove("R_10"));
        assert_eq!(m.last_epoch("R_10"), None);
        assert!(matches!(m.reset("R_10"), Err(StatsError::UnknownSymbol(_))));
    }

    #[test]
    fn test_restored_smaller_capacity_clamps_default_window() {
        let m = manager(500, 100);
        m.restore(
            "R_10",
            &TrackerState {
                capacity: 20,
                items: vec![1, 2, 3],
            },
            None,
        )
        .unwrap();
        let update = m.process_tick("R_10", 4.44, 0).unwrap().unwrap();
        assert_eq!(update.snapshot.window, 20);
        assert_eq!(m.default_snapshot("R_10").unwrap().sample_size, 4);
        assert!(m.snapshot("R_10", 100).is_err());
        assert_eq!(m.all_snapshots().len(), 1);
        assert_eq!(m.export_all()[0].1.items, vec![4, 1, 2, 3]);
    }
}
