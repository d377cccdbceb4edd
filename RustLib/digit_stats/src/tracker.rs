use crate::digits::last_digit;
use crate::structs::{DigitCount, FrequencySnapshot, StatsError, TrackerState, DIGIT_COUNT};
use std::collections::VecDeque;

/// Rolling buffer of last digits for one symbol, newest digit at index 0.
///
/// One producer calls [`ingest`](Self::ingest); any number of readers may ask
/// for a [`snapshot`](Self::snapshot) over a prefix of the buffer.
#[derive(Debug, Clone)]
pub struct DigitFrequencyTracker {
    capacity: usize,
    items: VecDeque<u8>,
}

impl DigitFrequencyTracker {
    pub fn new(capacity: usize) -> Result<Self, StatsError> {
        Self::with_seed(capacity, &[])
    }

    /// Build a tracker pre-filled with `seed` (newest first). Only the newest
    /// `capacity` digits are kept.
    pub fn with_seed(capacity: usize, seed: &[u8]) -> Result<Self, StatsError> {
        let mut tracker = Self {
            capacity: 1,
            items: VecDeque::new(),
        };
        tracker.initialize(capacity, seed)?;
        Ok(tracker)
    }

    pub fn from_state(state: &TrackerState) -> Result<Self, StatsError> {
        Self::with_seed(state.capacity, &state.items)
    }

    /// Replace the buffer with a fresh one of `capacity`, seeded newest first.
    /// On error the tracker is left untouched.
    pub fn initialize(&mut self, capacity: usize, seed: &[u8]) -> Result<(), StatsError> {
        if capacity == 0 {
            return Err(StatsError::InvalidArgument(
                "capacity must be greater than 0".to_string(),
            ));
        }
        if let Some(bad) = seed.iter().find(|&&d| d > 9) {
            return Err(StatsError::InvalidArgument(format!(
                "seed digit {} is not in 0-9",
                bad
            )));
        }

        let mut items = VecDeque::with_capacity(capacity);
        items.extend(seed.iter().take(capacity).copied());

        self.capacity = capacity;
        self.items = items;
        Ok(())
    }

    /// Derive the quote's last digit, push it as newest and return it.
    pub fn ingest(&mut self, quote: f64) -> Result<u8, StatsError> {
        let digit = last_digit(quote)?;
        self.push_front_evicting(digit);
        Ok(digit)
    }

    /// Same as `ingest` for a digit that was already derived.
    pub fn push_digit(&mut self, digit: u8) -> Result<(), StatsError> {
        if digit > 9 {
            return Err(StatsError::InvalidArgument(format!(
                "digit {} is not in 0-9",
                digit
            )));
        }
        self.push_front_evicting(digit);
        Ok(())
    }

    fn push_front_evicting(&mut self, digit: u8) {
        self.items.push_front(digit);
        while self.items.len() > self.capacity {
            self.items.pop_back();
        }
    }

    /// Per-digit counts and percentages over the newest `window_size` digits.
    ///
    /// `window_size` must lie in `[1, capacity]`. A window longer than the
    /// buffer counts what is there, and percentages are taken over that
    /// effective sample.
    pub fn snapshot(&self, window_size: usize) -> Result<FrequencySnapshot, StatsError> {
        if window_size == 0 || window_size > self.capacity {
            return Err(StatsError::InvalidArgument(format!(
                "window size {} outside [1, {}]",
                window_size, self.capacity
            )));
        }

        let mut counts = [0usize; DIGIT_COUNT];
        for &d in self.items.iter().take(window_size) {
            counts[d as usize] += 1;
        }
        let sample_size = window_size.min(self.items.len());

        let digits = counts
            .iter()
            .enumerate()
            .map(|(digit, &count)| DigitCount {
                digit: digit as u8,
                count,
                percentage: round_percentage(count, sample_size),
            })
            .collect();

        Ok(FrequencySnapshot {
            window: window_size,
            sample_size,
            digits,
        })
    }

    pub fn reset(&mut self) {
        self.items.clear();
    }

    pub fn export_state(&self) -> TrackerState {
        TrackerState {
            capacity: self.capacity,
            items: self.items.iter().copied().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Most recent digit
    pub fn latest(&self) -> Option<u8> {
        self.items.front().copied()
    }

    /// Digits newest first
    pub fn digits(&self) -> impl Iterator<Item = u8> + '_ {
        self.items.iter().copied()
    }
}

// round(count / sample * 100), half up, in integers
fn round_percentage(count: usize, sample: usize) -> u32 {
    if sample == 0 {
        return 0;
    }
    ((count * 200 + sample) / (2 * sample)) as u32
}
