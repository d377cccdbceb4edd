pub mod deriv_api;
pub mod digits;
pub mod manager;
pub mod structs;
pub mod tracker;

pub use digits::last_digit;
pub use manager::DigitManager;
pub use structs::{
    DigitCount, DigitUpdate, FrequencySnapshot, HistoricalTick, StatsError, StreamEvent,
    TrackerOptions, TrackerState, DIGIT_COUNT,
};
pub use tracker::DigitFrequencyTracker;
