//! Event-time watermark tracking
//!
//! The watermark of a rule is the smallest latest-seen timestamp across all
//! of its input streams, minus the late tolerance. It is only defined once
//! every input stream has produced at least one tuple, and it never recedes.
//!
//! Tuples older than the last emitted watermark are late and dropped by the
//! window operator.

use crate::tuple::Tuple;
use rill_core::{Window, WindowType};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Window end used when the next window cannot be determined yet.
pub const UNKNOWN_WINDOW_END: i64 = i64::MAX;

/// Per-stream watermark tracker
#[derive(Debug, Clone)]
pub struct WatermarkGenerator {
    input_topics: Vec<String>,
    topic_to_ts: FxHashMap<String, i64>,
    late_tolerance: i64,
    last_watermark: i64,
}

/// Serializable watermark progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkState {
    pub topic_to_ts: Vec<(String, i64)>,
    pub last_watermark: i64,
}

impl WatermarkGenerator {
    pub fn new(input_topics: Vec<String>, late_tolerance: i64) -> Self {
        Self {
            input_topics,
            topic_to_ts: FxHashMap::default(),
            late_tolerance,
            last_watermark: 0,
        }
    }

    /// Record a tuple's timestamp. Returns `false` when the tuple is late.
    pub fn track(&mut self, topic: &str, ts: i64) -> bool {
        let current = self.topic_to_ts.entry(topic.to_string()).or_insert(ts);
        if ts > *current {
            *current = ts;
        }
        ts >= self.last_watermark
    }

    /// Watermark implied by the tracked timestamps, if every input has
    /// been seen.
    pub fn compute(&self) -> Option<i64> {
        if self.input_topics.is_empty() {
            return None;
        }
        self.input_topics
            .iter()
            .map(|t| self.topic_to_ts.get(t).copied())
            .collect::<Option<Vec<_>>>()
            .and_then(|all| all.into_iter().min())
            .map(|min| min - self.late_tolerance)
    }

    /// Move the watermark forward. Returns the new watermark when it
    /// advanced.
    pub fn advance(&mut self) -> Option<i64> {
        let watermark = self.compute()?;
        if watermark > self.last_watermark {
            tracing::debug!(watermark, last = self.last_watermark, "watermark advanced");
            self.last_watermark = watermark;
            Some(watermark)
        } else {
            None
        }
    }

    pub fn last_watermark(&self) -> i64 {
        self.last_watermark
    }

    pub fn snapshot(&self) -> WatermarkState {
        let mut topic_to_ts: Vec<_> = self
            .topic_to_ts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        topic_to_ts.sort();
        WatermarkState {
            topic_to_ts,
            last_watermark: self.last_watermark,
        }
    }

    pub fn restore(&mut self, state: WatermarkState) {
        self.topic_to_ts = state.topic_to_ts.into_iter().collect();
        self.last_watermark = state.last_watermark;
    }
}

/// Smallest multiple of `interval` at or after `ts`.
pub fn align_up(ts: i64, interval: i64) -> i64 {
    if interval <= 0 || ts.rem_euclid(interval) == 0 {
        return ts;
    }
    (ts.div_euclid(interval) + 1) * interval
}

fn earliest_event(inputs: &[Tuple], after: i64, up_to: i64) -> i64 {
    inputs
        .iter()
        .map(|t| t.timestamp)
        .filter(|ts| *ts > after && *ts <= up_to)
        .min()
        .unwrap_or(UNKNOWN_WINDOW_END)
}

/// End of the next tumbling, hopping or sliding window after `current`.
pub fn next_window_end(window: &Window, inputs: &[Tuple], current: i64, watermark: i64) -> i64 {
    match window.window_type {
        WindowType::Tumbling | WindowType::Hopping => {
            let interval = match window.window_type {
                WindowType::Hopping => window.interval,
                _ => window.length,
            };
            if current > 0 {
                return current + interval;
            }
            match earliest_event(inputs, current, watermark) {
                UNKNOWN_WINDOW_END => UNKNOWN_WINDOW_END,
                ts => align_up(ts, interval),
            }
        }
        WindowType::Sliding => earliest_event(inputs, current, watermark),
        _ => UNKNOWN_WINDOW_END,
    }
}

/// End of the next session window and whether it closes on the lifetime
/// tick rather than an inactivity gap. `inputs` is sorted by timestamp.
///
/// A session whose last tuple is more than a gap behind `watermark` ends one
/// gap after that tuple.
pub fn next_session_end(window: &Window, inputs: &mut [Tuple], watermark: i64) -> (i64, bool) {
    inputs.sort_by_key(|t| t.timestamp);
    let Some(first) = inputs.first().map(|t| t.timestamp) else {
        return (UNKNOWN_WINDOW_END, false);
    };
    let (gap, duration) = (window.interval, window.length);

    let mut tick = align_up(first, duration);
    let mut prev = 0i64;
    for tuple in inputs.iter() {
        let mut end = UNKNOWN_WINDOW_END;
        let mut ticked = false;
        if prev > 0 && tuple.timestamp - prev > gap {
            end = prev + gap;
        }
        if tuple.timestamp > tick {
            if tick - duration > first && tick < end {
                end = tick;
                ticked = true;
            }
            tick += duration;
        }
        if end < UNKNOWN_WINDOW_END {
            return (end, ticked);
        }
        prev = tuple.timestamp;
    }
    if prev > 0 && watermark - prev > gap {
        return (prev + gap, false);
    }
    (UNKNOWN_WINDOW_END, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::TimeUnit;

    fn at(emitter: &str, ts: i64) -> Tuple {
        Tuple::new(emitter, rill_core::ValueMap::new(), ts)
    }

    #[test]
    fn test_undefined_until_every_input_seen() {
        let mut wm = WatermarkGenerator::new(vec!["a".into(), "b".into()], 1000);
        assert!(wm.track("a", 5000));
        assert_eq!(wm.compute(), None);
        assert_eq!(wm.advance(), None);

        assert!(wm.track("b", 3000));
        assert_eq!(wm.advance(), Some(2000));
    }

    #[test]
    fn test_min_over_inputs_never_recedes() {
        let mut wm = WatermarkGenerator::new(vec!["a".into(), "b".into()], 0);
        wm.track("a", 10_000);
        wm.track("b", 8_000);
        assert_eq!(wm.advance(), Some(8_000));

        // Older tuple from b does not lower its max.
        assert!(!wm.track("b", 7_000));
        assert_eq!(wm.advance(), None);
        assert_eq!(wm.last_watermark(), 8_000);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut wm = WatermarkGenerator::new(vec!["demo".into()], 0);
        wm.track("demo", 4_000);
        wm.advance();
        let state = wm.snapshot();

        let mut restored = WatermarkGenerator::new(vec!["demo".into()], 0);
        restored.restore(state.clone());
        assert_eq!(restored.snapshot(), state);
        assert!(!restored.track("demo", 3_000));
    }

    #[test]
    fn test_next_tumbling_window_aligns_first_event() {
        let window = Window::new(WindowType::Tumbling, Some(TimeUnit::Second), 10_000);
        let inputs = vec![at("demo", 12_500), at("demo", 15_000)];
        assert_eq!(next_window_end(&window, &inputs, 0, 30_000), 20_000);
        assert_eq!(next_window_end(&window, &inputs, 20_000, 30_000), 30_000);
        assert_eq!(next_window_end(&window, &[], 0, 30_000), UNKNOWN_WINDOW_END);
        assert_eq!(align_up(20_000, 10_000), 20_000);
    }

    #[test]
    fn test_next_sliding_window_is_next_event() {
        let window = Window::new(WindowType::Sliding, Some(TimeUnit::Second), 1_000);
        let inputs = vec![at("demo", 1_500), at("demo", 1_200), at("demo", 2_000)];
        assert_eq!(next_window_end(&window, &inputs, 1_200, 1_800), 1_500);
    }

    #[test]
    fn test_session_closes_on_gap() {
        let mut window = Window::new(WindowType::Session, Some(TimeUnit::Second), 60_000);
        window.interval = 1_000;
        let mut inputs = vec![at("demo", 62_000), at("demo", 60_200), at("demo", 60_500)];
        assert_eq!(next_session_end(&window, &mut inputs, 62_000), (61_500, false));
        assert_eq!(inputs[0].timestamp, 60_200);
    }

    #[test]
    fn test_idle_session_closes_behind_watermark() {
        let mut window = Window::new(WindowType::Session, Some(TimeUnit::Second), 60_000);
        window.interval = 1_000;
        let mut inputs = vec![at("demo", 60_500), at("demo", 60_200)];
        // Still within the gap of the last tuple.
        assert_eq!(
            next_session_end(&window, &mut inputs, 61_000),
            (UNKNOWN_WINDOW_END, false)
        );
        assert_eq!(next_session_end(&window, &mut inputs, 61_501), (61_500, false));
        assert_eq!(next_session_end(&window, &mut [], 90_000), (UNKNOWN_WINDOW_END, false));
    }
}
