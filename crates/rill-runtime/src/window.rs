//! Window operator
//!
//! Buffers tuples of every input stream and emits them as a
//! [`WindowTuplesSet`] when a window closes. Supported kinds:
//! - Tumbling and hopping windows, closed by an aligned ticker
//! - Session windows, closed by an inactivity gap or their maximum lifetime
//! - Sliding windows, closed by each arriving tuple (optionally delayed)
//! - Count windows, closed every `interval` tuples
//!
//! In processing time the operator is driven by [`on_tuple`] and by the
//! deadlines it reports through [`next_deadline`]. In event time windows are
//! closed by the watermark, which advances as tuples arrive.
//!
//! The operator itself is synchronous; the topology drives it from a task
//! that also listens to the clock.
//!
//! [`on_tuple`]: WindowOperator::on_tuple
//! [`next_deadline`]: WindowOperator::next_deadline

use crate::clock::next_aligned;
use crate::error::{EvalError, EvalResult};
use crate::evaluator::{as_condition, ValuerEval};
use crate::tuple::{Tuple, WindowRange, WindowTuplesSet};
use crate::valuer::{MultiValuer, FUNCTIONS};
use crate::watermark::{
    next_session_end, next_window_end, WatermarkGenerator, WatermarkState, UNKNOWN_WINDOW_END,
};
use rill_core::{Expr, Window, WindowType};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lateness of a processing-time trigger, in ms, that is worth a warning.
const TRIGGER_LAG_WARN_MS: i64 = 100;

/// Checkpointed window progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub inputs: Vec<Tuple>,
    pub trigger_time: i64,
    pub msg_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<WatermarkState>,
}

pub struct WindowOperator {
    window: Window,
    is_event_time: bool,
    state: WindowState,
    watermark: Option<WatermarkGenerator>,

    // Event time
    next_window_end: i64,
    prev_window_end: i64,
    last_ticked: bool,

    // Processing time
    next_tick: Option<i64>,
    session_deadline: Option<i64>,
    delayed: Vec<i64>,
}

impl WindowOperator {
    /// `inputs` are the reference names of the streams feeding the window.
    pub fn new(window: Window, is_event_time: bool, inputs: Vec<String>, late_tolerance: i64) -> Self {
        let watermark = is_event_time.then(|| WatermarkGenerator::new(inputs, late_tolerance));
        Self {
            window,
            is_event_time,
            state: WindowState::default(),
            watermark,
            next_window_end: UNKNOWN_WINDOW_END,
            prev_window_end: 0,
            last_ticked: false,
            next_tick: None,
            session_deadline: None,
            delayed: Vec::new(),
        }
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Number of buffered tuples.
    pub fn buffered(&self) -> usize {
        self.state.inputs.len()
    }

    fn count_interval(&self) -> i64 {
        if self.window.interval > 0 {
            self.window.interval
        } else {
            self.window.length
        }
    }

    fn tick_interval(&self) -> Option<i64> {
        match self.window.window_type {
            WindowType::Tumbling | WindowType::Session => Some(self.window.length),
            WindowType::Hopping => Some(self.window.interval),
            WindowType::Sliding | WindowType::Count => None,
        }
    }

    /// Arm the timers. Restored tumbling and hopping windows first catch up
    /// with the windows that closed while the rule was stopped.
    pub fn start(&mut self, now: i64) -> Vec<WindowTuplesSet> {
        let mut out = Vec::new();
        if self.is_event_time {
            return out;
        }
        if self.state.trigger_time <= 0 {
            self.state.trigger_time = now;
        } else if matches!(
            self.window.window_type,
            WindowType::Tumbling | WindowType::Hopping
        ) && !self.state.inputs.is_empty()
        {
            if let Some(interval) = self.tick_interval().filter(|i| *i > 0) {
                let mut next = self.state.trigger_time + interval;
                while next <= now {
                    debug!(trigger = next, "resume window");
                    out.extend(self.scan(next));
                    next += interval;
                }
            }
        }
        if let Some(interval) = self.tick_interval().filter(|i| *i > 0) {
            self.next_tick = Some(next_aligned(now, interval));
        }
        out
    }

    /// Earliest pending processing-time deadline.
    pub fn next_deadline(&self) -> Option<i64> {
        [
            self.next_tick,
            self.session_deadline,
            self.delayed.first().copied(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every deadline at or before `now`, in deadline order.
    pub fn on_timer(&mut self, now: i64) -> Vec<WindowTuplesSet> {
        let mut out = Vec::new();
        while let Some(deadline) = self.next_deadline().filter(|d| *d <= now) {
            if self.next_tick == Some(deadline) {
                self.tick(deadline, &mut out);
            } else if self.session_deadline == Some(deadline) {
                self.session_deadline = None;
                debug!(trigger = deadline, "session window timed out");
                out.extend(self.scan(deadline));
                self.state.inputs.clear();
            } else {
                self.delayed.remove(0);
                out.extend(self.scan(deadline));
            }
        }
        out
    }

    fn tick(&mut self, at: i64, out: &mut Vec<WindowTuplesSet>) {
        let interval = self.tick_interval().unwrap_or(0);
        self.next_tick = (interval > 0).then_some(at + interval);
        if self.window.window_type == WindowType::Session {
            match self.state.inputs.first() {
                Some(first) if at - self.window.length >= first.timestamp => {}
                _ => return,
            }
        }
        out.extend(self.scan(at));
    }

    /// Buffer one tuple, returning any windows it closes.
    pub fn on_tuple(&mut self, tuple: Tuple) -> EvalResult<Vec<WindowTuplesSet>> {
        if let Some(filter) = &self.window.filter {
            if !eval_condition(filter, &tuple)? {
                return Ok(Vec::new());
            }
        }
        if self.is_event_time {
            return Ok(self.on_event_tuple(tuple));
        }

        let ts = tuple.timestamp;
        let mut out = Vec::new();
        match self.window.window_type {
            WindowType::Tumbling | WindowType::Hopping => self.state.inputs.push(tuple),
            WindowType::Session => {
                if self.state.inputs.is_empty() {
                    self.state.trigger_time = ts;
                }
                self.state.inputs.push(tuple);
                self.session_deadline = Some(ts + self.window.interval);
            }
            WindowType::Sliding => {
                let triggered = match &self.window.trigger_condition {
                    Some(cond) => eval_condition(cond, &tuple)?,
                    None => true,
                };
                self.state.inputs.push(tuple);
                if triggered {
                    if self.window.delay > 0 {
                        let at = ts + self.window.delay;
                        let pos = self.delayed.partition_point(|d| *d <= at);
                        self.delayed.insert(pos, at);
                    } else {
                        out.extend(self.scan(ts));
                    }
                }
            }
            WindowType::Count => {
                self.state.inputs.push(tuple);
                self.state.msg_count += 1;
                if self.state.msg_count % self.count_interval() == 0 {
                    self.state.msg_count = 0;
                    out.extend(self.emit_count(ts));
                }
            }
        }
        Ok(out)
    }

    fn emit_count(&mut self, now: i64) -> Option<WindowTuplesSet> {
        let size = self.window.length.max(1) as usize;
        let len = self.state.inputs.len();
        if len < size {
            return None;
        }
        let range = WindowRange::new(self.state.trigger_time, now);
        self.state.trigger_time = now;
        let mut set = WindowTuplesSet::new().with_range(range);
        for tuple in &self.state.inputs[len - size..] {
            set.add_tuple(tuple.clone());
        }
        self.state.inputs.drain(..len - size + 1);
        Some(set)
    }

    // ========================================================================
    // Event time
    // ========================================================================

    fn on_event_tuple(&mut self, tuple: Tuple) -> Vec<WindowTuplesSet> {
        if self.state.trigger_time == 0 {
            self.state.trigger_time = tuple.timestamp;
        }
        let Some(watermark) = self.watermark.as_mut() else {
            return Vec::new();
        };
        if !watermark.track(&tuple.emitter, tuple.timestamp) {
            debug!(
                emitter = %tuple.emitter,
                ts = tuple.timestamp,
                watermark = watermark.last_watermark(),
                "drop late tuple"
            );
            return Vec::new();
        }
        self.state.inputs.push(tuple);
        match watermark.advance() {
            Some(wm) => self.on_watermark(wm),
            None => Vec::new(),
        }
    }

    fn next_event_window(&mut self, watermark: i64) -> (i64, bool) {
        match self.window.window_type {
            WindowType::Session => {
                next_session_end(&self.window, &mut self.state.inputs, watermark)
            }
            _ => (
                next_window_end(&self.window, &self.state.inputs, self.prev_window_end, watermark),
                false,
            ),
        }
    }

    fn on_watermark(&mut self, watermark: i64) -> Vec<WindowTuplesSet> {
        let mut out = Vec::new();
        let (mut end, mut ticked) = (self.next_window_end, false);
        if end == UNKNOWN_WINDOW_END
            || matches!(
                self.window.window_type,
                WindowType::Session | WindowType::Sliding
            )
        {
            (end, ticked) = self.next_event_window(watermark);
        }
        while end <= watermark && end >= 0 {
            if self.window.window_type == WindowType::Session && !self.last_ticked {
                if let Some(first) = self.state.inputs.first() {
                    self.state.trigger_time = first.timestamp;
                }
            }
            if end > 0 {
                out.extend(self.scan(end));
            }
            self.prev_window_end = end;
            self.last_ticked = ticked;
            (end, ticked) = self.next_event_window(watermark);
        }
        self.next_window_end = end;
        out
    }

    // ========================================================================
    // Scan
    // ========================================================================

    fn cal_delta(&self, trigger: i64) -> i64 {
        if !matches!(
            self.window.window_type,
            WindowType::Hopping | WindowType::Sliding
        ) {
            return 0;
        }
        let last = self.state.trigger_time;
        if last <= 0 {
            return i64::from(i16::MAX);
        }
        if !self.is_event_time && self.window.interval > 0 {
            let delta = trigger - last - self.window.interval;
            if delta > TRIGGER_LAG_WARN_MS {
                warn!(delta, trigger, "window trigger is late");
            }
            return delta;
        }
        0
    }

    /// Emit the buffered tuples at or before `trigger` and drop the ones no
    /// later window can contain.
    fn scan(&mut self, trigger: i64) -> Option<WindowTuplesSet> {
        let delta = self.cal_delta(trigger);
        let length = self.window.length + self.window.delay;
        let overlapping = matches!(
            self.window.window_type,
            WindowType::Hopping | WindowType::Sliding
        );

        let mut set = WindowTuplesSet::new();
        let inputs = std::mem::take(&mut self.state.inputs);
        for tuple in inputs {
            if overlapping && trigger - tuple.timestamp > length + delta {
                continue;
            }
            let keep = overlapping || tuple.timestamp > trigger;
            if tuple.timestamp <= trigger {
                if keep {
                    set.add_tuple(tuple.clone());
                } else {
                    set.add_tuple(tuple);
                    continue;
                }
            }
            self.state.inputs.push(tuple);
        }

        let mut start = match self.window.window_type {
            WindowType::Tumbling | WindowType::Session => self.state.trigger_time,
            WindowType::Hopping => self.state.trigger_time - self.window.interval,
            _ => trigger - length,
        };
        if start <= 0 {
            start = trigger - length;
        }
        self.state.trigger_time = trigger;

        if set.is_empty() {
            return None;
        }
        if self.is_event_time {
            set.sort();
        }
        debug!(start, end = trigger, tuples = set.len(), "window closed");
        Some(set.with_range(WindowRange::new(start, trigger)))
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn snapshot(&self) -> WindowState {
        WindowState {
            watermark: self.watermark.as_ref().map(WatermarkGenerator::snapshot),
            ..self.state.clone()
        }
    }

    pub fn restore(&mut self, mut state: WindowState) {
        if let (Some(generator), Some(saved)) = (self.watermark.as_mut(), state.watermark.take()) {
            generator.restore(saved);
        }
        debug!(
            buffered = state.inputs.len(),
            trigger_time = state.trigger_time,
            "restore window state"
        );
        self.state = state;
        self.next_window_end = UNKNOWN_WINDOW_END;
        self.prev_window_end = 0;
    }
}

fn eval_condition(expr: &Expr, tuple: &Tuple) -> EvalResult<bool> {
    let valuer = MultiValuer::new(vec![tuple, &FUNCTIONS]);
    let v = ValuerEval::new(&valuer).eval(expr)?;
    as_condition(&v).ok_or_else(|| {
        EvalError::msg(format!(
            "window condition returns non-bool value {}",
            v.describe()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{BinOp, TimeUnit, Value};

    const START: i64 = 1_541_152_486_000;

    fn demo(color: &str, size: i64, ts: i64) -> Tuple {
        Tuple::new(
            "demo",
            [("color", Value::from(color)), ("size", Value::Int(size))]
                .into_iter()
                .collect::<crate::tuple::Message>(),
            ts,
        )
    }

    fn colors(set: &WindowTuplesSet) -> Vec<String> {
        set.tuples()
            .filter_map(|t| t.message.value("color").map(|v| v.to_string()))
            .collect()
    }

    fn window(window_type: WindowType, length: i64, interval: i64) -> Window {
        let mut w = Window::new(window_type, Some(TimeUnit::Second), length);
        w.interval = interval;
        w
    }

    fn feed(op: &mut WindowOperator, tuples: Vec<Tuple>) -> Vec<WindowTuplesSet> {
        let mut out = Vec::new();
        for t in tuples {
            out.extend(op.on_timer(t.timestamp));
            out.extend(op.on_tuple(t).unwrap());
        }
        out
    }

    #[test]
    fn test_hopping_window_emits_overlapping_batches() {
        let mut op = WindowOperator::new(
            window(WindowType::Hopping, 2000, 1000),
            false,
            vec!["demo".into()],
            0,
        );
        assert!(op.start(START).is_empty());
        assert_eq!(op.next_deadline(), Some(START + 1000));

        let mut out = feed(
            &mut op,
            vec![
                demo("red", 3, START + 13),
                demo("blue", 6, START + 822),
                demo("blue", 2, START + 1632),
                demo("yellow", 4, START + 2442),
            ],
        );
        out.extend(op.on_timer(START + 3000));

        assert_eq!(out.len(), 3);
        assert_eq!(colors(&out[0]), vec!["red", "blue"]);
        assert_eq!(colors(&out[1]), vec!["red", "blue", "blue"]);
        assert_eq!(colors(&out[2]), vec!["blue", "yellow"]);
        assert_eq!(out[2].range, Some(WindowRange::new(START + 1000, START + 3000)));
    }

    #[test]
    fn test_tumbling_window_drops_emitted_tuples() {
        let mut op = WindowOperator::new(
            window(WindowType::Tumbling, 1000, 0),
            false,
            vec!["demo".into()],
            0,
        );
        op.start(START);
        let mut out = feed(
            &mut op,
            vec![demo("red", 1, START + 100), demo("blue", 2, START + 1100)],
        );
        out.extend(op.on_timer(START + 2000));
        assert_eq!(out.len(), 2);
        assert_eq!(colors(&out[1]), vec!["blue"]);
        assert_eq!(out[1].range, Some(WindowRange::new(START + 1000, START + 2000)));
        assert_eq!(op.buffered(), 0);
    }

    #[test]
    fn test_empty_windows_are_not_emitted() {
        let mut op = WindowOperator::new(
            window(WindowType::Tumbling, 1000, 0),
            false,
            vec!["demo".into()],
            0,
        );
        op.start(START);
        assert!(op.on_timer(START + 5000).is_empty());
    }

    #[test]
    fn test_count_window_slides_by_interval() {
        let mut op = WindowOperator::new(
            window(WindowType::Count, 2, 1),
            false,
            vec!["demo".into()],
            0,
        );
        op.start(START);
        let out = feed(
            &mut op,
            vec![
                demo("a", 1, START + 1),
                demo("b", 2, START + 2),
                demo("c", 3, START + 3),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(colors(&out[0]), vec!["a", "b"]);
        assert_eq!(colors(&out[1]), vec!["b", "c"]);
    }

    #[test]
    fn test_count_window_defaults_interval_to_length() {
        let mut op = WindowOperator::new(
            window(WindowType::Count, 2, 0),
            false,
            vec!["demo".into()],
            0,
        );
        op.start(START);
        let out = feed(
            &mut op,
            (1..=5).map(|i| demo("x", i, START + i)).collect(),
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_session_window_closes_after_gap() {
        let mut op = WindowOperator::new(
            window(WindowType::Session, 60_000, 1000),
            false,
            vec!["demo".into()],
            0,
        );
        op.start(START);
        let mut out = feed(
            &mut op,
            vec![demo("red", 1, START + 100), demo("blue", 2, START + 600)],
        );
        assert!(out.is_empty());
        assert_eq!(op.next_deadline(), Some(START + 1600));
        out.extend(op.on_timer(START + 1600));
        assert_eq!(out.len(), 1);
        assert_eq!(colors(&out[0]), vec!["red", "blue"]);
        assert_eq!(op.buffered(), 0);
    }

    #[test]
    fn test_sliding_window_with_trigger_condition() {
        let mut w = window(WindowType::Sliding, 1000, 0);
        w.trigger_condition = Some(Box::new(Expr::binary(
            BinOp::Gt,
            Expr::field("size"),
            Expr::Integer(2),
        )));
        let mut op = WindowOperator::new(w, false, vec!["demo".into()], 0);
        op.start(START);
        let out = feed(
            &mut op,
            vec![
                demo("red", 1, START + 100),
                demo("blue", 5, START + 300),
                demo("gray", 1, START + 1500),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(colors(&out[0]), vec!["red", "blue"]);
    }

    #[test]
    fn test_sliding_window_delay() {
        let mut w = window(WindowType::Sliding, 1000, 0);
        w.delay = 500;
        let mut op = WindowOperator::new(w, false, vec!["demo".into()], 0);
        op.start(START);
        let mut out = feed(
            &mut op,
            vec![demo("red", 1, START + 100), demo("blue", 2, START + 300)],
        );
        assert!(out.is_empty());
        out.extend(op.on_timer(START + 600));
        assert_eq!(out.len(), 1);
        assert_eq!(colors(&out[0]), vec!["red", "blue"]);
    }

    #[test]
    fn test_window_filter_drops_tuples() {
        let mut w = window(WindowType::Tumbling, 1000, 0);
        w.filter = Some(Box::new(Expr::binary(
            BinOp::Eq,
            Expr::field("color"),
            Expr::Str("red".into()),
        )));
        let mut op = WindowOperator::new(w, false, vec!["demo".into()], 0);
        op.start(START);
        feed(
            &mut op,
            vec![demo("red", 1, START + 100), demo("blue", 2, START + 200)],
        );
        assert_eq!(op.buffered(), 1);
    }

    #[test]
    fn test_event_time_tumbling_drops_late_tuples() {
        let mut op = WindowOperator::new(
            window(WindowType::Tumbling, 1000, 0),
            true,
            vec!["demo".into()],
            0,
        );
        op.start(0);
        let out = feed(
            &mut op,
            vec![
                demo("a", 1, 10_100),
                demo("b", 2, 10_600),
                demo("c", 3, 11_200),
                demo("late", 4, 10_900),
                demo("d", 5, 12_100),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(colors(&out[0]), vec!["a", "b"]);
        assert_eq!(out[0].range, Some(WindowRange::new(10_100, 11_000)));
        assert_eq!(colors(&out[1]), vec!["c"]);
        assert_eq!(out[1].range, Some(WindowRange::new(11_000, 12_000)));
    }

    #[test]
    fn test_snapshot_restore_resumes_buffer() {
        let mut op = WindowOperator::new(
            window(WindowType::Tumbling, 1000, 0),
            false,
            vec!["demo".into()],
            0,
        );
        op.start(START);
        feed(&mut op, vec![demo("red", 1, START + 100)]);
        let state = op.snapshot();
        let json = serde_json::to_string(&state).unwrap();

        let mut restored = WindowOperator::new(
            window(WindowType::Tumbling, 1000, 0),
            false,
            vec!["demo".into()],
            0,
        );
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.buffered(), 1);
        let out = restored.start(START + 1500);
        assert_eq!(out.len(), 1);
        assert_eq!(colors(&out[0]), vec!["red"]);
    }
}
