//! Record types flowing between operators
//!
//! A [`Tuple`] is one event from one stream. Windows batch tuples into a
//! [`WindowTuplesSet`], joins merge them into [`JoinTuple`]s, and the
//! aggregate operator partitions either kind into [`GroupedTuples`]. Each of
//! these implements [`Valuer`] so the evaluator can read fields from it, and
//! the batch types also implement [`AggregateData`].

use crate::error::EvalResult;
use crate::valuer::{aggregate_over, AggregateData, Valuer};
use rill_core::{Expr, Value, ValueMap, DEFAULT_STREAM};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Message
// ============================================================================

/// Field map of a tuple. Lookups try the exact key first, then ignore case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(ValueMap);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.0.get(key).or_else(|| {
            self.0
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn as_map(&self) -> &ValueMap {
        &self.0
    }

    pub fn into_map(self) -> ValueMap {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<ValueMap> for Message {
    fn from(map: ValueMap) -> Self {
        Message(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Message {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Message(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ============================================================================
// Tuple
// ============================================================================

/// One event of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
    /// Name the stream is referenced by in the rule (alias or stream name).
    pub emitter: String,
    pub message: Message,
    #[serde(default)]
    pub metadata: ValueMap,
    /// Epoch milliseconds, processing or event time.
    pub timestamp: i64,
}

impl Tuple {
    pub fn new(emitter: impl Into<String>, message: impl Into<Message>, timestamp: i64) -> Self {
        Self {
            emitter: emitter.into(),
            message: message.into(),
            metadata: ValueMap::new(),
            timestamp,
        }
    }

    pub fn with_metadata(mut self, metadata: ValueMap) -> Self {
        self.metadata = metadata;
        self
    }

    fn matches(&self, table: Option<&str>) -> bool {
        match table {
            None => true,
            Some(t) => t == DEFAULT_STREAM || t.eq_ignore_ascii_case(&self.emitter),
        }
    }
}

fn lookup(map: &ValueMap, key: &str) -> Option<Value> {
    map.get(key)
        .or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
        })
        .cloned()
}

impl Valuer for Tuple {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        if !self.matches(table) {
            return None;
        }
        self.message.value(key).cloned()
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        if !self.matches(table) {
            return None;
        }
        if key == "*" {
            return Some(Value::Map(self.metadata.clone()));
        }
        lookup(&self.metadata, key)
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        if !self.matches(table) {
            return None;
        }
        Some(self.message.as_map().clone())
    }
}

// ============================================================================
// Window batches
// ============================================================================

/// Time span covered by one window emission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRange {
    pub start: i64,
    pub end: i64,
}

impl WindowRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

/// Buffered tuples of one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowTuples {
    pub emitter: String,
    pub tuples: Vec<Tuple>,
}

/// One window emission, one entry per contributing stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowTuplesSet {
    pub content: Vec<WindowTuples>,
    pub range: Option<WindowRange>,
}

impl WindowTuplesSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range: WindowRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Append to the entry of the tuple's emitter, creating it on first use.
    pub fn add_tuple(&mut self, tuple: Tuple) {
        match self.content.iter_mut().find(|w| w.emitter == tuple.emitter) {
            Some(w) => w.tuples.push(tuple),
            None => self.content.push(WindowTuples {
                emitter: tuple.emitter.clone(),
                tuples: vec![tuple],
            }),
        }
    }

    pub fn get_by_src(&self, src: &str) -> &[Tuple] {
        self.content
            .iter()
            .find(|w| w.emitter == src)
            .map(|w| w.tuples.as_slice())
            .unwrap_or(&[])
    }

    /// Order each stream's tuples by timestamp, keeping arrival order on ties.
    pub fn sort(&mut self) {
        for w in &mut self.content {
            w.tuples.sort_by_key(|t| t.timestamp);
        }
    }

    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.content.iter().flat_map(|w| w.tuples.iter())
    }

    pub fn len(&self) -> usize {
        self.content.iter().map(|w| w.tuples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Valuer for WindowTuplesSet {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.tuples().next().and_then(|t| t.value(key, table))
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.tuples().next().and_then(|t| t.meta(key, table))
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        self.tuples().next().and_then(|t| t.all(table))
    }

    fn window_range(&self) -> Option<WindowRange> {
        self.range
    }

    fn as_aggregate(&self) -> Option<&dyn AggregateData> {
        Some(self)
    }
}

impl AggregateData for WindowTuplesSet {
    fn aggregate_eval(&self, expr: &Expr) -> EvalResult<Vec<Value>> {
        aggregate_over(self.tuples().map(|t| t as &dyn Valuer), expr)
    }
}

// ============================================================================
// Join results
// ============================================================================

/// Tuples of several streams merged by a join
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinTuple {
    pub tuples: Vec<Arc<Tuple>>,
}

impl JoinTuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tuple(&mut self, tuple: Arc<Tuple>) {
        self.tuples.push(tuple);
    }

    pub fn add_tuples(&mut self, tuples: &[Arc<Tuple>]) {
        self.tuples.extend(tuples.iter().cloned());
    }

    fn by_emitter(&self, table: &str) -> Option<&Tuple> {
        self.tuples
            .iter()
            .find(|t| t.emitter.eq_ignore_ascii_case(table))
            .map(|t| t.as_ref())
    }

    fn qualified(table: Option<&str>) -> Option<&str> {
        table.filter(|t| *t != DEFAULT_STREAM)
    }
}

impl Valuer for JoinTuple {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        match Self::qualified(table) {
            Some(t) => self.by_emitter(t).and_then(|tuple| tuple.message.value(key).cloned()),
            None => self
                .tuples
                .iter()
                .find_map(|tuple| tuple.message.value(key).cloned()),
        }
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        match Self::qualified(table) {
            Some(t) => self.by_emitter(t).and_then(|tuple| tuple.meta(key, None)),
            None => self.tuples.iter().find_map(|tuple| tuple.meta(key, None)),
        }
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        match Self::qualified(table) {
            Some(t) => self.by_emitter(t).map(|tuple| tuple.message.as_map().clone()),
            None => {
                let mut merged = ValueMap::new();
                for tuple in &self.tuples {
                    for (k, v) in tuple.message.as_map() {
                        if !merged.contains_key(k) {
                            merged.insert(k.clone(), v.clone());
                        }
                    }
                }
                Some(merged)
            }
        }
    }
}

/// Result of one join round
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinTupleSets {
    pub content: Vec<JoinTuple>,
    pub range: Option<WindowRange>,
}

impl JoinTupleSets {
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

impl Valuer for JoinTupleSets {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.content.first().and_then(|j| j.value(key, table))
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.content.first().and_then(|j| j.meta(key, table))
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        self.content.first().and_then(|j| j.all(table))
    }

    fn window_range(&self) -> Option<WindowRange> {
        self.range
    }

    fn as_aggregate(&self) -> Option<&dyn AggregateData> {
        Some(self)
    }
}

impl AggregateData for JoinTupleSets {
    fn aggregate_eval(&self, expr: &Expr) -> EvalResult<Vec<Value>> {
        aggregate_over(self.content.iter().map(|j| j as &dyn Valuer), expr)
    }
}

// ============================================================================
// Groups
// ============================================================================

/// A record that can be grouped: a plain tuple or a join result.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Tuple(Tuple),
    Join(JoinTuple),
}

impl Row {
    fn valuer(&self) -> &dyn Valuer {
        match self {
            Row::Tuple(t) => t,
            Row::Join(j) => j,
        }
    }
}

impl Valuer for Row {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.valuer().value(key, table)
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.valuer().meta(key, table)
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        self.valuer().all(table)
    }
}

/// Rows sharing one GROUP BY key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedTuples {
    pub content: Vec<Row>,
    pub range: Option<WindowRange>,
}

impl Valuer for GroupedTuples {
    fn value(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.content.first().and_then(|r| r.value(key, table))
    }

    fn meta(&self, key: &str, table: Option<&str>) -> Option<Value> {
        self.content.first().and_then(|r| r.meta(key, table))
    }

    fn all(&self, table: Option<&str>) -> Option<ValueMap> {
        self.content.first().and_then(|r| r.all(table))
    }

    fn window_range(&self) -> Option<WindowRange> {
        self.range
    }

    fn as_aggregate(&self) -> Option<&dyn AggregateData> {
        Some(self)
    }
}

impl AggregateData for GroupedTuples {
    fn aggregate_eval(&self, expr: &Expr) -> EvalResult<Vec<Value>> {
        aggregate_over(self.content.iter().map(|r| r as &dyn Valuer), expr)
    }
}

/// Groups of one window emission, in first-seen key order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedTuplesSet {
    pub groups: Vec<GroupedTuples>,
}

// ============================================================================
// Pipeline items
// ============================================================================

/// Payload passed between operators
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Tuple(Tuple),
    Window(WindowTuplesSet),
    Join(JoinTupleSets),
    Group(GroupedTuplesSet),
    /// Projected output rows, ready for a sink.
    Rows(Vec<ValueMap>),
}

impl Data {
    pub fn kind(&self) -> &'static str {
        match self {
            Data::Tuple(_) => "tuple",
            Data::Window(_) => "window",
            Data::Join(_) => "join",
            Data::Group(_) => "group",
            Data::Rows(_) => "rows",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(emitter: &str, pairs: &[(&str, Value)], ts: i64) -> Tuple {
        Tuple::new(
            emitter,
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Message>(),
            ts,
        )
    }

    #[test]
    fn test_message_lookup_falls_back_to_case_insensitive() {
        let t = tuple("demo", &[("Color", "red".into()), ("color", "blue".into())], 0);
        assert_eq!(t.value("color", None), Some("blue".into()));
        assert_eq!(t.value("COLOR", None), Some("red".into()));
        assert_eq!(t.value("size", None), None);
    }

    #[test]
    fn test_tuple_qualified_lookup() {
        let t = tuple("src1", &[("id", 1.into())], 0);
        assert_eq!(t.value("id", Some("src1")), Some(Value::Int(1)));
        assert_eq!(t.value("id", Some(DEFAULT_STREAM)), Some(Value::Int(1)));
        assert_eq!(t.value("id", Some("src2")), None);
    }

    #[test]
    fn test_meta_star_returns_all_metadata() {
        let mut meta = ValueMap::new();
        meta.insert("topic".into(), "a/b".into());
        let t = tuple("demo", &[], 0).with_metadata(meta.clone());
        assert_eq!(t.meta("*", None), Some(Value::Map(meta)));
        assert_eq!(t.meta("Topic", None), Some("a/b".into()));
    }

    #[test]
    fn test_window_set_groups_by_emitter() {
        let mut set = WindowTuplesSet::new();
        set.add_tuple(tuple("src1", &[("id", 2.into())], 20));
        set.add_tuple(tuple("src2", &[("id", 9.into())], 5));
        set.add_tuple(tuple("src1", &[("id", 1.into())], 10));
        assert_eq!(set.content.len(), 2);
        assert_eq!(set.get_by_src("src1").len(), 2);
        assert!(set.get_by_src("src3").is_empty());

        set.sort();
        assert_eq!(set.get_by_src("src1")[0].timestamp, 10);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_join_tuple_lookup_rules() {
        let a = Arc::new(tuple("src1", &[("id", 1.into()), ("f", "a".into())], 0));
        let b = Arc::new(tuple("src2", &[("id", 2.into()), ("g", "b".into())], 0));
        let mut j = JoinTuple::new();
        j.add_tuples(&[a, b]);

        assert_eq!(j.value("id", None), Some(Value::Int(1)));
        assert_eq!(j.value("id", Some("src2")), Some(Value::Int(2)));
        assert_eq!(j.value("g", Some("src1")), None);

        let all = j.all(None).unwrap();
        assert_eq!(all.get("id"), Some(&Value::Int(1)));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_grouped_aggregate_eval() {
        let group = GroupedTuples {
            content: vec![
                Row::Tuple(tuple("demo", &[("size", 3.into())], 0)),
                Row::Tuple(tuple("demo", &[], 0)),
            ],
            range: None,
        };
        let values = group.aggregate_eval(&Expr::field("size")).unwrap();
        assert_eq!(values, vec![Value::Int(3), Value::Null]);
    }
}
