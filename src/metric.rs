//! Metric values and their combination rules
//!
//! A [`Metric`] is a number tagged with a [`RecordType`] that decides how two
//! observations of the same metric combine:
//!
//! - `Aggregate` values are summed
//! - `Absolute` values are replaced by the incoming one
//!
//! [`Metrics`] is a name-keyed bag of metrics merged key-wise, and
//! [`EntityMeta`] pins each metric name of an entity to a single record type
//! for its whole lifetime.
//!
//! # Example
//!
//! ```rust
//! use rollup_store::metric::{Metric, Metrics};
//!
//! let mut total = Metrics::new();
//! total.insert("views", Metric::aggregate(3));
//!
//! let mut more = Metrics::new();
//! more.insert("views", Metric::aggregate(4));
//! more.insert("size", Metric::absolute(10));
//!
//! total.merge(&more).unwrap();
//! assert_eq!(total.get("views"), Some(&Metric::aggregate(7)));
//! assert_eq!(total.get("size"), Some(&Metric::absolute(10)));
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::{self, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::types::DateRange;

/// How two values of the same metric combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    /// Summed across writes and tiers
    #[default]
    #[serde(alias = "AGGREGATE")]
    Aggregate,
    /// Replaced by the incoming value
    #[serde(alias = "ABSOLUTE")]
    Absolute,
}

impl RecordType {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Aggregate => "aggregate",
            RecordType::Absolute => "absolute",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aggregate" => Ok(RecordType::Aggregate),
            "absolute" => Ok(RecordType::Absolute),
            _ => Err(ValidationError::UnknownName {
                kind: "record type",
                value: s.to_string(),
            }),
        }
    }
}

/// A numeric metric value
///
/// Integer arithmetic stays integral until it would overflow, at which point
/// the result is promoted to a float. Any float operand yields a float.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
}

impl Number {
    /// Sum of two numbers
    pub fn add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(b) {
                Some(sum) => Number::Int(sum),
                None => Number::Float(a as f64 + b as f64),
            },
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    /// Value as a float
    pub fn as_f64(&self) -> f64 {
        match *self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    /// Zero of the integer kind
    pub fn zero() -> Number {
        Number::Int(0)
    }
}

impl Default for Number {
    fn default() -> Self {
        Number::zero()
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{}", v),
            Number::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::Int(v)
    }
}

impl From<i32> for Number {
    fn from(v: i32) -> Self {
        Number::Int(v as i64)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}

/// A typed metric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Combination policy
    #[serde(rename = "type", default)]
    pub record_type: RecordType,
    /// Current value
    pub value: Number,
}

impl Metric {
    /// Create a metric
    pub fn new(record_type: RecordType, value: impl Into<Number>) -> Self {
        Self {
            record_type,
            value: value.into(),
        }
    }

    /// Create an aggregate (summed) metric
    pub fn aggregate(value: impl Into<Number>) -> Self {
        Self::new(RecordType::Aggregate, value)
    }

    /// Create an absolute (last value wins) metric
    pub fn absolute(value: impl Into<Number>) -> Self {
        Self::new(RecordType::Absolute, value)
    }

    /// Fold `other` into `self`
    ///
    /// Fails without modifying `self` if the record types differ.
    pub fn combine(&mut self, other: &Metric) -> Result<(), ValidationError> {
        if self.record_type != other.record_type {
            return Err(ValidationError::TypeMismatch {
                existing: self.record_type,
                incoming: other.record_type,
            });
        }
        self.value = match self.record_type {
            RecordType::Aggregate => self.value.add(other.value),
            RecordType::Absolute => other.value,
        };
        Ok(())
    }
}

/// Name-keyed collection of metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics {
    inner: HashMap<String, Metric>,
}

impl Metrics {
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a metric, returning the previous one
    pub fn insert(&mut self, name: impl Into<String>, metric: Metric) -> Option<Metric> {
        self.inner.insert(name.into(), metric)
    }

    /// Look up a metric
    pub fn get(&self, name: &str) -> Option<&Metric> {
        self.inner.get(name)
    }

    /// Number of metrics
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if there are no metrics
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate names and metrics
    pub fn iter(&self) -> hash_map::Iter<'_, String, Metric> {
        self.inner.iter()
    }

    /// Metric names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    /// Key-wise union with `other`, combining shared keys
    ///
    /// Destructive on `self`. Not commutative for absolute metrics: the
    /// values of `other` win. If any shared key has mismatched types the merge
    /// fails and `self` is left untouched.
    pub fn merge(&mut self, other: &Metrics) -> Result<(), ValidationError> {
        for (name, incoming) in &other.inner {
            if let Some(existing) = self.inner.get(name) {
                if existing.record_type != incoming.record_type {
                    return Err(ValidationError::TypeMismatch {
                        existing: existing.record_type,
                        incoming: incoming.record_type,
                    });
                }
            }
        }
        for (name, incoming) in &other.inner {
            match self.inner.get_mut(name) {
                Some(existing) => existing.combine(incoming)?,
                None => {
                    self.inner.insert(name.clone(), *incoming);
                },
            }
        }
        Ok(())
    }

    /// Merge a sequence of collections in order
    pub fn summarize<'a, I>(items: I) -> Result<Metrics, ValidationError>
    where
        I: IntoIterator<Item = &'a Metrics>,
    {
        let mut total = Metrics::new();
        for item in items {
            total.merge(item)?;
        }
        Ok(total)
    }

    /// Metrics whose names match `pattern`
    pub fn filter(&self, pattern: &Regex) -> Metrics {
        self.inner
            .iter()
            .filter(|(name, _)| pattern.is_match(name))
            .map(|(name, metric)| (name.clone(), *metric))
            .collect()
    }

    /// Fold every metric matching `pattern` into a single `"result"` metric
    ///
    /// With no match the result is an aggregate zero.
    pub fn combine_matching(&self, pattern: &Regex) -> Result<Metrics, ValidationError> {
        let mut matching = self
            .inner
            .iter()
            .filter(|(name, _)| pattern.is_match(name))
            .map(|(_, metric)| metric);

        let mut result = match matching.next() {
            Some(first) => *first,
            None => Metric::aggregate(0),
        };
        for metric in matching {
            result.combine(metric)?;
        }

        let mut out = Metrics::new();
        out.insert("result", result);
        Ok(out)
    }

    /// Consume into the underlying map
    pub fn into_inner(self) -> HashMap<String, Metric> {
        self.inner
    }
}

impl FromIterator<(String, Metric)> for Metrics {
    fn from_iter<T: IntoIterator<Item = (String, Metric)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Metrics {
    type Item = (String, Metric);
    type IntoIter = hash_map::IntoIter<String, Metric>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a> IntoIterator for &'a Metrics {
    type Item = (&'a String, &'a Metric);
    type IntoIter = hash_map::Iter<'a, String, Metric>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

/// Per-entity registry of metric name to record type
///
/// Entries are created on the first write of a name and never change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityMeta {
    types: HashMap<String, RecordType>,
}

impl EntityMeta {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered type of `name`, if any
    pub fn get(&self, name: &str) -> Option<RecordType> {
        self.types.get(name).copied()
    }

    /// Registered type of `name`, defaulting to aggregate
    pub fn record_type_of(&self, name: &str) -> RecordType {
        self.get(name).unwrap_or_default()
    }

    /// Record a type without checking
    ///
    /// Used by backends when loading stored registrations.
    pub fn insert(&mut self, name: impl Into<String>, record_type: RecordType) {
        self.types.insert(name.into(), record_type);
    }

    /// Number of registered names
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterate registrations
    pub fn iter(&self) -> impl Iterator<Item = (&str, RecordType)> {
        self.types.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Registrations a write of `metrics` would add
    ///
    /// Fails with a type conflict if any name is already registered with a
    /// different type. Names are returned sorted so batches are stable.
    pub fn stage(
        &self,
        entity: &str,
        metrics: &Metrics,
    ) -> Result<Vec<(String, RecordType)>, ValidationError> {
        let mut added = Vec::new();
        for (name, metric) in metrics {
            match self.get(name) {
                Some(registered) if registered != metric.record_type => {
                    return Err(ValidationError::TypeConflict {
                        entity: entity.to_string(),
                        metric: name.clone(),
                        registered,
                        requested: metric.record_type,
                    });
                },
                Some(_) => {},
                None => added.push((name.clone(), metric.record_type)),
            }
        }
        added.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(added)
    }

    /// Rebuild typed metrics from type-agnostic stored fields
    pub fn hydrate<I>(&self, fields: I) -> Metrics
    where
        I: IntoIterator<Item = (String, Number)>,
    {
        fields
            .into_iter()
            .map(|(name, value)| {
                let record_type = self.record_type_of(&name);
                (name, Metric::new(record_type, value))
            })
            .collect()
    }
}

/// Metrics of one bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeslice {
    /// Bucket boundaries
    pub range: DateRange,
    /// Summary of everything written in the bucket
    pub metrics: Metrics,
}

impl Timeslice {
    /// Create a slice
    pub fn new(range: DateRange, metrics: Metrics) -> Self {
        Self { range, metrics }
    }

    /// Fold another slice's metrics into this one, widening the range to cover both
    pub fn add(&mut self, other: &Timeslice) -> Result<(), ValidationError> {
        self.metrics.merge(&other.metrics)?;
        self.range = DateRange {
            start: self.range.start.min(other.range.start),
            end: self.range.end.max(other.range.end),
        };
        Ok(())
    }
}

/// True for names of the form `__name__`, reserved for internal records
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with("__") && name.ends_with("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(items: &[(&str, Metric)]) -> Metrics {
        items
            .iter()
            .map(|(name, metric)| (name.to_string(), *metric))
            .collect()
    }

    #[test]
    fn test_number_promotion() {
        assert_eq!(Number::Int(2).add(Number::Int(3)), Number::Int(5));
        assert_eq!(Number::Int(2).add(Number::Float(0.5)), Number::Float(2.5));
        assert_eq!(
            Number::Int(i64::MAX).add(Number::Int(1)),
            Number::Float(i64::MAX as f64 + 1.0)
        );
    }

    #[test]
    fn test_combine() {
        let mut views = Metric::aggregate(1);
        views.combine(&Metric::aggregate(2)).unwrap();
        assert_eq!(views, Metric::aggregate(3));

        let mut size = Metric::absolute(10);
        size.combine(&Metric::absolute(4)).unwrap();
        assert_eq!(size, Metric::absolute(4));

        let err = views.combine(&Metric::absolute(1)).unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { .. }));
        assert_eq!(views, Metric::aggregate(3));
    }

    #[test]
    fn test_merge_passes_through_unshared_keys() {
        let mut left = metrics(&[("a", Metric::aggregate(1)), ("b", Metric::absolute(5))]);
        let right = metrics(&[("b", Metric::absolute(7)), ("c", Metric::aggregate(2))]);

        left.merge(&right).unwrap();

        assert_eq!(left.len(), 3);
        assert_eq!(left.get("a"), Some(&Metric::aggregate(1)));
        assert_eq!(left.get("b"), Some(&Metric::absolute(7)));
        assert_eq!(left.get("c"), Some(&Metric::aggregate(2)));
    }

    #[test]
    fn test_failed_merge_leaves_receiver_untouched() {
        let mut left = metrics(&[("a", Metric::aggregate(1)), ("b", Metric::aggregate(1))]);
        let before = left.clone();
        let right = metrics(&[("a", Metric::aggregate(1)), ("b", Metric::absolute(1))]);

        assert!(left.merge(&right).is_err());
        assert_eq!(left, before);
    }

    #[test]
    fn test_absolute_merge_is_idempotent() {
        let update = metrics(&[("size", Metric::absolute(9))]);
        let mut once = metrics(&[("size", Metric::absolute(1))]);
        once.merge(&update).unwrap();
        let mut twice = once.clone();
        twice.merge(&update).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_aggregate_merge_is_associative_and_commutative() {
        let a = metrics(&[("x", Metric::aggregate(1)), ("y", Metric::aggregate(2))]);
        let b = metrics(&[("x", Metric::aggregate(10))]);
        let c = metrics(&[("y", Metric::aggregate(100)), ("z", Metric::aggregate(1))]);

        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();
        assert_eq!(left, right);

        let mut swapped = c.clone();
        swapped.merge(&b).unwrap();
        swapped.merge(&a).unwrap();
        assert_eq!(left, swapped);
    }

    #[test]
    fn test_summarize_keeps_merge_order() {
        let first = metrics(&[("size", Metric::absolute(1))]);
        let second = metrics(&[("size", Metric::absolute(2))]);
        let total = Metrics::summarize([&first, &second]).unwrap();
        assert_eq!(total.get("size"), Some(&Metric::absolute(2)));
    }

    #[test]
    fn test_filter_and_combine_matching() {
        let all = metrics(&[
            ("view-loaded", Metric::aggregate(3)),
            ("view-downloaded", Metric::aggregate(4)),
            ("rows", Metric::absolute(100)),
        ]);
        let views = Regex::new("^view-").unwrap();

        assert_eq!(all.filter(&views).len(), 2);

        let combined = all.combine_matching(&views).unwrap();
        assert_eq!(combined.get("result"), Some(&Metric::aggregate(7)));

        let nothing = Regex::new("^missing").unwrap();
        let empty = all.combine_matching(&nothing).unwrap();
        assert_eq!(empty.get("result"), Some(&Metric::aggregate(0)));
    }

    #[test]
    fn test_entity_meta_stage() {
        let mut meta = EntityMeta::new();
        meta.insert("x", RecordType::Absolute);

        let write = metrics(&[("x", Metric::absolute(1)), ("y", Metric::aggregate(1))]);
        let staged = meta.stage("e1", &write).unwrap();
        assert_eq!(staged, vec![("y".to_string(), RecordType::Aggregate)]);

        let conflicting = metrics(&[("x", Metric::aggregate(1))]);
        let err = meta.stage("e1", &conflicting).unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeConflict {
                entity: "e1".into(),
                metric: "x".into(),
                registered: RecordType::Absolute,
                requested: RecordType::Aggregate,
            }
        );
    }

    #[test]
    fn test_hydrate_defaults_to_aggregate() {
        let mut meta = EntityMeta::new();
        meta.insert("size", RecordType::Absolute);

        let hydrated = meta.hydrate(vec![
            ("size".to_string(), Number::Int(4)),
            ("views".to_string(), Number::Int(2)),
        ]);
        assert_eq!(hydrated.get("size"), Some(&Metric::absolute(4)));
        assert_eq!(hydrated.get("views"), Some(&Metric::aggregate(2)));
    }

    #[test]
    fn test_record_type_parsing() {
        assert_eq!("AGGREGATE".parse::<RecordType>(), Ok(RecordType::Aggregate));
        assert_eq!("absolute".parse::<RecordType>(), Ok(RecordType::Absolute));
        assert!("gauge".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("__meta__"));
        assert!(is_reserved_name("__"));
        assert!(!is_reserved_name("__meta"));
        assert!(!is_reserved_name("views"));
    }

    #[test]
    fn test_metric_json_shape() {
        let m = Metric::absolute(10);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"type":"absolute","value":10}"#);

        let parsed: Metric = serde_json::from_str(r#"{"type":"aggregate","value":1.5}"#).unwrap();
        assert_eq!(parsed, Metric::aggregate(1.5));
    }
}
