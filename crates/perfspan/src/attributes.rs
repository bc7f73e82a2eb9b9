//! Span and resource attributes.
//!
//! [`Attributes`] is an insertion-ordered map from string keys to
//! [`AttributeValue`]s. Ordering is preserved so that serialized payloads list
//! attributes in the order they were first set; replacing a value keeps its
//! original slot.
//!
//! [`AttributeLimits`] bounds what a producer can attach to a single span:
//! long strings are truncated with a visible marker, long arrays are cut, and
//! both attributes beyond the count limit and keys beyond [`MAX_KEY_LENGTH`]
//! are dropped (and counted on the span).

use std::fmt;

/// Keys longer than this are rejected outright.
pub const MAX_KEY_LENGTH: usize = 128;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Array(Vec<AttributeValue>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            AttributeValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Double(d) => write!(f, "{d}"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Array(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        AttributeValue::Array(values.into_iter().map(Into::into).collect())
    }
}

/// Insertion-ordered attribute map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    entries: Vec<(String, AttributeValue)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<AttributeValue>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attributes = Attributes::new();
        for (k, v) in iter {
            attributes.insert(k, v);
        }
        attributes
    }
}

/// Per-span limits applied to producer-supplied attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLimits {
    /// Maximum characters in a string value (1..=10000).
    pub string_value_limit: usize,
    /// Maximum elements in an array value (1..=10000).
    pub array_length_limit: usize,
    /// Maximum custom attributes per span (1..=1000).
    pub count_limit: usize,
}

impl AttributeLimits {
    pub const DEFAULT_STRING_VALUE_LIMIT: usize = 1024;
    pub const DEFAULT_ARRAY_LENGTH_LIMIT: usize = 1000;
    pub const DEFAULT_COUNT_LIMIT: usize = 128;

    /// Builds limits, replacing any out-of-range value with its default.
    pub fn new(string_value_limit: usize, array_length_limit: usize, count_limit: usize) -> Self {
        Self {
            string_value_limit: in_range_or(
                string_value_limit,
                1..=10_000,
                Self::DEFAULT_STRING_VALUE_LIMIT,
            ),
            array_length_limit: in_range_or(
                array_length_limit,
                1..=10_000,
                Self::DEFAULT_ARRAY_LENGTH_LIMIT,
            ),
            count_limit: in_range_or(count_limit, 1..=1_000, Self::DEFAULT_COUNT_LIMIT),
        }
    }

    pub fn accepts_key(&self, key: &str) -> bool {
        !key.is_empty() && key.chars().count() <= MAX_KEY_LENGTH
    }

    /// Truncates strings and arrays (recursively) to the configured limits.
    pub fn clamp(&self, value: AttributeValue) -> AttributeValue {
        match value {
            AttributeValue::String(s) => AttributeValue::String(self.truncate_string(s)),
            AttributeValue::Array(mut values) => {
                values.truncate(self.array_length_limit);
                AttributeValue::Array(values.into_iter().map(|v| self.clamp(v)).collect())
            }
            other => other,
        }
    }

    fn truncate_string(&self, s: String) -> String {
        let total = s.chars().count();
        if total <= self.string_value_limit {
            return s;
        }
        let cut = s
            .char_indices()
            .nth(self.string_value_limit)
            .map_or(s.len(), |(i, _)| i);
        format!(
            "{}*** {} CHARS TRUNCATED",
            &s[..cut],
            total - self.string_value_limit
        )
    }
}

impl Default for AttributeLimits {
    fn default() -> Self {
        Self {
            string_value_limit: Self::DEFAULT_STRING_VALUE_LIMIT,
            array_length_limit: Self::DEFAULT_ARRAY_LENGTH_LIMIT,
            count_limit: Self::DEFAULT_COUNT_LIMIT,
        }
    }
}

fn in_range_or(value: usize, range: std::ops::RangeInclusive<usize>, default: usize) -> usize {
    if range.contains(&value) {
        value
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_preserves_order_on_replace() {
        let mut attrs = Attributes::new();
        attrs.insert("a", 1i64);
        attrs.insert("b", "two");
        attrs.insert("c", true);
        assert_eq!(attrs.insert("a", 10i64), Some(AttributeValue::Int(1)));

        let keys: Vec<_> = attrs.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(attrs.get("a"), Some(&AttributeValue::Int(10)));
    }

    #[test]
    fn test_remove() {
        let mut attrs: Attributes = [("x", 1i64), ("y", 2i64)].into_iter().collect();
        assert_eq!(attrs.remove("x"), Some(AttributeValue::Int(1)));
        assert_eq!(attrs.remove("x"), None);
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_string_truncation_marker() {
        let limits = AttributeLimits::new(5, 10, 10);
        let clamped = limits.clamp("abcdefghij".into());
        assert_eq!(clamped, AttributeValue::from("abcde*** 5 CHARS TRUNCATED"));

        // At the limit nothing changes
        assert_eq!(limits.clamp("abcde".into()), AttributeValue::from("abcde"));
    }

    #[test]
    fn test_truncation_counts_chars_not_bytes() {
        let limits = AttributeLimits::new(2, 10, 10);
        let clamped = limits.clamp("äöüß".into());
        assert_eq!(clamped, AttributeValue::from("äö*** 2 CHARS TRUNCATED"));
    }

    #[test]
    fn test_array_truncation_applies_to_elements() {
        let limits = AttributeLimits::new(3, 2, 10);
        let clamped = limits.clamp(vec!["abcd", "x", "dropped"].into());
        assert_eq!(
            clamped,
            AttributeValue::Array(vec!["abc*** 1 CHARS TRUNCATED".into(), "x".into()])
        );
    }

    #[test]
    fn test_out_of_range_limits_fall_back_to_defaults() {
        let limits = AttributeLimits::new(0, 20_000, 1_001);
        assert_eq!(limits, AttributeLimits::default());

        let limits = AttributeLimits::new(10_000, 1, 1_000);
        assert_eq!(limits.string_value_limit, 10_000);
        assert_eq!(limits.array_length_limit, 1);
        assert_eq!(limits.count_limit, 1_000);
    }

    #[test]
    fn test_key_length_limit() {
        let limits = AttributeLimits::default();
        assert!(limits.accepts_key(&"k".repeat(MAX_KEY_LENGTH)));
        assert!(!limits.accepts_key(&"k".repeat(MAX_KEY_LENGTH + 1)));
        assert!(!limits.accepts_key(""));
    }

    proptest! {
        /// Clamped strings never keep more than the limit of original characters
        #[test]
        fn prop_truncation_keeps_prefix(s in "\\PC{0,64}", limit in 1usize..32) {
            let limits = AttributeLimits::new(limit, 10, 10);
            let clamped = limits.clamp(AttributeValue::String(s.clone()));
            let clamped = clamped.as_str().unwrap().to_owned();
            let count = s.chars().count();
            if count <= limit {
                prop_assert_eq!(clamped, s);
            } else {
                let prefix: String = s.chars().take(limit).collect();
                prop_assert!(clamped.starts_with(&prefix));
                let expected_suffix = format!("*** {} CHARS TRUNCATED", count - limit);
                prop_assert!(clamped.ends_with(&expected_suffix));
            }
        }
    }
}
