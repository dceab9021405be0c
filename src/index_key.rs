//! Key-path attribute extraction for secondary indices.
//!
//! A [`KeyPath`] names a single field or an ordered chain of nested fields.
//! [`Indexable`] lets a value type describe how to pull the attribute at a
//! given path out of itself; `serde_json::Value` implements it directly so
//! callers get a ready-made value type without the core depending on a full
//! codec layer.

use std::cmp::Ordering;
use std::fmt;

/// A single field name, or an ordered chain of nested field names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn single(field: impl Into<String>) -> Self {
        KeyPath(vec![field.into()])
    }

    pub fn nested<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath(fields.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for KeyPath {
    fn from(s: &str) -> Self {
        KeyPath(s.split('.').map(|s| s.to_string()).collect())
    }
}

/// A single orderable indexed key. Deliberately small: the core only needs
/// to compare and sort these, not interpret them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    Uint(u64),
    /// A whole array-valued attribute, indexed as one key rather than
    /// element-wise. Produced when a `Sequence`-extracted attribute lands
    /// on a non-`multiEntry` index (see
    /// [`crate::index::attribute_keys_for_kind`]), where the spec's "treat
    /// as single" rule applies instead of per-element expansion.
    Composite(Vec<IndexKey>),
}

/// What extracting a [`KeyPath`] from a value yielded.
///
/// A `Sequence` only makes sense when the owning index is `multiEntry`; a
/// `Scalar` under a `multiEntry` index is treated as a single-element
/// sequence (see [`crate::index::InMemoryIndex`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtractedAttribute {
    Scalar(IndexKey),
    Sequence(Vec<IndexKey>),
}

/// Describes how a value exposes an indexed attribute by [`KeyPath`].
///
/// Absent/undefined attributes return `None`, meaning the value is not
/// indexed at that path (per the data model's index semantics).
pub trait Indexable {
    fn extract(&self, path: &KeyPath) -> Option<ExtractedAttribute>;
}

impl Indexable for serde_json::Value {
    fn extract(&self, path: &KeyPath) -> Option<ExtractedAttribute> {
        let mut current = self;
        for segment in path.segments() {
            current = current.as_object()?.get(segment)?;
        }
        json_value_to_attribute(current)
    }
}

fn json_value_to_attribute(value: &serde_json::Value) -> Option<ExtractedAttribute> {
    use serde_json::Value;
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(ExtractedAttribute::Scalar(IndexKey::Uint(*b as u64))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(ExtractedAttribute::Scalar(IndexKey::Int(i)))
            } else {
                n.as_u64().map(|u| ExtractedAttribute::Scalar(IndexKey::Uint(u)))
            }
        }
        Value::String(s) => Some(ExtractedAttribute::Scalar(IndexKey::Text(s.clone()))),
        Value::Array(items) => {
            let keys: Vec<IndexKey> = items
                .iter()
                .filter_map(json_value_to_attribute)
                .map(|attr| match attr {
                    ExtractedAttribute::Scalar(k) => k,
                    ExtractedAttribute::Sequence(mut ks) => {
                        ks.drain(..).next().unwrap_or(IndexKey::Uint(0))
                    }
                })
                .collect();
            Some(ExtractedAttribute::Sequence(keys))
        }
        Value::Object(_) => None,
    }
}

impl PartialOrd for ExtractedAttribute {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExtractedAttribute {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ExtractedAttribute::Scalar(a), ExtractedAttribute::Scalar(b)) => a.cmp(b),
            (ExtractedAttribute::Scalar(_), ExtractedAttribute::Sequence(_)) => Ordering::Less,
            (ExtractedAttribute::Sequence(_), ExtractedAttribute::Scalar(_)) => Ordering::Greater,
            (ExtractedAttribute::Sequence(a), ExtractedAttribute::Sequence(b)) => a.cmp(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_nested_scalar() {
        let value = json!({"a": {"b": 1}});
        let path = KeyPath::from("a.b");
        assert_eq!(
            value.extract(&path),
            Some(ExtractedAttribute::Scalar(IndexKey::Int(1)))
        );
    }

    #[test]
    fn missing_attribute_is_none() {
        let value = json!({"a": {"c": 1}});
        let path = KeyPath::from("a.b");
        assert_eq!(value.extract(&path), None);
    }

    #[test]
    fn extracts_array_as_sequence() {
        let value = json!({"multi": [1, 2, 3]});
        let path = KeyPath::from("multi");
        assert_eq!(
            value.extract(&path),
            Some(ExtractedAttribute::Sequence(vec![
                IndexKey::Int(1),
                IndexKey::Int(2),
                IndexKey::Int(3)
            ]))
        );
    }
}
