//! Dynamically-typed values that flow through the codecs.
//!
//! Descriptor tables are data, not Rust types, so a decoded record is a
//! tree of [`Value`]s keyed by field name ([`FieldValue`]). Lists carry
//! either a whole sequence or an incremental [`ListUpdate`].

use std::collections::BTreeMap;
use std::fmt;

use num_bigint::BigUint;

use crate::Entity;

/// A single decoded (or to-be-encoded) value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(u32),
    BigInt(BigUint),
    Bool(bool),
    Enum(u32),
    Str(String),
    Bin(Vec<u8>),
    List(ListValue),
    Entity(Entity),
}

impl Value {
    /// Short name of the variant, used in type-mismatch errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "Int",
            Self::BigInt(_) => "BigInt",
            Self::Bool(_) => "Bool",
            Self::Enum(_) => "Enum",
            Self::Str(_) => "Str",
            Self::Bin(_) => "Bin",
            Self::List(_) => "List",
            Self::Entity(_) => "Entity",
        }
    }

    pub fn as_int(&self) -> Option<u32> {
        match self {
            Self::Int(v) | Self::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_big_int(&self) -> Option<&BigUint> {
        match self {
            Self::BigInt(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bin(&self) -> Option<&[u8]> {
        match self {
            Self::Bin(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListValue> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(v) => Some(v),
            _ => None,
        }
    }

    /// Renders the value as JSON for logs and debugging output.
    ///
    /// Big integers become decimal strings, binary blobs become arrays of
    /// byte values, entities become objects tagged with their type name.
    #[cfg(feature = "json")]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Self::Int(v) | Self::Enum(v) => json!(v),
            Self::BigInt(v) => json!(v.to_str_radix(10)),
            Self::Bool(v) => json!(v),
            Self::Str(v) => json!(v),
            Self::Bin(v) => json!(v),
            Self::List(ListValue::Full(items)) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::List(ListValue::Partial(update)) => json!({
                "partial": update.op.name(),
                "count": update.count(),
                "items": update.items.iter().map(Value::to_json).collect::<Vec<_>>(),
            }),
            Self::Entity(entity) => {
                let mut obj = entity.value().to_json();
                if let serde_json::Value::Object(map) = &mut obj {
                    map.insert("$entity".into(), json!(entity.spec().name));
                }
                obj
            }
        }
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bin(v)
    }
}

impl From<BigUint> for Value {
    fn from(v: BigUint) -> Self {
        Self::BigInt(v)
    }
}

impl From<ListValue> for Value {
    fn from(v: ListValue) -> Self {
        Self::List(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(ListValue::Full(v))
    }
}

impl From<ListUpdate> for Value {
    fn from(v: ListUpdate) -> Self {
        Self::List(ListValue::Partial(v))
    }
}

impl From<Entity> for Value {
    fn from(v: Entity) -> Self {
        Self::Entity(v)
    }
}

// ---------------------------------------------------------------------------
// FieldValue
// ---------------------------------------------------------------------------

/// A record: field name → value. Absent optional fields are simply not
/// in the map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValue(BTreeMap<String, Value>);

impl FieldValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Shorthand for `get(name).and_then(Value::as_str)`.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Shorthand for `get(name).and_then(Value::as_int)`.
    pub fn int(&self, name: &str) -> Option<u32> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(feature = "json")]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for FieldValue {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

/// A list value: the whole sequence, or a change to apply to one.
#[derive(Debug, Clone, PartialEq)]
pub enum ListValue {
    Full(Vec<Value>),
    Partial(ListUpdate),
}

impl ListValue {
    /// The items carried on the wire (for `remove`, none).
    pub fn items(&self) -> &[Value] {
        match self {
            Self::Full(items) => items,
            Self::Partial(update) => &update.items,
        }
    }
}

/// Which incremental change a partial list update describes.
///
/// The variant is the mode nibble on the wire: append = 0, prepend = 1,
/// insert = 2, remove = 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialOp {
    Append,
    Prepend,
    Insert { index: u32 },
    Remove { index: u32, count: u32 },
}

impl PartialOp {
    pub fn mode_id(&self) -> u8 {
        match self {
            Self::Append => 0,
            Self::Prepend => 1,
            Self::Insert { .. } => 2,
            Self::Remove { .. } => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Insert { .. } => "insert",
            Self::Remove { .. } => "remove",
        }
    }
}

impl fmt::Display for PartialOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A partial list update: exactly one operation plus the items it adds.
#[derive(Debug, Clone, PartialEq)]
pub struct ListUpdate {
    pub op: PartialOp,
    pub items: Vec<Value>,
}

impl ListUpdate {
    pub fn append(items: Vec<Value>) -> Self {
        Self { op: PartialOp::Append, items }
    }

    pub fn prepend(items: Vec<Value>) -> Self {
        Self { op: PartialOp::Prepend, items }
    }

    pub fn insert(index: u32, items: Vec<Value>) -> Self {
        Self { op: PartialOp::Insert { index }, items }
    }

    pub fn remove(index: u32, count: u32) -> Self {
        Self {
            op: PartialOp::Remove { index, count },
            items: Vec::new(),
        }
    }

    /// Number of elements affected.
    pub fn count(&self) -> usize {
        match self.op {
            PartialOp::Remove { count, .. } => count as usize,
            _ => self.items.len(),
        }
    }

    /// Applies this update to an existing sequence.
    ///
    /// Indices past the end are clamped, so a stale update never panics.
    pub fn apply(&self, list: &mut Vec<Value>) {
        match self.op {
            PartialOp::Append => list.extend(self.items.iter().cloned()),
            PartialOp::Prepend => {
                list.splice(0..0, self.items.iter().cloned());
            }
            PartialOp::Insert { index } => {
                let at = (index as usize).min(list.len());
                list.splice(at..at, self.items.iter().cloned());
            }
            PartialOp::Remove { index, count } => {
                let start = (index as usize).min(list.len());
                let end = start.saturating_add(count as usize).min(list.len());
                list.drain(start..end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[u32]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    #[test]
    fn test_field_value_builder_and_accessors() {
        let v = FieldValue::new().with("str", "hi").with("n", 5u32);
        assert_eq!(v.str("str"), Some("hi"));
        assert_eq!(v.int("n"), Some(5));
        assert_eq!(v.len(), 2);
        assert!(v.get("missing").is_none());
    }

    #[test]
    fn test_field_value_equality_ignores_insertion_order() {
        let a = FieldValue::new().with("a", 1u32).with("b", 2u32);
        let b = FieldValue::new().with("b", 2u32).with("a", 1u32);
        assert_eq!(a, b);
    }

    #[test]
    fn test_list_update_apply_append_and_prepend() {
        let mut list = ints(&[2, 3]);
        ListUpdate::append(ints(&[4])).apply(&mut list);
        ListUpdate::prepend(ints(&[1])).apply(&mut list);
        assert_eq!(list, ints(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_list_update_apply_insert_and_remove() {
        let mut list = ints(&[1, 4]);
        ListUpdate::insert(1, ints(&[2, 3])).apply(&mut list);
        assert_eq!(list, ints(&[1, 2, 3, 4]));

        ListUpdate::remove(1, 2).apply(&mut list);
        assert_eq!(list, ints(&[1, 4]));
    }

    #[test]
    fn test_list_update_remove_past_end_is_clamped() {
        let mut list = ints(&[1, 2]);
        ListUpdate::remove(1, 10).apply(&mut list);
        assert_eq!(list, ints(&[1]));
    }

    #[test]
    fn test_list_update_count() {
        assert_eq!(ListUpdate::append(ints(&[1, 2])).count(), 2);
        assert_eq!(ListUpdate::remove(0, 7).count(), 7);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_value_to_json() {
        let v = FieldValue::new()
            .with("name", "x")
            .with("tags", vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(
            v.to_json(),
            serde_json::json!({ "name": "x", "tags": [1, 2] })
        );
    }
}
