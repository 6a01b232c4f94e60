use keel_core::{HashBuilder, HashCode};
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

/// A persisted, comparable image of an input property value.
///
/// Maps keep their keys sorted, so two values that serialize the same way
/// produce equal snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueSnapshot {
    Null,
    Bool(bool),
    /// Numbers keep their textual form so integers and floats never collide.
    Number(String),
    String(String),
    List(Vec<ValueSnapshot>),
    Map(Vec<(String, ValueSnapshot)>),
}

impl ValueSnapshot {
    /// Snapshots `value` of the input property named `property`.
    pub fn of<T>(property: &str, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_value(value).map_err(|err| HistoryError::UnrepresentableProperty {
            property: property.to_owned(),
            message: err.to_string(),
        })?;
        Ok(Self::from_json(json))
    }

    fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => ValueSnapshot::Null,
            Value::Bool(value) => ValueSnapshot::Bool(value),
            Value::Number(number) => ValueSnapshot::Number(number.to_string()),
            Value::String(value) => ValueSnapshot::String(value),
            Value::Array(items) => ValueSnapshot::List(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => {
                let mut entries: Vec<_> = map
                    .into_iter()
                    .map(|(key, value)| (key, Self::from_json(value)))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                ValueSnapshot::Map(entries)
            }
        }
    }

    pub fn append_to_hash(&self, hasher: &mut HashBuilder) {
        match self {
            ValueSnapshot::Null => {
                hasher.put_null();
            }
            ValueSnapshot::Bool(value) => {
                hasher.put_str("bool").put_bool(*value);
            }
            ValueSnapshot::Number(value) => {
                hasher.put_str("number").put_str(value);
            }
            ValueSnapshot::String(value) => {
                hasher.put_str("string").put_str(value);
            }
            ValueSnapshot::List(items) => {
                hasher.put_str("list").put_u64(items.len() as u64);
                for item in items {
                    item.append_to_hash(hasher);
                }
            }
            ValueSnapshot::Map(entries) => {
                hasher.put_str("map").put_u64(entries.len() as u64);
                for (key, value) in entries {
                    hasher.put_str(key);
                    value.append_to_hash(hasher);
                }
            }
        }
    }

    pub fn hash(&self) -> HashCode {
        let mut hasher = HashBuilder::new();
        self.append_to_hash(&mut hasher);
        hasher.finish()
    }
}

/// Identity of the code that implements a task or one of its actions.
///
/// `module_hash` is the content hash of the module defining the type. When it
/// is unknown the implementation cannot be compared with a later one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImplementationSnapshot {
    pub type_name: String,
    pub module_hash: Option<HashCode>,
}

impl ImplementationSnapshot {
    pub fn new(type_name: impl Into<String>, module_hash: HashCode) -> Self {
        Self {
            type_name: type_name.into(),
            module_hash: Some(module_hash),
        }
    }

    pub fn unknown(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            module_hash: None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.module_hash.is_none()
    }
}

impl std::fmt::Display for ImplementationSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.module_hash {
            Some(hash) => write!(f, "{}@{}", self.type_name, hash),
            None => write!(f, "{} (unknown module)", self.type_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn map_snapshots_do_not_depend_on_insertion_order() {
        let mut first = HashMap::new();
        first.insert("b", 2);
        first.insert("a", 1);
        let mut second = HashMap::new();
        second.insert("a", 1);
        second.insert("b", 2);

        let first = ValueSnapshot::of("options", &first).unwrap();
        let second = ValueSnapshot::of("options", &second).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn integers_and_floats_differ() {
        let int = ValueSnapshot::of("level", &1).unwrap();
        let float = ValueSnapshot::of("level", &1.0).unwrap();
        assert_ne!(int, float);
        assert_ne!(int.hash(), float.hash());
    }

    #[test]
    fn list_nesting_is_part_of_the_hash() {
        let flat = ValueSnapshot::of("args", &vec!["a", "b"]).unwrap();
        let nested = ValueSnapshot::of("args", &vec![vec!["a"], vec!["b"]]).unwrap();
        assert_ne!(flat.hash(), nested.hash());
    }

    #[test]
    fn unrepresentable_values_name_the_property() {
        let mut value = BTreeMap::new();
        value.insert((1u8, 2u8), "x");
        let err = ValueSnapshot::of("matrix", &value).unwrap_err();
        match err {
            HistoryError::UnrepresentableProperty { property, .. } => assert_eq!(property, "matrix"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_implementations() {
        assert!(ImplementationSnapshot::unknown("Compile").is_unknown());
        assert!(!ImplementationSnapshot::new("Compile", HashCode::from_bytes("m")).is_unknown());
    }
}
