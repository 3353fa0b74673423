//! Dynamic column values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed column value.
///
/// Entity fields, identities, foreign keys and query parameters are all
/// carried as `Value`s so the unit of work can stay agnostic of the concrete
/// Rust types an application maps onto its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Structured column stored as a JSON document.
    Json(serde_json::Value),
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Column type name, used in conversion errors.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Json(_) => "JSON",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(_) | Value::BigInt(_) => self.as_i64().map(|n| n != 0),
            _ => None,
        }
    }

    /// Integer view; both integer widths widen to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(n) => Some(i64::from(n)),
            Value::BigInt(n) => Some(n),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Double(x) => Some(x),
            Value::Int(n) => Some(f64::from(n)),
            Value::BigInt(n) => Some(n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Compare two values as row identities.
    ///
    /// Integer widths are normalized, so `Int(7)` and `BigInt(7)` identify
    /// the same row. NULL never identifies a row.
    pub fn same_identity(&self, other: &Value) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self == other,
            _ => false,
        }
    }

    /// Feed this value into a hasher, consistent with [`Value::same_identity`].
    pub fn hash_identity<H: Hasher>(&self, state: &mut H) {
        self.identity_tag().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(_) | Value::BigInt(_) => self.as_i64().hash(state),
            Value::Double(x) => x.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Json(j) => j.to_string().hash(state),
        }
    }

    // Int and BigInt share one tag.
    const fn identity_tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::BigInt(_) => 2,
            Value::Double(_) => 3,
            Value::Text(_) => 4,
            Value::Bytes(_) => 5,
            Value::Json(_) => 6,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::BigInt(n) => write!(f, "{n}"),
            Value::Double(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int,
    i64 => BigInt,
    f64 => Double,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn identity_hash(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash_identity(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(7_i32), Value::Int(7));
        assert_eq!(Value::from("abc"), Value::Text("abc".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3_i64)), Value::BigInt(3));
        assert_eq!(Value::Int(5).as_i64(), Some(5));
        assert_eq!(Value::Double(1.5).as_i64(), None);
        assert_eq!(Value::BigInt(0).as_bool(), Some(false));
        assert_eq!(Value::BigInt(1).type_name(), "BIGINT");
    }

    #[test]
    fn test_identity_normalizes_integer_width() {
        assert!(Value::Int(7).same_identity(&Value::BigInt(7)));
        assert_eq!(
            identity_hash(&Value::Int(7)),
            identity_hash(&Value::BigInt(7))
        );
        assert!(!Value::Int(7).same_identity(&Value::BigInt(8)));
        assert!(!Value::Text("7".into()).same_identity(&Value::BigInt(7)));
    }

    #[test]
    fn test_null_is_never_an_identity() {
        assert!(!Value::Null.same_identity(&Value::Null));
        assert!(!Value::Null.same_identity(&Value::BigInt(0)));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::BigInt(42).to_string(), "42");
        assert_eq!(Value::Text("b-1".into()).to_string(), "'b-1'");
        assert_eq!(Value::Null.to_string(), "NULL");
    }
}
