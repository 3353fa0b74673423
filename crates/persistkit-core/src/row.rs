//! Store row representation.
//!
//! Rows produced for a [`QueryPlan`](crate::store::QueryPlan) follow a flat
//! layout: the root entity's columns are unprefixed and every fetch-joined
//! path contributes the joined entity's columns under `"<path>."`.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct Layout {
    names: Vec<String>,
    positions: HashMap<String, usize>,
}

/// One result row: column names (shared) and values in column order.
#[derive(Debug, Clone)]
pub struct Row {
    layout: Arc<Layout>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row from `(column, value)` pairs. A repeated column name
    /// resolves to its last occurrence.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        let positions = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            layout: Arc::new(Layout { names, positions }),
            values,
        }
    }

    /// Same columns as `self`, different values.
    pub fn sibling(&self, values: Vec<Value>) -> Self {
        Self {
            layout: Arc::clone(&self.layout),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.layout
            .positions
            .get(name)
            .and_then(|i| self.values.get(*i))
    }

    /// Value of `name` under a joined path; `prefix` is empty for the root.
    pub fn get_prefixed(&self, prefix: &str, name: &str) -> Option<&Value> {
        if prefix.is_empty() {
            self.get_by_name(name)
        } else {
            self.get_by_name(&format!("{prefix}.{name}"))
        }
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.layout.positions.contains_key(name)
    }

    /// Decode column `name` into `T`, reporting the column on failure.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let Some(value) = self.get_by_name(name) else {
            return Err(Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: "missing column".to_string(),
                column: Some(name.to_string()),
            }));
        };
        T::from_value(value).map_err(|err| match err {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            other => other,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.layout.names.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }
}

/// Conversion from a stored [`Value`].
pub trait FromValue: Sized {
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

macro_rules! from_value_via {
    ($ty:ty, $accessor:ident) => {
        impl FromValue for $ty {
            fn from_value(value: &Value) -> Result<Self> {
                value.$accessor().map(Into::into).ok_or_else(|| {
                    Error::Type(TypeError {
                        expected: stringify!($ty),
                        actual: value.type_name().to_string(),
                        column: None,
                    })
                })
            }
        }
    };
}

from_value_via!(bool, as_bool);
from_value_via!(i64, as_i64);
from_value_via!(f64, as_f64);
from_value_via!(String, as_str);

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}
