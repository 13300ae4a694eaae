//! Result rows as returned by a [`Store`](crate::store::Store).

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared by every row of one result set.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row: ordered column values plus shared column names.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row with its own column metadata.
    ///
    /// Stores producing many rows should build one `ColumnInfo` and use
    /// [`Row::with_columns`].
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column name, attaching the column to conversion errors.
    pub fn get_named<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::try_from(value.clone()).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access() {
        let row = Row::new(
            vec!["id".into(), "status".into(), "note".into()],
            vec![Value::BigInt(42), Value::from("OPEN"), Value::Null],
        );
        assert_eq!(row.len(), 3);
        assert_eq!(row.get(0), Some(&Value::BigInt(42)));
        assert_eq!(row.get_by_name("status"), Some(&Value::from("OPEN")));
        assert_eq!(row.get_named::<i64>("id").unwrap(), 42);
        assert_eq!(row.get_named::<Option<String>>("note").unwrap(), None);
    }

    #[test]
    fn test_row_errors_name_the_column() {
        let row = Row::new(vec!["id".into()], vec![Value::from("x")]);
        match row.get_named::<i64>("id") {
            Err(Error::Type(te)) => assert_eq!(te.column.as_deref(), Some("id")),
            other => panic!("expected type error, got {other:?}"),
        }
        assert!(row.get_named::<i64>("missing").is_err());
    }

    #[test]
    fn test_shared_columns() {
        let cols = Arc::new(ColumnInfo::new(vec!["a".into(), "b".into()]));
        let r1 = Row::with_columns(Arc::clone(&cols), vec![Value::Int(1), Value::Int(2)]);
        let r2 = Row::with_columns(Arc::clone(&cols), vec![Value::Int(3), Value::Int(4)]);
        assert!(Arc::ptr_eq(&r1.column_info(), &r2.column_info()));
        let pairs: Vec<_> = r2.iter().collect();
        assert_eq!(pairs, vec![("a", &Value::Int(3)), ("b", &Value::Int(4))]);
    }
}
