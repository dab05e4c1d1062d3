//! Result rows and the positional row reader.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
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

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a database query.
#[derive(Debug, Clone)]
pub struct Row {
    /// Column values in order
    values: Vec<Value>,
    /// Shared column metadata
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a row without column names.
    ///
    /// The engine consumes rows positionally, so drivers and tests may skip names.
    pub fn from_values(values: Vec<Value>) -> Self {
        let names = (0..values.len()).map(|i| format!("c{}", i)).collect();
        Self::new(names, values)
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
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

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Positional reader over a result row.
///
/// Every getter consumes exactly one column. The read path of a compiled
/// query relies on this: columns are consumed in the order they were appended
/// to the select list, never looked up by name.
pub trait DataReader {
    /// Index of the next column to be read.
    fn position(&self) -> usize;

    /// Read the next column as a raw value.
    fn get_value(&mut self) -> Result<Value>;

    /// Read the next column as an optional string.
    fn get_string(&mut self) -> Result<Option<String>> {
        match self.get_value()? {
            Value::Null => Ok(None),
            Value::Text(s) | Value::Decimal(s) => Ok(Some(s)),
            other => Err(Error::Type(TypeError {
                expected: "TEXT",
                actual: other.type_name().to_string(),
                column: None,
                rust_type: Some("String"),
            })),
        }
    }

    /// Read the next column as optional bytes.
    fn get_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.get_value()? {
            Value::Null => Ok(None),
            Value::Bytes(b) => Ok(Some(b)),
            Value::Text(s) => Ok(Some(s.into_bytes())),
            other => Err(Error::Type(TypeError {
                expected: "BLOB",
                actual: other.type_name().to_string(),
                column: None,
                rust_type: Some("Vec<u8>"),
            })),
        }
    }

    /// Skip `count` columns without converting them.
    fn skip(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.get_value()?;
        }
        Ok(())
    }
}

/// [`DataReader`] over a borrowed [`Row`].
#[derive(Debug)]
pub struct RowReader<'a> {
    row: &'a Row,
    index: usize,
}

impl<'a> RowReader<'a> {
    /// Start reading `row` from its first column.
    pub fn new(row: &'a Row) -> Self {
        Self { row, index: 0 }
    }

    /// Whether all columns have been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.index >= self.row.len()
    }
}

impl DataReader for RowReader<'_> {
    fn position(&self) -> usize {
        self.index
    }

    fn get_value(&mut self) -> Result<Value> {
        let value = self.row.get(self.index).cloned().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "column",
                actual: format!(
                    "index {} out of bounds (row has {} columns)",
                    self.index,
                    self.row.len()
                ),
                column: None,
                rust_type: None,
            })
        })?;
        self.index += 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_reads_advance() {
        let row = Row::from_values(vec![
            Value::BigInt(1),
            Value::Text("NEW".into()),
            Value::Null,
            Value::Bytes(vec![1, 2]),
        ]);
        let mut reader = RowReader::new(&row);
        assert_eq!(reader.get_value().unwrap(), Value::BigInt(1));
        assert_eq!(reader.get_string().unwrap(), Some("NEW".to_string()));
        assert_eq!(reader.get_string().unwrap(), None);
        assert_eq!(reader.position(), 3);
        assert_eq!(reader.get_bytes().unwrap(), Some(vec![1, 2]));
        assert!(reader.is_exhausted());
        assert!(reader.get_value().is_err());
    }

    #[test]
    fn test_skip_and_name_lookup() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::BigInt(4), Value::Text("x".into())],
        );
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("x".into())));
        let mut reader = RowReader::new(&row);
        reader.skip(1).unwrap();
        assert_eq!(reader.get_string().unwrap(), Some("x".to_string()));
    }
}
