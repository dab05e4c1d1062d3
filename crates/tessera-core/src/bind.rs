//! Positional statement binding.

use crate::types::SqlType;
use crate::value::Value;

/// Positional parameter binder for a statement.
///
/// Implementations receive parameters strictly in placeholder order; the
/// generated SQL and the bind calls are produced by the same compiled plan so
/// the two can never drift apart.
pub trait DataBind {
    /// 1-based index of the next parameter to bind.
    fn position(&self) -> usize;

    /// Bind the next parameter.
    fn set_value(&mut self, value: Value);

    /// Bind NULL for a column of the given type.
    fn set_null(&mut self, sql_type: &SqlType);

    /// Bind a value, routing NULL through [`set_null`](Self::set_null).
    fn bind(&mut self, value: Value, sql_type: &SqlType) {
        if value.is_null() {
            self.set_null(sql_type);
        } else {
            self.set_value(value);
        }
    }
}

/// Collected bind values plus a readable log for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct BindValues {
    values: Vec<Value>,
    log: Vec<String>,
}

impl BindValues {
    /// Create an empty bind list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bound parameters in order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume into the parameter list.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing has been bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Comma separated rendering of the bound values.
    pub fn bind_log(&self) -> String {
        self.log.join(",")
    }
}

impl DataBind for BindValues {
    fn position(&self) -> usize {
        self.values.len() + 1
    }

    fn set_value(&mut self, value: Value) {
        self.log.push(value.render());
        self.values.push(value);
    }

    fn set_null(&mut self, sql_type: &SqlType) {
        self.log.push(format!("null<{}>", sql_type.type_name()));
        self.values.push(Value::Null);
    }
}

impl From<Vec<Value>> for BindValues {
    fn from(values: Vec<Value>) -> Self {
        let log = values.iter().map(Value::render).collect();
        Self { values, log }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_positions_and_log() {
        let mut binds = BindValues::new();
        assert_eq!(binds.position(), 1);
        binds.bind(Value::Text("NEW".into()), &SqlType::VarChar(10));
        binds.bind(Value::Null, &SqlType::BigInt);
        assert_eq!(binds.position(), 3);
        assert_eq!(binds.values(), &[Value::Text("NEW".into()), Value::Null]);
        assert_eq!(binds.bind_log(), "'NEW',null<BIGINT>");
    }
}
