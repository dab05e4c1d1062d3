//! Backend dialect differences the engine has to know about.

use serde::{Deserialize, Serialize};

/// SQL dialect of the connected backend.
///
/// Statements are always generated with positional `?` placeholders; the
/// dialect only decides row limiting and how generated keys are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL
    #[default]
    Postgres,
    /// SQLite
    Sqlite,
    /// MySQL/MariaDB
    Mysql,
    /// A backend whose driver cannot return generated keys.
    Generic,
}

impl Dialect {
    /// Whether the driver returns generated keys with the insert itself.
    pub const fn supports_generated_keys(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Mysql)
    }

    /// Fallback statement reading the key generated by the last insert.
    ///
    /// Used only when [`supports_generated_keys`](Self::supports_generated_keys) is false.
    pub fn last_insert_id_sql(self, table: &str) -> String {
        match self {
            Dialect::Sqlite => "select last_insert_rowid()".to_string(),
            Dialect::Mysql => "select last_insert_id()".to_string(),
            Dialect::Postgres => "select lastval()".to_string(),
            Dialect::Generic => format!("select max(id) from {}", table),
        }
    }

    /// Append a row limit/offset clause.
    pub fn append_limit(self, sql: &mut String, max_rows: Option<u32>, first_row: Option<u32>) {
        if let Some(max) = max_rows {
            sql.push_str(" limit ");
            sql.push_str(&max.to_string());
        } else if first_row.is_some() && self == Dialect::Mysql {
            // mysql has no offset without limit
            sql.push_str(" limit 18446744073709551615");
        }
        if let Some(first) = first_row {
            sql.push_str(" offset ");
            sql.push_str(&first.to_string());
        }
    }
}
