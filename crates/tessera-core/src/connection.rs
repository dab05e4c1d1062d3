//! Database connection trait.
//!
//! The engine never talks to a driver directly. Every statement it generates
//! goes through [`Connection`], which integrates with asupersync's structured
//! concurrency via the `Cx` context for cancellation and timeouts.
//!
//! Connection pooling and transaction demarcation belong to the driver layer;
//! a `Connection` handed to the engine is assumed to be inside whatever
//! transaction the caller set up.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// A database connection capable of executing generated statements.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "select t0.id, t0.name from customer t0 where t0.id=?", &[Value::BigInt(1)]).await;
/// let count = conn.execute(&cx, "delete from customer where id=?", &[Value::BigInt(1)]).await;
/// ```
pub trait Connection: Send + Sync {
    /// The dialect of the backend behind this connection.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT, returning the affected row count and the generated key.
    ///
    /// Drivers whose dialect does not support generated keys return `None`;
    /// the engine then issues the dialect's "last insert id" query itself.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<(u64, Option<Value>), crate::Error>> + Send;
}
