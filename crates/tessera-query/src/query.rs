//! Query definition: root type, detail, predicate, ordering and limits.

use crate::detail::{FetchConfig, OrmQueryDetail};
use crate::plan::cache_key;
use crate::predicate::Expr;
use std::hash::{Hash, Hasher};
use tessera_core::{DescriptorMap, Dialect, Result, Value};

/// A query over one root type.
///
/// # Example
///
/// ```
/// use tessera_query::{Expr, FetchConfig, Query};
///
/// let query = Query::new("Order")
///     .select(&["status", "customer"])
///     .fetch("customer", &["name"], FetchConfig::lazy(10))
///     .filter(Expr::eq("status", "NEW"))
///     .order_by("id desc")
///     .limit(50);
/// assert_eq!(query.entity(), "Order");
/// assert_eq!(query.max_rows(), Some(50));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    entity: String,
    detail: OrmQueryDetail,
    predicate: Option<Expr>,
    order_by: Option<String>,
    distinct: bool,
    max_rows: Option<u32>,
    first_row: Option<u32>,
}

impl Query {
    /// Every property of `entity`, no joins, no restriction.
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            detail: OrmQueryDetail::new(),
            predicate: None,
            order_by: None,
            distinct: false,
            max_rows: None,
            first_row: None,
        }
    }

    /// Replace the whole detail.
    pub fn with_detail(mut self, detail: OrmQueryDetail) -> Self {
        self.detail = detail;
        self
    }

    /// Restrict the root selection.
    pub fn select(mut self, properties: &[&str]) -> Self {
        self.detail.select(properties);
        self
    }

    /// Join a path with the given selection and fetch mode.
    pub fn fetch(mut self, path: &str, properties: &[&str], fetch: FetchConfig) -> Self {
        self.detail.fetch(path, properties, fetch);
        self
    }

    /// Join a path described by the hint syntax (`"name +query(10)"`).
    pub fn fetch_hinted(mut self, path: &str, hint: &str) -> Result<Self> {
        self.detail.fetch_hinted(path, hint)?;
        Ok(self)
    }

    /// Add a restriction; repeated calls are joined with `and`.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Comma separated `path [asc|desc]` terms.
    pub fn order_by(mut self, order_by: &str) -> Self {
        self.order_by = Some(order_by.to_string());
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn limit(mut self, max_rows: u32) -> Self {
        self.max_rows = Some(max_rows);
        self
    }

    pub fn offset(mut self, first_row: u32) -> Self {
        self.first_row = Some(first_row);
        self
    }

    /// Beans of every path are returned read-only.
    pub fn read_only(mut self) -> Self {
        self.detail.set_read_only(true);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn detail(&self) -> &OrmQueryDetail {
        &self.detail
    }

    pub fn predicate(&self) -> Option<&Expr> {
        self.predicate.as_ref()
    }

    pub fn order_by_clause(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn max_rows(&self) -> Option<u32> {
        self.max_rows
    }

    pub fn first_row(&self) -> Option<u32> {
        self.first_row
    }

    /// Plan cache key.
    ///
    /// Covers everything that shapes the SQL text and the row reader, and
    /// nothing that only shapes bind values.
    pub fn plan_key(&self, dialect: Dialect) -> u64 {
        cache_key(&PlanShape {
            query: self,
            dialect,
        })
    }

    /// Bind values of the predicate in placeholder order.
    pub fn bind_values(&self, map: &DescriptorMap) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        if let Some(predicate) = &self.predicate {
            let root = map.get(&self.entity)?;
            predicate.bind_values(map, root, &mut values)?;
        }
        Ok(values)
    }
}

struct PlanShape<'a> {
    query: &'a Query,
    dialect: Dialect,
}

impl Hash for PlanShape<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let q = self.query;
        q.entity.hash(state);
        q.detail.hash(state);
        match &q.predicate {
            Some(expr) => {
                1u8.hash(state);
                expr.hash_shape(state);
            }
            None => 0u8.hash(state),
        }
        q.order_by.hash(state);
        q.distinct.hash(state);
        q.max_rows.hash(state);
        q.first_row.hash(state);
        self.dialect.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_key_ignores_literals() {
        let a = Query::new("Order").filter(Expr::eq("status", "NEW"));
        let b = Query::new("Order").filter(Expr::eq("status", "OLD"));
        assert_eq!(a.plan_key(Dialect::Postgres), b.plan_key(Dialect::Postgres));
    }

    #[test]
    fn test_plan_key_tracks_shape() {
        let base = Query::new("Order").filter(Expr::eq("status", "NEW"));
        let other_op = Query::new("Order").filter(Expr::ne("status", "NEW"));
        let joined = base
            .clone()
            .fetch("customer", &["name"], FetchConfig::join());
        let limited = base.clone().limit(10);
        let key = base.plan_key(Dialect::Postgres);
        assert_ne!(key, other_op.plan_key(Dialect::Postgres));
        assert_ne!(key, joined.plan_key(Dialect::Postgres));
        assert_ne!(key, limited.plan_key(Dialect::Postgres));
        assert_ne!(key, base.plan_key(Dialect::Sqlite));
    }

    #[test]
    fn test_filters_are_conjoined() {
        let query = Query::new("Order")
            .filter(Expr::eq("status", "NEW"))
            .filter(Expr::is_null("customer"));
        assert!(matches!(query.predicate(), Some(Expr::And(parts)) if parts.len() == 2));
    }
}
