//! Predicate expressions over property paths.
//!
//! Expressions name properties by dotted path; the compiler resolves them to
//! alias qualified columns. Literal values never reach the SQL text, so two
//! predicates with the same structure share one compiled plan.

use std::hash::{Hash, Hasher};
use tessera_core::{BeanDescriptor, DescriptorMap, Error, IdValue, Result, Value};

use crate::detail::resolve_path;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl CompareOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => " like ",
        }
    }
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    IsNull(String),
    NotNull(String),
    In {
        path: String,
        values: Vec<Value>,
    },
    /// Keys of the root (`path == ""`) or of a to-one association, matched
    /// through the foreign key columns without joining the target.
    IdIn {
        path: String,
        ids: Vec<IdValue>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// Raw SQL with `?` placeholders; `${ta}` is replaced by the root alias.
    Raw {
        sql: String,
        values: Vec<Value>,
    },
}

impl Expr {
    fn compare(path: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        Expr::Compare {
            path: path.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Eq, value)
    }

    pub fn ne(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ne, value)
    }

    pub fn lt(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Lt, value)
    }

    pub fn le(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Le, value)
    }

    pub fn gt(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Gt, value)
    }

    pub fn ge(path: &str, value: impl Into<Value>) -> Self {
        Self::compare(path, CompareOp::Ge, value)
    }

    pub fn like(path: &str, pattern: &str) -> Self {
        Self::compare(path, CompareOp::Like, pattern)
    }

    pub fn is_null(path: &str) -> Self {
        Expr::IsNull(path.to_string())
    }

    pub fn not_null(path: &str) -> Self {
        Expr::NotNull(path.to_string())
    }

    pub fn in_list(path: &str, values: Vec<impl Into<Value>>) -> Self {
        Expr::In {
            path: path.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Root key equals `id`.
    pub fn id_eq(id: impl Into<IdValue>) -> Self {
        Expr::IdIn {
            path: String::new(),
            ids: vec![id.into()],
        }
    }

    /// Root key in `ids`.
    pub fn id_in(ids: Vec<IdValue>) -> Self {
        Expr::IdIn {
            path: String::new(),
            ids,
        }
    }

    /// Key of the to-one association at `path` in `ids`.
    pub fn assoc_id_in(path: &str, ids: Vec<IdValue>) -> Self {
        Expr::IdIn {
            path: path.to_string(),
            ids,
        }
    }

    pub fn raw(sql: &str, values: Vec<Value>) -> Self {
        Expr::Raw {
            sql: sql.to_string(),
            values,
        }
    }

    /// Conjunction with `other`, flattening nested conjunctions.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut parts) => {
                parts.push(other);
                Expr::And(parts)
            }
            first => Expr::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut parts) => {
                parts.push(other);
                Expr::Or(parts)
            }
            first => Expr::Or(vec![first, other]),
        }
    }

    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Hash the structure: paths, operators and list lengths, never values.
    pub fn hash_shape<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Expr::Compare { path, op, .. } => {
                path.hash(state);
                op.hash(state);
            }
            Expr::IsNull(path) | Expr::NotNull(path) => path.hash(state),
            Expr::In { path, values } => {
                path.hash(state);
                values.len().hash(state);
            }
            Expr::IdIn { path, ids } => {
                path.hash(state);
                ids.len().hash(state);
            }
            Expr::And(parts) | Expr::Or(parts) => {
                parts.len().hash(state);
                for part in parts {
                    part.hash_shape(state);
                }
            }
            Expr::Not(inner) => inner.hash_shape(state),
            Expr::Raw { sql, values } => {
                sql.hash(state);
                values.len().hash(state);
            }
        }
    }

    /// Property paths referenced by the expression (excluding id lists).
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Compare { path, .. }
            | Expr::IsNull(path)
            | Expr::NotNull(path)
            | Expr::In { path, .. } => out.push(path),
            Expr::IdIn { .. } | Expr::Raw { .. } => {}
            Expr::And(parts) | Expr::Or(parts) => {
                for part in parts {
                    part.collect_paths(out);
                }
            }
            Expr::Not(inner) => inner.collect_paths(out),
        }
    }

    /// Render SQL through `resolver`, returning the number of placeholders.
    pub fn append_sql(&self, resolver: &mut dyn PathResolver, sql: &mut String) -> Result<usize> {
        match self {
            Expr::Compare { path, op, .. } => {
                sql.push_str(&resolver.column(path)?);
                sql.push_str(op.as_str());
                sql.push('?');
                Ok(1)
            }
            Expr::IsNull(path) => {
                sql.push_str(&resolver.column(path)?);
                sql.push_str(" is null");
                Ok(0)
            }
            Expr::NotNull(path) => {
                sql.push_str(&resolver.column(path)?);
                sql.push_str(" is not null");
                Ok(0)
            }
            Expr::In { path, values } => {
                if values.is_empty() {
                    sql.push_str("1=0");
                    return Ok(0);
                }
                sql.push_str(&resolver.column(path)?);
                sql.push_str(" in (");
                sql.push_str(&vec!["?"; values.len()].join(","));
                sql.push(')');
                Ok(values.len())
            }
            Expr::IdIn { path, ids } => {
                if ids.is_empty() {
                    sql.push_str("1=0");
                    return Ok(0);
                }
                let columns = resolver.id_columns(path)?;
                sql.push_str(&tessera_core::deploy::in_clause(&columns, ids.len()));
                Ok(columns.len() * ids.len())
            }
            Expr::And(parts) if parts.is_empty() => {
                sql.push_str("1=1");
                Ok(0)
            }
            Expr::Or(parts) if parts.is_empty() => {
                sql.push_str("1=0");
                Ok(0)
            }
            Expr::And(parts) => append_joined(parts, " and ", resolver, sql),
            Expr::Or(parts) => {
                sql.push('(');
                let count = append_joined(parts, " or ", resolver, sql)?;
                sql.push(')');
                Ok(count)
            }
            Expr::Not(inner) => {
                sql.push_str("not (");
                let count = inner.append_sql(resolver, sql)?;
                sql.push(')');
                Ok(count)
            }
            Expr::Raw { sql: raw, values } => {
                sql.push_str(&raw.replace("${ta}", resolver.root_alias()));
                Ok(values.len())
            }
        }
    }

    /// Collect bind values in placeholder order.
    pub fn bind_values(
        &self,
        map: &DescriptorMap,
        root: &BeanDescriptor,
        out: &mut Vec<Value>,
    ) -> Result<()> {
        match self {
            Expr::Compare { value, .. } => out.push(value.clone()),
            Expr::IsNull(_) | Expr::NotNull(_) => {}
            Expr::In { values, .. } | Expr::Raw { values, .. } => out.extend(values.iter().cloned()),
            Expr::IdIn { path, ids } => {
                let binder = if path.is_empty() {
                    root.id_binder()
                } else {
                    let root = map.get(root.name())?;
                    let resolved = resolve_path(map, root, path)?;
                    let one = resolved.property().assoc_one().ok_or_else(|| {
                        Error::mapping_property(root.name(), path, "id restriction needs a to-one association")
                    })?;
                    map.get(&one.target)?.id_binder()
                };
                for id in ids {
                    out.extend(binder.bind_values(id)?);
                }
            }
            Expr::And(parts) | Expr::Or(parts) => {
                for part in parts {
                    part.bind_values(map, root, out)?;
                }
            }
            Expr::Not(inner) => inner.bind_values(map, root, out)?,
        }
        Ok(())
    }
}

fn append_joined(
    parts: &[Expr],
    separator: &str,
    resolver: &mut dyn PathResolver,
    sql: &mut String,
) -> Result<usize> {
    let mut count = 0;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            sql.push_str(separator);
        }
        count += part.append_sql(resolver, sql)?;
    }
    Ok(count)
}

/// Translates property paths to columns while rendering a predicate.
pub trait PathResolver {
    /// Alias qualified column of a scalar (or single column foreign key) path.
    fn column(&mut self, path: &str) -> Result<String>;

    /// Key columns for an id restriction: the root's id columns for `""`,
    /// otherwise the foreign key columns of the to-one association at `path`.
    fn id_columns(&mut self, path: &str) -> Result<Vec<String>>;

    fn root_alias(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::collections::hash_map::DefaultHasher;

    struct Columns(HashMap<&'static str, &'static str>);

    impl PathResolver for Columns {
        fn column(&mut self, path: &str) -> Result<String> {
            self.0
                .get(path)
                .map(|c| (*c).to_string())
                .ok_or_else(|| Error::mapping("Order", path))
        }

        fn id_columns(&mut self, path: &str) -> Result<Vec<String>> {
            Ok(if path.is_empty() {
                vec!["o.id".to_string()]
            } else {
                vec!["o.customer_id".to_string()]
            })
        }

        fn root_alias(&self) -> &str {
            "o"
        }
    }

    fn resolver() -> Columns {
        Columns(HashMap::from([
            ("status", "o.status"),
            ("customer.name", "oc.name"),
        ]))
    }

    fn shape(expr: &Expr) -> u64 {
        let mut hasher = DefaultHasher::new();
        expr.hash_shape(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_render_nested() {
        let expr = Expr::eq("status", "NEW")
            .and(Expr::like("customer.name", "A%").or(Expr::is_null("status")))
            .and(Expr::id_in(vec![IdValue::from(1i64), IdValue::from(2i64)]));
        let mut sql = String::new();
        let binds = expr.append_sql(&mut resolver(), &mut sql).unwrap();
        assert_eq!(
            sql,
            "o.status=? and (oc.name like ? or o.status is null) and o.id in (?,?)"
        );
        assert_eq!(binds, 4);
    }

    #[test]
    fn test_empty_junctions() {
        let expr = Expr::Or(Vec::new()).and(Expr::eq("status", "NEW"));
        let mut sql = String::new();
        let binds = expr.append_sql(&mut resolver(), &mut sql).unwrap();
        assert_eq!(sql, "1=0 and o.status=?");
        assert_eq!(binds, 1);

        let mut sql = String::new();
        Expr::Not(Box::new(Expr::And(Vec::new())))
            .append_sql(&mut resolver(), &mut sql)
            .unwrap();
        assert_eq!(sql, "not (1=1)");
    }

    #[test]
    fn test_shape_ignores_values() {
        assert_eq!(shape(&Expr::eq("status", "NEW")), shape(&Expr::eq("status", "OLD")));
        assert_ne!(shape(&Expr::eq("status", "NEW")), shape(&Expr::ne("status", "NEW")));
        assert_ne!(
            shape(&Expr::in_list("status", vec!["A"])),
            shape(&Expr::in_list("status", vec!["A", "B"]))
        );
    }

    #[test]
    fn test_raw_alias_and_unknown_path() {
        let mut sql = String::new();
        Expr::raw("${ta}.total > ?", vec![Value::BigInt(5)])
            .append_sql(&mut resolver(), &mut sql)
            .unwrap();
        assert_eq!(sql, "o.total > ?");
        let mut sql = String::new();
        assert!(Expr::eq("nope", 1).append_sql(&mut resolver(), &mut sql).is_err());
    }
}
