//! Primary key binding for every id shape.
//!
//! One [`IdBinder`] per entity type hides whether the key is absent, a single
//! column, an embedded bean or several columns. Everything that touches key
//! columns (select lists, DML, bind calls, row reads) goes through the same
//! binder and therefore enumerates columns in the same order: the declaration
//! order of the id properties.

use super::BeanDescriptor;
use super::property::{BeanProperty, PropertyKind};
use crate::Result;
use crate::bean::{Bean, PropertyValue};
use crate::bind::DataBind;
use crate::dml_request::GenerateDmlRequest;
use crate::error::Error;
use crate::row::DataReader;
use crate::types::SqlType;
use crate::value::{Value, hash_value, key_eq};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A primary key value.
#[derive(Debug, Clone)]
pub enum IdValue {
    /// Single-column key
    Single(Value),
    /// Multi-column or embedded key as (property, value) pairs
    Composite(Vec<(String, Value)>),
}

impl IdValue {
    /// Build a composite key from (property, value) pairs.
    pub fn composite<V: Into<Value>>(pairs: impl IntoIterator<Item = (&'static str, V)>) -> Self {
        IdValue::Composite(
            pairs
                .into_iter()
                .map(|(name, v)| (name.to_string(), v.into()))
                .collect(),
        )
    }

    /// Value of one component of a composite key.
    pub fn get(&self, property: &str) -> Option<&Value> {
        match self {
            IdValue::Single(_) => None,
            IdValue::Composite(pairs) => pairs.iter().find(|(n, _)| n == property).map(|(_, v)| v),
        }
    }

    /// The value of a single-column key.
    pub fn as_single(&self) -> Option<&Value> {
        match self {
            IdValue::Single(v) => Some(v),
            IdValue::Composite(_) => None,
        }
    }
}

impl PartialEq for IdValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (IdValue::Single(a), IdValue::Single(b)) => key_eq(a, b),
            (IdValue::Composite(a), IdValue::Composite(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((na, va), (nb, vb))| na == nb && key_eq(va, vb))
            }
            _ => false,
        }
    }
}

impl Eq for IdValue {}

impl Hash for IdValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            IdValue::Single(v) => {
                0u8.hash(state);
                hash_value(v, state);
            }
            IdValue::Composite(pairs) => {
                1u8.hash(state);
                for (name, v) in pairs {
                    name.hash(state);
                    hash_value(v, state);
                }
            }
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Single(v) => write!(f, "{}", v.render()),
            IdValue::Composite(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(n, v)| format!("{}={}", n, v.render()))
                    .collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

impl From<Value> for IdValue {
    fn from(v: Value) -> Self {
        IdValue::Single(v)
    }
}

impl From<i64> for IdValue {
    fn from(v: i64) -> Self {
        IdValue::Single(Value::BigInt(v))
    }
}

impl From<i32> for IdValue {
    fn from(v: i32) -> Self {
        IdValue::Single(Value::Int(v))
    }
}

impl From<&str> for IdValue {
    fn from(v: &str) -> Self {
        IdValue::Single(Value::Text(v.to_string()))
    }
}

/// One key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdColumn {
    /// Id property name (embeddable property name for embedded ids)
    pub property: String,
    /// Database column
    pub column: String,
    pub sql_type: SqlType,
    /// Position of the property in its descriptor
    pub position: usize,
}

/// Key binding strategy of an entity type.
#[derive(Debug, Clone)]
pub struct IdBinder {
    entity: String,
    kind: IdKind,
}

/// The id shapes.
#[derive(Debug, Clone)]
pub enum IdKind {
    /// No id ("report" types); every operation is a no-op.
    Empty,
    /// One scalar id property.
    Simple(IdColumn),
    /// One embedded id property whose embeddable holds the key columns.
    Embedded {
        property: String,
        position: usize,
        embeddable: Arc<BeanDescriptor>,
        columns: Vec<IdColumn>,
    },
    /// Several scalar id properties.
    Multiple(Vec<IdColumn>),
}

impl IdBinder {
    /// Binder for a type without id.
    pub fn empty(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            kind: IdKind::Empty,
        }
    }

    /// Choose the binder shape from the id-flagged properties.
    ///
    /// Embedded properties must already carry their resolved embeddable.
    pub(crate) fn from_properties(entity: &str, properties: &[BeanProperty]) -> Result<Self> {
        let ids: Vec<&BeanProperty> = properties.iter().filter(|p| p.id).collect();
        let kind = match ids.as_slice() {
            [] => IdKind::Empty,
            [single] => match &single.kind {
                PropertyKind::Scalar => IdKind::Simple(IdColumn {
                    property: single.name.clone(),
                    column: single.db_column.clone(),
                    sql_type: single.sql_type.clone(),
                    position: single.position,
                }),
                PropertyKind::Embedded(info) => {
                    let embeddable = info.descriptor.clone().ok_or_else(|| {
                        Error::mapping_property(entity, &single.name, "embeddable not resolved")
                    })?;
                    let columns = embeddable
                        .properties()
                        .iter()
                        .map(|p| IdColumn {
                            property: p.name.clone(),
                            column: format!("{}{}", info.column_prefix, p.db_column),
                            sql_type: p.sql_type.clone(),
                            position: p.position,
                        })
                        .collect();
                    IdKind::Embedded {
                        property: single.name.clone(),
                        position: single.position,
                        embeddable,
                        columns,
                    }
                }
                _ => {
                    return Err(Error::mapping_property(
                        entity,
                        &single.name,
                        "associations cannot be ids",
                    ));
                }
            },
            many => {
                let mut columns = Vec::with_capacity(many.len());
                for p in many {
                    if !p.is_scalar() {
                        return Err(Error::mapping_property(
                            entity,
                            &p.name,
                            "multi-column ids must be scalar",
                        ));
                    }
                    columns.push(IdColumn {
                        property: p.name.clone(),
                        column: p.db_column.clone(),
                        sql_type: p.sql_type.clone(),
                        position: p.position,
                    });
                }
                IdKind::Multiple(columns)
            }
        };
        Ok(Self {
            entity: entity.to_string(),
            kind,
        })
    }

    pub fn kind(&self) -> &IdKind {
        &self.kind
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, IdKind::Empty)
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, IdKind::Embedded { .. } | IdKind::Multiple(_))
    }

    /// Key columns in declaration order.
    pub fn columns(&self) -> &[IdColumn] {
        match &self.kind {
            IdKind::Empty => &[],
            IdKind::Simple(col) => std::slice::from_ref(col),
            IdKind::Embedded { columns, .. } | IdKind::Multiple(columns) => columns,
        }
    }

    /// Key values in column order.
    pub fn bind_values(&self, id: &IdValue) -> Result<Vec<Value>> {
        match (&self.kind, id) {
            (IdKind::Empty, _) => Ok(Vec::new()),
            (IdKind::Simple(col), IdValue::Single(v)) => {
                Ok(vec![v.clone().coerce_to(&col.sql_type)?])
            }
            (IdKind::Simple(col), IdValue::Composite(pairs)) => match pairs.as_slice() {
                [(name, v)] if *name == col.property => {
                    Ok(vec![v.clone().coerce_to(&col.sql_type)?])
                }
                _ => Err(self.shape_error("expected a single id value")),
            },
            (IdKind::Embedded { columns, .. } | IdKind::Multiple(columns), IdValue::Composite(_)) => {
                columns
                    .iter()
                    .map(|col| {
                        id.get(&col.property)
                            .cloned()
                            .ok_or_else(|| {
                                Error::mapping_property(
                                    &self.entity,
                                    &col.property,
                                    "id component missing",
                                )
                            })
                            .and_then(|v| v.coerce_to(&col.sql_type))
                    })
                    .collect()
            }
            (IdKind::Embedded { .. } | IdKind::Multiple(_), IdValue::Single(_)) => {
                Err(self.shape_error("expected a composite id of (property, value) pairs"))
            }
        }
    }

    /// Normalize a key: coerce component types and order components by declaration.
    pub fn normalize(&self, id: &IdValue) -> Result<IdValue> {
        let values = self.bind_values(id)?;
        Ok(self.from_values(values))
    }

    fn from_values(&self, mut values: Vec<Value>) -> IdValue {
        match &self.kind {
            IdKind::Empty => IdValue::Composite(Vec::new()),
            IdKind::Simple(_) => IdValue::Single(values.pop().unwrap_or(Value::Null)),
            IdKind::Embedded { columns, .. } | IdKind::Multiple(columns) => IdValue::Composite(
                columns
                    .iter()
                    .map(|c| c.property.clone())
                    .zip(values)
                    .collect(),
            ),
        }
    }

    /// Bind the key; returns the 1-based index of the next parameter.
    pub fn bind_id(&self, binder: &mut dyn DataBind, id: &IdValue) -> Result<usize> {
        let values = self.bind_values(id)?;
        for (value, col) in values.into_iter().zip(self.columns()) {
            binder.bind(value, &col.sql_type);
        }
        Ok(binder.position())
    }

    /// Read the key columns; `None` when every key column is null.
    pub fn read(&self, reader: &mut dyn DataReader) -> Result<Option<IdValue>> {
        let columns = self.columns();
        if columns.is_empty() {
            return Ok(None);
        }
        let mut values = Vec::with_capacity(columns.len());
        for col in columns {
            values.push(reader.get_value()?.coerce_to(&col.sql_type)?);
        }
        if values.iter().all(Value::is_null) {
            return Ok(None);
        }
        Ok(Some(self.from_values(values)))
    }

    /// Append alias-qualified key columns to a select list.
    pub fn append_select(&self, alias: &str, out: &mut Vec<String>) {
        for col in self.columns() {
            out.push(format!("{}.{}", alias, col.column));
        }
    }

    /// Append the key columns to a DML statement in the request's current mode.
    pub fn dml_append(&self, request: &mut GenerateDmlRequest) {
        for col in self.columns() {
            request.append_column(&col.column);
        }
    }

    /// Default ordering for queries of this type.
    pub fn default_order_by(&self, alias: &str) -> Option<String> {
        let cols: Vec<String> = self
            .columns()
            .iter()
            .map(|c| format!("{}.{}", alias, c.column))
            .collect();
        (!cols.is_empty()).then(|| cols.join(", "))
    }

    /// `alias.id=?` (or the conjunction over every key column).
    pub fn id_eq_clause(&self, alias: &str) -> String {
        self.columns()
            .iter()
            .map(|c| format!("{}.{}=?", alias, c.column))
            .collect::<Vec<_>>()
            .join(" and ")
    }

    /// Restriction matching `count` keys.
    pub fn id_in_clause(&self, alias: &str, count: usize) -> String {
        in_clause(
            &self
                .columns()
                .iter()
                .map(|c| format!("{}.{}", alias, c.column))
                .collect::<Vec<_>>(),
            count,
        )
    }

    /// Normalize a raw key (e.g. a generated key) and set it on the bean.
    pub fn convert_set_id(&self, raw: &IdValue, bean: Option<&mut Bean>) -> Result<IdValue> {
        let id = self.normalize(raw)?;
        if let Some(bean) = bean {
            self.set_on_bean(&id, bean)?;
        }
        Ok(id)
    }

    fn set_on_bean(&self, id: &IdValue, bean: &mut Bean) -> Result<()> {
        match &self.kind {
            IdKind::Empty => {}
            IdKind::Simple(col) => {
                if let IdValue::Single(v) = id {
                    bean.load_value(col.position, PropertyValue::Scalar(v.clone()));
                }
            }
            IdKind::Embedded {
                position,
                embeddable,
                columns,
                ..
            } => {
                let mut embedded = Bean::new(Arc::clone(embeddable));
                for col in columns {
                    let v = id.get(&col.property).cloned().unwrap_or(Value::Null);
                    embedded.load_value(col.position, PropertyValue::Scalar(v));
                }
                bean.load_value(*position, PropertyValue::Embedded(Some(Box::new(embedded))));
            }
            IdKind::Multiple(columns) => {
                for col in columns {
                    let v = id.get(&col.property).cloned().unwrap_or(Value::Null);
                    bean.load_value(col.position, PropertyValue::Scalar(v));
                }
            }
        }
        Ok(())
    }

    /// The key held by a bean, `None` while unset.
    pub fn id_for_bean(&self, bean: &Bean) -> Option<IdValue> {
        let values: Vec<Value> = match &self.kind {
            IdKind::Empty => return None,
            IdKind::Simple(col) => vec![scalar_at(bean, col.position)],
            IdKind::Embedded {
                position, columns, ..
            } => match bean.value_at(*position) {
                Some(PropertyValue::Embedded(Some(embedded))) => columns
                    .iter()
                    .map(|c| scalar_at(embedded, c.position))
                    .collect(),
                _ => return None,
            },
            IdKind::Multiple(columns) => columns.iter().map(|c| scalar_at(bean, c.position)).collect(),
        };
        if values.iter().all(Value::is_null) {
            return None;
        }
        Some(self.from_values(values))
    }

    fn shape_error(&self, message: &str) -> Error {
        Error::mapping(&self.entity, message)
    }
}

fn scalar_at(bean: &Bean, position: usize) -> Value {
    match bean.value_at(position) {
        Some(PropertyValue::Scalar(v)) => v.clone(),
        _ => Value::Null,
    }
}

/// `col in (?,?)` for one column, `((a=? and b=?) or (...))` for several.
pub fn in_clause(columns: &[String], count: usize) -> String {
    match columns {
        [] => "1=0".to_string(),
        [single] => {
            let marks = vec!["?"; count].join(",");
            format!("{} in ({})", single, marks)
        }
        many => {
            let one = many
                .iter()
                .map(|c| format!("{}=?", c))
                .collect::<Vec<_>>()
                .join(" and ");
            let all = vec![format!("({})", one); count].join(" or ");
            format!("({})", all)
        }
    }
}
