//! Column groups of a DML statement and how their values are bound.
//!
//! Each group appends its columns to a [`GenerateDmlRequest`] and binds its
//! values to a [`DataBind`] in the same order, so text and binds can only
//! drift apart if a caller interleaves groups differently between the two.

use std::sync::Arc;
use tessera_core::{
    Bean, BeanDescriptor, BeanProperty, DataBind, DescriptorMap, Error, GenerateDmlRequest,
    PropertyKind, PropertyValue, Result, SqlType, Value, read_bean,
};

/// One property written by a DML statement.
#[derive(Debug, Clone)]
pub enum DmlColumn {
    Scalar {
        position: usize,
        column: String,
        sql_type: SqlType,
    },
    /// Foreign key columns of a to-one, bound from the referenced bean's id.
    ForeignKey {
        position: usize,
        columns: Vec<(String, SqlType)>,
        target: Arc<BeanDescriptor>,
    },
    /// Columns of an embedded bean, `(column, embeddable position, type)`.
    Embedded {
        position: usize,
        columns: Vec<(String, usize, SqlType)>,
    },
}

impl DmlColumn {
    /// The DML column(s) of `prop`; `None` for to-many properties.
    pub fn of(map: &DescriptorMap, prop: &BeanProperty) -> Result<Option<Self>> {
        let position = prop.position();
        Ok(match &prop.kind {
            PropertyKind::Scalar => Some(DmlColumn::Scalar {
                position,
                column: prop.db_column.clone(),
                sql_type: prop.sql_type.clone(),
            }),
            PropertyKind::AssocOne(one) => Some(DmlColumn::ForeignKey {
                position,
                columns: one
                    .imported
                    .iter()
                    .map(|c| (c.fk_column.clone(), c.sql_type.clone()))
                    .collect(),
                target: Arc::clone(map.get(&one.target)?),
            }),
            PropertyKind::Embedded(info) => {
                let embeddable = info.descriptor.as_ref().ok_or_else(|| {
                    Error::mapping_property(&prop.name, &info.target, "embeddable not resolved")
                })?;
                Some(DmlColumn::Embedded {
                    position,
                    columns: embeddable
                        .properties()
                        .iter()
                        .map(|p| {
                            (
                                format!("{}{}", info.column_prefix, p.db_column),
                                p.position(),
                                p.sql_type.clone(),
                            )
                        })
                        .collect(),
                })
            }
            PropertyKind::AssocMany(_) => None,
        })
    }

    pub fn position(&self) -> usize {
        match self {
            DmlColumn::Scalar { position, .. }
            | DmlColumn::ForeignKey { position, .. }
            | DmlColumn::Embedded { position, .. } => *position,
        }
    }

    pub fn dml_append(&self, request: &mut GenerateDmlRequest) {
        match self {
            DmlColumn::Scalar { column, .. } => request.append_column(column),
            DmlColumn::ForeignKey { columns, .. } => {
                for (column, _) in columns {
                    request.append_column(column);
                }
            }
            DmlColumn::Embedded { columns, .. } => {
                for (column, _, _) in columns {
                    request.append_column(column);
                }
            }
        }
    }

    /// `(column, type, value)` per column for a slot value.
    pub fn column_values(
        &self,
        value: Option<&PropertyValue>,
    ) -> Result<Vec<(&str, &SqlType, Value)>> {
        Ok(match self {
            DmlColumn::Scalar {
                column, sql_type, ..
            } => {
                let v = value
                    .and_then(PropertyValue::as_value)
                    .cloned()
                    .unwrap_or(Value::Null);
                vec![(column.as_str(), sql_type, v)]
            }
            DmlColumn::ForeignKey {
                columns, target, ..
            } => {
                let id = value
                    .and_then(PropertyValue::as_one)
                    .and_then(|b| read_bean(b).id());
                let values = match id {
                    Some(id) => target.id_binder().bind_values(&id)?,
                    None => vec![Value::Null; columns.len()],
                };
                columns
                    .iter()
                    .zip(values)
                    .map(|((column, sql_type), v)| (column.as_str(), sql_type, v))
                    .collect()
            }
            DmlColumn::Embedded { columns, .. } => {
                let embedded = match value {
                    Some(PropertyValue::Embedded(Some(bean))) => Some(bean),
                    _ => None,
                };
                columns
                    .iter()
                    .map(|(column, inner, sql_type)| {
                        let v = embedded
                            .and_then(|b| b.value_at(*inner))
                            .and_then(PropertyValue::as_value)
                            .cloned()
                            .unwrap_or(Value::Null);
                        (column.as_str(), sql_type, v)
                    })
                    .collect()
            }
        })
    }

    /// Bind the current values of this property on `bean`.
    pub fn bind(&self, bean: &Bean, out: &mut dyn DataBind) -> Result<()> {
        for (_, sql_type, value) in self.column_values(bean.value_at(self.position()))? {
            out.bind(value, sql_type);
        }
        Ok(())
    }
}

/// Bind order groups of a DML statement.
#[derive(Debug, Clone)]
pub enum Bindable {
    /// Key columns via the descriptor's id binder
    Id,
    /// Discriminator column with the concrete type's value
    Discriminator { column: String, value: String },
    Properties(Vec<DmlColumn>),
    /// Version column, bound from the bean's current version
    Version {
        position: usize,
        column: String,
        sql_type: SqlType,
    },
}

impl Bindable {
    pub fn dml_append(&self, desc: &BeanDescriptor, request: &mut GenerateDmlRequest) {
        match self {
            Bindable::Id => desc.id_binder().dml_append(request),
            Bindable::Discriminator { column, .. } | Bindable::Version { column, .. } => {
                request.append_column(column);
            }
            Bindable::Properties(columns) => {
                for column in columns {
                    column.dml_append(request);
                }
            }
        }
    }

    pub fn bind(&self, bean: &Bean, out: &mut dyn DataBind) -> Result<()> {
        match self {
            Bindable::Id => {
                let desc = bean.descriptor();
                let id = bean.id().ok_or_else(|| {
                    Error::mapping(desc.name(), "bean has no id to bind")
                })?;
                desc.id_binder().bind_id(out, &id)?;
            }
            Bindable::Discriminator { value, .. } => out.set_value(Value::Text(value.clone())),
            Bindable::Properties(columns) => {
                for column in columns {
                    column.bind(bean, out)?;
                }
            }
            Bindable::Version {
                position,
                sql_type,
                ..
            } => {
                let value = bean
                    .value_at(*position)
                    .and_then(PropertyValue::as_value)
                    .cloned()
                    .unwrap_or(Value::Null);
                out.bind(value, sql_type);
            }
        }
        Ok(())
    }

    /// The version group of `desc`, if it has a version property.
    pub fn version_of(desc: &BeanDescriptor) -> Option<Self> {
        desc.version_property().map(|p| Bindable::Version {
            position: p.position(),
            column: p.db_column.clone(),
            sql_type: p.sql_type.clone(),
        })
    }
}

/// Next value of a version column.
pub fn next_version(current: &Value) -> Result<Value> {
    Ok(match current {
        Value::Null => Value::BigInt(1),
        Value::Int(v) => Value::Int(v + 1),
        Value::BigInt(v) => Value::BigInt(v + 1),
        other => {
            return Err(Error::Custom(format!(
                "unsupported version value {}",
                other.render()
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{BindValues, IdValue, new_ref};

    fn map() -> DescriptorMap {
        DescriptorMap::build(vec![
            BeanDescriptor::builder("Money")
                .embeddable()
                .property(BeanProperty::scalar("amount", "amount", SqlType::Double))
                .property(BeanProperty::scalar("currency", "currency", SqlType::VarChar(3))),
            BeanDescriptor::builder("Customer")
                .table("customer")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id()),
            BeanDescriptor::builder("Order")
                .table("orders")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::one("customer", "Customer"))
                .property(BeanProperty::embedded("total", "Money").column_prefix("total_")),
        ])
        .unwrap()
    }

    #[test]
    fn test_foreign_key_binds_target_id() {
        let map = map();
        let order_desc = map.get("Order").unwrap();
        let customer =
            new_ref(Bean::reference(Arc::clone(map.get("Customer").unwrap()), &IdValue::from(7i64)).unwrap());
        let mut order = Bean::new(Arc::clone(order_desc));
        order.set("customer", customer).unwrap();

        let column = DmlColumn::of(&map, order_desc.property("customer").unwrap())
            .unwrap()
            .unwrap();
        let mut request = GenerateDmlRequest::new();
        request.set_update_set_mode();
        column.dml_append(&mut request);
        assert_eq!(request.sql(), "customer_id=?");

        let mut binds = BindValues::new();
        column.bind(&order, &mut binds).unwrap();
        assert_eq!(binds.values(), &[Value::BigInt(7)]);
    }

    #[test]
    fn test_null_embedded_binds_nulls() {
        let map = map();
        let order_desc = map.get("Order").unwrap();
        let order = Bean::new(Arc::clone(order_desc));
        let column = DmlColumn::of(&map, order_desc.property("total").unwrap())
            .unwrap()
            .unwrap();
        let mut request = GenerateDmlRequest::new();
        request.set_insert_mode();
        column.dml_append(&mut request);
        assert_eq!(request.sql(), "total_amount, total_currency");
        let mut binds = BindValues::new();
        column.bind(&order, &mut binds).unwrap();
        assert_eq!(binds.values(), &[Value::Null, Value::Null]);
    }

    #[test]
    fn test_next_version() {
        assert_eq!(next_version(&Value::BigInt(3)).unwrap(), Value::BigInt(4));
        assert_eq!(next_version(&Value::Null).unwrap(), Value::BigInt(1));
        assert!(next_version(&Value::Text("x".into())).is_err());
    }
}
