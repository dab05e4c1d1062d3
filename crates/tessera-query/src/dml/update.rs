use super::bindable::{Bindable, DmlColumn, next_version};
use super::DmlStatement;
use std::sync::Arc;
use tessera_core::{
    Bean, BeanDescriptor, BindValues, ConcurrencyMode, DataBind, DescriptorMap, Error,
    GenerateDmlRequest, PropertyValue, Result, Value,
};

/// Update statements of one type.
///
/// The full-row statements for the `None` and `Version` modes are built once;
/// dirty-only statements and the `All` mode are generated per request with
/// the same column machinery.
#[derive(Debug, Clone)]
pub struct UpdateMeta {
    descriptor: Arc<BeanDescriptor>,
    table: String,
    columns: Vec<DmlColumn>,
    version: Option<Bindable>,
    sql_none: String,
    sql_version: Option<String>,
}

/// A prepared update plus the version value to apply once it succeeds.
#[derive(Debug, Clone)]
pub struct UpdateStatement {
    pub statement: DmlStatement,
    pub next_version: Option<(usize, Value)>,
}

impl UpdateMeta {
    pub fn build(map: &DescriptorMap, desc: &Arc<BeanDescriptor>) -> Result<Self> {
        let table = desc.table()?.to_string();
        let mut columns = Vec::new();
        for prop in desc.properties() {
            if prop.id || prop.version || !prop.updatable {
                continue;
            }
            if let Some(column) = DmlColumn::of(map, prop)? {
                columns.push(column);
            }
        }
        let version = Bindable::version_of(desc);
        let all: Vec<&DmlColumn> = columns.iter().collect();
        let sql_none = generate(desc, &table, &all, version.as_ref(), false, &[]);
        let sql_version = version
            .as_ref()
            .map(|v| generate(desc, &table, &all, Some(v), true, &[]));
        tracing::debug!(entity = desc.name(), sql = %sql_none, "Built update meta");
        Ok(Self {
            descriptor: Arc::clone(desc),
            table,
            columns,
            version,
            sql_none,
            sql_version,
        })
    }

    /// The cached full-row statement for `mode`.
    pub fn sql(&self, mode: ConcurrencyMode) -> &str {
        match (mode, &self.sql_version) {
            (ConcurrencyMode::Version, Some(sql)) => sql,
            _ => &self.sql_none,
        }
    }

    /// Statement updating `bean`, or `None` when nothing changed.
    pub fn prepare(
        &self,
        bean: &Bean,
        mode: ConcurrencyMode,
        dynamic: bool,
    ) -> Result<Option<UpdateStatement>> {
        if !bean.is_dirty() {
            return Ok(None);
        }
        let id = bean.id().ok_or_else(|| {
            Error::mapping(self.descriptor.name(), "cannot update a bean without id")
        })?;
        let dirty = bean.dirty_positions();

        // an unloaded version is unknown: it is neither bumped nor checked
        let current_version = match &self.version {
            Some(Bindable::Version { position, .. }) if bean.is_loaded(*position) => Some((
                *position,
                bean.value_at(*position)
                    .and_then(PropertyValue::as_value)
                    .cloned()
                    .unwrap_or(Value::Null),
            )),
            _ => None,
        };
        let version = current_version.as_ref().and(self.version.as_ref());
        let check_version = mode == ConcurrencyMode::Version
            && current_version.as_ref().is_some_and(|(_, v)| !v.is_null());

        // the cached statement writes every column, so only a fully loaded
        // bean may use it
        let full_row = !dynamic
            && mode != ConcurrencyMode::All
            && (self.version.is_none() || current_version.is_some())
            && self.columns.iter().all(|c| bean.is_loaded(c.position()));
        let set: Vec<&DmlColumn> = if full_row {
            self.columns.iter().collect()
        } else if dynamic || mode == ConcurrencyMode::All {
            self.columns
                .iter()
                .filter(|c| dirty.contains(&c.position()))
                .collect()
        } else {
            self.columns
                .iter()
                .filter(|c| bean.is_loaded(c.position()))
                .collect()
        };
        if set.is_empty() {
            return Ok(None);
        }

        // only values observed before the change guard the row
        let mut old_values = Vec::new();
        if mode == ConcurrencyMode::All {
            for column in &set {
                let Some(old) = bean.old_value(column.position()) else {
                    continue;
                };
                for (name, _, value) in column.column_values(Some(old))? {
                    old_values.push((name.to_string(), value));
                }
            }
        }

        let sql = if full_row {
            self.sql(if check_version {
                ConcurrencyMode::Version
            } else {
                ConcurrencyMode::None
            })
            .to_string()
        } else {
            generate(
                &self.descriptor,
                &self.table,
                &set,
                version,
                check_version,
                &old_values,
            )
        };

        let mut binds = BindValues::new();
        for column in &set {
            column.bind(bean, &mut binds)?;
        }
        let next_version = match (&self.version, &current_version) {
            (Some(Bindable::Version { sql_type, .. }), Some((position, current))) => {
                let next = next_version(current)?;
                binds.bind(next.clone(), sql_type);
                Some((*position, next))
            }
            _ => None,
        };
        self.descriptor.id_binder().bind_id(&mut binds, &id)?;
        if check_version {
            if let Some(version) = &self.version {
                version.bind(bean, &mut binds)?;
            }
        }
        let concurrency_checked = check_version || !old_values.is_empty();
        for (_, value) in old_values {
            if !value.is_null() {
                binds.set_value(value);
            }
        }

        Ok(Some(UpdateStatement {
            statement: DmlStatement {
                sql,
                binds,
                concurrency_checked,
            },
            next_version,
        }))
    }
}

fn generate(
    desc: &BeanDescriptor,
    table: &str,
    set: &[&DmlColumn],
    version: Option<&Bindable>,
    check_version: bool,
    old_values: &[(String, Value)],
) -> String {
    let mut request = GenerateDmlRequest::new();
    request.append("update ").append(table).append(" set ");
    request.set_update_set_mode();
    for column in set {
        column.dml_append(&mut request);
    }
    if let Some(version) = version {
        version.dml_append(desc, &mut request);
    }
    request.append(" where ");
    request.set_where_id_mode();
    Bindable::Id.dml_append(desc, &mut request);
    if let (true, Some(version)) = (check_version, version) {
        request.set_where_mode();
        version.dml_append(desc, &mut request);
    }
    for (column, value) in old_values {
        if value.is_null() {
            request.set_where_is_null_mode();
        } else {
            request.set_where_mode();
        }
        request.append_column(column);
    }
    request.into_sql()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{BeanProperty, BeanState, IdValue, SqlType};

    fn map() -> DescriptorMap {
        DescriptorMap::build(vec![
            BeanDescriptor::builder("Customer")
                .table("customer")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::scalar("name", "name", SqlType::VarChar(40)))
                .property(BeanProperty::scalar("email", "email", SqlType::VarChar(80)))
                .property(BeanProperty::scalar("created", "created", SqlType::Timestamp).not_updatable())
                .property(BeanProperty::scalar("version", "version", SqlType::BigInt).version()),
        ])
        .unwrap()
    }

    fn loaded(map: &DescriptorMap, email: Value) -> Bean {
        let desc = map.get("Customer").unwrap();
        let mut bean = Bean::for_load(Arc::clone(desc));
        bean.load_value(0, PropertyValue::Scalar(Value::BigInt(1)));
        bean.load_value(1, PropertyValue::Scalar(Value::Text("Ann".into())));
        bean.load_value(2, PropertyValue::Scalar(email));
        bean.load_value(3, PropertyValue::Scalar(Value::Null));
        bean.load_value(4, PropertyValue::Scalar(Value::BigInt(3)));
        bean.set_state(BeanState::Loaded);
        bean
    }

    #[test]
    fn test_full_statements() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        assert_eq!(
            meta.sql(ConcurrencyMode::None),
            "update customer set name=?, email=?, version=? where id=?"
        );
        assert_eq!(
            meta.sql(ConcurrencyMode::Version),
            "update customer set name=?, email=?, version=? where id=? and version=?"
        );
    }

    #[test]
    fn test_dynamic_update_only_dirty_columns() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        let mut bean = loaded(&map, Value::Text("a@x".into()));
        bean.set_value("name", "Bea").unwrap();

        let update = meta
            .prepare(&bean, ConcurrencyMode::Version, true)
            .unwrap()
            .unwrap();
        assert_eq!(
            update.statement.sql,
            "update customer set name=?, version=? where id=? and version=?"
        );
        assert_eq!(
            update.statement.binds.values(),
            &[
                Value::Text("Bea".into()),
                Value::BigInt(4),
                Value::BigInt(1),
                Value::BigInt(3),
            ]
        );
        assert_eq!(update.next_version, Some((4, Value::BigInt(4))));
        assert!(update.statement.concurrency_checked);
        assert_eq!(bean.id(), Some(IdValue::from(1i64)));
    }

    #[test]
    fn test_all_mode_uses_is_null_for_null_old_value() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        let mut bean = loaded(&map, Value::Null);
        bean.set_value("email", "b@x").unwrap();
        bean.set_value("name", "Bea").unwrap();

        let update = meta
            .prepare(&bean, ConcurrencyMode::All, true)
            .unwrap()
            .unwrap();
        assert_eq!(
            update.statement.sql,
            "update customer set name=?, email=?, version=? where id=? and name=? and email is null"
        );
        assert_eq!(
            update.statement.binds.values(),
            &[
                Value::Text("Bea".into()),
                Value::Text("b@x".into()),
                Value::BigInt(4),
                Value::BigInt(1),
                Value::Text("Ann".into()),
            ]
        );
    }

    /// Only the id and version were selected.
    fn partial(map: &DescriptorMap) -> Bean {
        let desc = map.get("Customer").unwrap();
        let mut bean = Bean::for_load(Arc::clone(desc));
        bean.load_value(0, PropertyValue::Scalar(Value::BigInt(1)));
        bean.load_value(4, PropertyValue::Scalar(Value::BigInt(3)));
        bean.set_state(BeanState::Loaded);
        bean
    }

    #[test]
    fn test_full_row_update_for_loaded_bean() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        let mut bean = loaded(&map, Value::Text("a@x".into()));
        bean.set_value("name", "Bea").unwrap();

        let update = meta
            .prepare(&bean, ConcurrencyMode::Version, false)
            .unwrap()
            .unwrap();
        assert_eq!(update.statement.sql, meta.sql(ConcurrencyMode::Version));
        assert_eq!(
            update.statement.binds.values(),
            &[
                Value::Text("Bea".into()),
                Value::Text("a@x".into()),
                Value::BigInt(4),
                Value::BigInt(1),
                Value::BigInt(3),
            ]
        );

        let update = meta
            .prepare(&bean, ConcurrencyMode::None, false)
            .unwrap()
            .unwrap();
        assert_eq!(update.statement.sql, meta.sql(ConcurrencyMode::None));
        assert!(!update.statement.concurrency_checked);
    }

    #[test]
    fn test_full_row_update_skips_unloaded_columns_of_partial_bean() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        let mut bean = partial(&map);
        bean.set_value("name", "Bea").unwrap();

        let update = meta
            .prepare(&bean, ConcurrencyMode::Version, false)
            .unwrap()
            .unwrap();
        assert_eq!(
            update.statement.sql,
            "update customer set name=?, version=? where id=? and version=?"
        );
        assert_eq!(
            update.statement.binds.values(),
            &[
                Value::Text("Bea".into()),
                Value::BigInt(4),
                Value::BigInt(1),
                Value::BigInt(3),
            ]
        );
    }

    #[test]
    fn test_all_mode_guards_only_observed_old_values() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        let mut bean = partial(&map);
        bean.set_value("name", "Bea").unwrap();

        let update = meta
            .prepare(&bean, ConcurrencyMode::All, true)
            .unwrap()
            .unwrap();
        assert_eq!(
            update.statement.sql,
            "update customer set name=?, version=? where id=?"
        );
        assert_eq!(
            update.statement.binds.values(),
            &[Value::Text("Bea".into()), Value::BigInt(4), Value::BigInt(1)]
        );
        assert!(!update.statement.concurrency_checked);

        bean.load_value(2, PropertyValue::Scalar(Value::Text("a@x".into())));
        bean.set_value("email", "b@x").unwrap();
        let update = meta
            .prepare(&bean, ConcurrencyMode::All, true)
            .unwrap()
            .unwrap();
        assert_eq!(
            update.statement.sql,
            "update customer set name=?, email=?, version=? where id=? and email=?"
        );
        assert_eq!(
            update.statement.binds.values(),
            &[
                Value::Text("Bea".into()),
                Value::Text("b@x".into()),
                Value::BigInt(4),
                Value::BigInt(1),
                Value::Text("a@x".into()),
            ]
        );
        assert!(update.statement.concurrency_checked);
    }

    #[test]
    fn test_unloaded_version_is_neither_bumped_nor_checked() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        let desc = map.get("Customer").unwrap();
        let mut bean = Bean::reference(Arc::clone(desc), &IdValue::from(1i64)).unwrap();
        bean.set_value("name", "Bea").unwrap();

        for (mode, dynamic) in [
            (ConcurrencyMode::Version, true),
            (ConcurrencyMode::Version, false),
            (ConcurrencyMode::None, false),
            (ConcurrencyMode::All, true),
        ] {
            let update = meta.prepare(&bean, mode, dynamic).unwrap().unwrap();
            assert_eq!(update.statement.sql, "update customer set name=? where id=?");
            assert_eq!(
                update.statement.binds.values(),
                &[Value::Text("Bea".into()), Value::BigInt(1)]
            );
            assert_eq!(update.next_version, None);
            assert!(!update.statement.concurrency_checked);
        }
    }

    #[test]
    fn test_clean_bean_needs_no_update() {
        let map = map();
        let meta = UpdateMeta::build(&map, map.get("Customer").unwrap()).unwrap();
        let bean = loaded(&map, Value::Null);
        assert!(meta.prepare(&bean, ConcurrencyMode::Version, true).unwrap().is_none());
    }
}
