use super::bindable::{Bindable, DmlColumn};
use std::sync::Arc;
use tessera_core::{
    Bean, BeanDescriptor, DataBind, DescriptorMap, Dialect, GenerateDmlRequest, IdGeneration,
    Result,
};

/// Cached insert statements of one type.
///
/// Column order is id, discriminator, then every insertable property in
/// declaration order; binds follow the same order.
#[derive(Debug, Clone)]
pub struct InsertMeta {
    descriptor: Arc<BeanDescriptor>,
    discriminator: Option<Bindable>,
    properties: Bindable,
    sql_with_id: String,
    sql_without_id: Option<String>,
    native_keys: bool,
    fallback_key_sql: Option<String>,
}

impl InsertMeta {
    pub fn build(map: &DescriptorMap, desc: &Arc<BeanDescriptor>, dialect: Dialect) -> Result<Self> {
        let table = desc.table()?.to_string();
        let discriminator = desc.inheritance().map(|i| Bindable::Discriminator {
            column: i.discriminator_column.clone(),
            value: i.discriminator_value.clone(),
        });
        let mut columns = Vec::new();
        for prop in desc.properties() {
            if prop.id || !prop.insertable {
                continue;
            }
            if let Some(column) = DmlColumn::of(map, prop)? {
                columns.push(column);
            }
        }
        let properties = Bindable::Properties(columns);

        let generate = |with_id: bool| {
            let mut request = GenerateDmlRequest::new();
            request.append("insert into ").append(&table).append(" (");
            request.set_insert_mode();
            if with_id {
                Bindable::Id.dml_append(desc, &mut request);
            }
            if let Some(disc) = &discriminator {
                disc.dml_append(desc, &mut request);
            }
            properties.dml_append(desc, &mut request);
            request.close_insert();
            request.into_sql()
        };
        let sql_with_id = generate(true);
        let identity = desc.id_generation() == IdGeneration::Identity;
        let sql_without_id = identity.then(|| generate(false));
        let native_keys = dialect.supports_generated_keys();
        let fallback_key_sql = (identity && !native_keys).then(|| dialect.last_insert_id_sql(&table));

        tracing::debug!(entity = desc.name(), sql = %sql_with_id, "Built insert meta");
        Ok(Self {
            descriptor: Arc::clone(desc),
            discriminator,
            properties,
            sql_with_id,
            sql_without_id,
            native_keys,
            fallback_key_sql,
        })
    }

    /// Whether inserting `bean` leaves the key to the database.
    pub fn uses_generated_key(&self, bean: &Bean) -> bool {
        self.sql_without_id.is_some() && bean.id().is_none()
    }

    pub fn sql(&self, with_id: bool) -> &str {
        match (&self.sql_without_id, with_id) {
            (Some(sql), false) => sql,
            _ => &self.sql_with_id,
        }
    }

    /// Whether the driver hands back generated keys with the insert.
    pub fn native_generated_keys(&self) -> bool {
        self.native_keys
    }

    /// Statement reading the generated key when the driver cannot.
    pub fn fallback_key_sql(&self) -> Option<&str> {
        self.fallback_key_sql.as_deref()
    }

    /// Bind `bean` in column order.
    pub fn bind(&self, bean: &Bean, with_id: bool, out: &mut dyn DataBind) -> Result<()> {
        if with_id {
            Bindable::Id.bind(bean, out)?;
        }
        if let Some(disc) = &self.discriminator {
            disc.bind(bean, out)?;
        }
        self.properties.bind(bean, out)
    }

    pub fn descriptor(&self) -> &Arc<BeanDescriptor> {
        &self.descriptor
    }
}
