use super::DmlStatement;
use super::bindable::Bindable;
use std::sync::Arc;
use tessera_core::{
    BeanDescriptor, BindValues, ConcurrencyMode, DataBind, GenerateDmlRequest, IdValue, Result,
    Value,
};

/// Delete statements of one type, by id and optionally guarded by version.
#[derive(Debug, Clone)]
pub struct DeleteMeta {
    descriptor: Arc<BeanDescriptor>,
    version: Option<Bindable>,
    sql_id: String,
    sql_version: Option<String>,
}

impl DeleteMeta {
    pub fn build(desc: &Arc<BeanDescriptor>) -> Result<Self> {
        let table = desc.table()?;
        let version = Bindable::version_of(desc);
        let generate = |with_version: bool| {
            let mut request = GenerateDmlRequest::new();
            request.append("delete from ").append(table).append(" where ");
            request.set_where_id_mode();
            Bindable::Id.dml_append(desc, &mut request);
            if let (true, Some(version)) = (with_version, &version) {
                request.set_where_mode();
                version.dml_append(desc, &mut request);
            }
            request.into_sql()
        };
        let sql_id = generate(false);
        let sql_version = version.is_some().then(|| generate(true));
        Ok(Self {
            descriptor: Arc::clone(desc),
            version,
            sql_id,
            sql_version,
        })
    }

    pub fn sql(&self, mode: ConcurrencyMode) -> &str {
        match (mode, &self.sql_version) {
            (ConcurrencyMode::Version, Some(sql)) => sql,
            _ => &self.sql_id,
        }
    }

    /// Delete by `id`, guarded by `version` when the mode checks versions
    /// and a non-null version is known.
    pub fn prepare(
        &self,
        id: &IdValue,
        version: Option<&Value>,
        mode: ConcurrencyMode,
    ) -> Result<DmlStatement> {
        let guard = match (&self.version, version) {
            (Some(Bindable::Version { sql_type, .. }), Some(v))
                if mode != ConcurrencyMode::None && !v.is_null() =>
            {
                Some((v.clone(), sql_type))
            }
            _ => None,
        };
        let checked = guard.is_some();
        let mut binds = BindValues::new();
        self.descriptor.id_binder().bind_id(&mut binds, id)?;
        let sql = match guard {
            Some((value, sql_type)) => {
                binds.bind(value, sql_type);
                self.sql(ConcurrencyMode::Version)
            }
            None => self.sql(ConcurrencyMode::None),
        };
        Ok(DmlStatement {
            sql: sql.to_string(),
            binds,
            concurrency_checked: checked,
        })
    }
}
