//! Insert, update and delete statement generation.
//!
//! Statement metadata is built once per type and dialect and cached in a
//! [`DmlMetaCache`]. Only dirty-only updates and the compare-all-old-values
//! mode generate text per request.

mod bindable;
mod delete;
mod insert;
mod update;

pub use bindable::{Bindable, DmlColumn, next_version};
pub use delete::DeleteMeta;
pub use insert::InsertMeta;
pub use update::{UpdateMeta, UpdateStatement};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tessera_core::{BeanDescriptor, BindValues, DescriptorMap, Dialect, Result};

/// SQL text with its binds, ready to execute.
#[derive(Debug, Clone)]
pub struct DmlStatement {
    pub sql: String,
    pub binds: BindValues,
    /// Whether a row count other than one means a concurrent change
    pub concurrency_checked: bool,
}

/// Insert, update and delete metadata of one type.
#[derive(Debug, Clone)]
pub struct DmlMeta {
    pub insert: InsertMeta,
    pub update: UpdateMeta,
    pub delete: DeleteMeta,
}

impl DmlMeta {
    pub fn build(map: &DescriptorMap, desc: &Arc<BeanDescriptor>, dialect: Dialect) -> Result<Self> {
        Ok(Self {
            insert: InsertMeta::build(map, desc, dialect)?,
            update: UpdateMeta::build(map, desc)?,
            delete: DeleteMeta::build(desc)?,
        })
    }
}

/// Per type and dialect cache of [`DmlMeta`].
#[derive(Debug, Default)]
pub struct DmlMetaCache {
    metas: RwLock<HashMap<(String, Dialect), Arc<DmlMeta>>>,
}

impl DmlMetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        map: &DescriptorMap,
        desc: &Arc<BeanDescriptor>,
        dialect: Dialect,
    ) -> Result<Arc<DmlMeta>> {
        let key = (desc.name().to_string(), dialect);
        if let Some(meta) = self
            .metas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(meta));
        }
        let meta = Arc::new(DmlMeta::build(map, desc, dialect)?);
        let mut metas = self.metas.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(metas.entry(key).or_insert(meta)))
    }

    pub fn len(&self) -> usize {
        self.metas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
