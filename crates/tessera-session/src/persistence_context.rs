//! Persistence context: one bean instance per type and id within a unit of work.
//!
//! Keys use the hierarchy root type so that a `Truck` loaded through a query
//! on `Vehicle` and a later lookup of `Truck` with the same id resolve to the
//! same instance. Ids are normalized through the type's [`IdBinder`] before
//! use, so `Int(1)` and `BigInt(1)` for a `bigint` key are the same entry.
//!
//! [`IdBinder`]: tessera_core::IdBinder

use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::{BeanDescriptor, BeanRef, IdValue, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContextKey {
    root: String,
    id: IdValue,
}

impl ContextKey {
    fn new(desc: &BeanDescriptor, id: &IdValue) -> Result<Self> {
        Ok(Self {
            root: desc.root_name().to_string(),
            id: desc.id_binder().normalize(id)?,
        })
    }
}

/// Identity map scoped to one unit of work.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    beans: HashMap<ContextKey, BeanRef>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, desc: &BeanDescriptor, id: &IdValue) -> Result<Option<BeanRef>> {
        let key = ContextKey::new(desc, id)?;
        Ok(self.beans.get(&key).cloned())
    }

    /// Register `bean` unless an instance is already present; returns the
    /// registered instance either way.
    pub fn put(&mut self, desc: &BeanDescriptor, id: &IdValue, bean: BeanRef) -> Result<BeanRef> {
        let key = ContextKey::new(desc, id)?;
        Ok(Arc::clone(self.beans.entry(key).or_insert(bean)))
    }

    pub fn remove(&mut self, desc: &BeanDescriptor, id: &IdValue) -> Result<Option<BeanRef>> {
        let key = ContextKey::new(desc, id)?;
        Ok(self.beans.remove(&key))
    }

    pub fn contains(&self, desc: &BeanDescriptor, id: &IdValue) -> bool {
        ContextKey::new(desc, id).is_ok_and(|key| self.beans.contains_key(&key))
    }

    pub fn len(&self) -> usize {
        self.beans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }

    pub fn clear(&mut self) {
        self.beans.clear();
    }
}
