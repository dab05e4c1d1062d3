//! Row materialization for one executed statement.
//!
//! Beans created while reading a result set are staged here and reach the
//! persistence context only when [`Staged::commit`] runs after the last row.
//! A statement that fails or is cancelled therefore leaves no partially read
//! bean behind.

use crate::persistence_context::PersistenceContext;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::{
    Bean, BeanDescriptor, BeanList, BeanRef, BeanState, DescriptorMap, IdValue, Result, new_ref,
    read_bean, write_bean,
};
use tessera_query::RowLoadContext;

type StageKey = (String, IdValue);

/// Unfetched association values produced by one statement.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    /// New reference beans by path
    pub references: Vec<(String, BeanRef)>,
    /// Owners of unloaded to-many properties by path
    pub deferred: Vec<(String, BeanRef, usize)>,
}

pub(crate) struct Staging<'a> {
    map: &'a DescriptorMap,
    context: &'a PersistenceContext,
    /// Instances the statement is expected to populate
    targets: HashMap<StageKey, BeanRef>,
    staged: HashMap<StageKey, BeanRef>,
    order: Vec<(Arc<BeanDescriptor>, IdValue, BeanRef)>,
    pending: Pending,
}

impl<'a> Staging<'a> {
    pub(crate) fn new(
        map: &'a DescriptorMap,
        context: &'a PersistenceContext,
        targets: &[BeanRef],
    ) -> Result<Self> {
        let mut by_key = HashMap::new();
        for bean in targets {
            let key = {
                let b = read_bean(bean);
                match b.id() {
                    Some(id) => Some(key_of(b.descriptor(), &id)?),
                    None => None,
                }
            };
            if let Some(key) = key {
                by_key.insert(key, Arc::clone(bean));
            }
        }
        Ok(Self {
            map,
            context,
            targets: by_key,
            staged: HashMap::new(),
            order: Vec::new(),
            pending: Pending::default(),
        })
    }

    fn existing(&self, desc: &BeanDescriptor, id: &IdValue) -> Result<Option<BeanRef>> {
        let key = key_of(desc, id)?;
        if let Some(bean) = self.targets.get(&key).or_else(|| self.staged.get(&key)) {
            return Ok(Some(Arc::clone(bean)));
        }
        self.context.get(desc, id)
    }

    fn stage(&mut self, desc: &Arc<BeanDescriptor>, id: IdValue, bean: BeanRef) -> Result<()> {
        self.staged.insert(key_of(desc, &id)?, Arc::clone(&bean));
        self.order.push((Arc::clone(desc), id, bean));
        Ok(())
    }

    /// Stop reading; the result still has to be committed.
    pub(crate) fn finish(self) -> Staged {
        Staged {
            order: self.order,
            pending: self.pending,
        }
    }
}

/// Beans read by a completed statement, not yet in the persistence context.
pub(crate) struct Staged {
    order: Vec<(Arc<BeanDescriptor>, IdValue, BeanRef)>,
    pending: Pending,
}

impl Staged {
    /// Register staged beans with `context`; returns the unfetched associations.
    pub(crate) fn commit(self, context: &mut PersistenceContext) -> Result<Pending> {
        for (desc, id, bean) in self.order {
            context.put(&desc, &id, bean)?;
        }
        Ok(self.pending)
    }
}

fn key_of(desc: &BeanDescriptor, id: &IdValue) -> Result<StageKey> {
    Ok((
        desc.root_name().to_string(),
        desc.id_binder().normalize(id)?,
    ))
}

impl RowLoadContext for Staging<'_> {
    fn descriptors(&self) -> &DescriptorMap {
        self.map
    }

    fn bean_for_row(
        &mut self,
        desc: &Arc<BeanDescriptor>,
        id: Option<IdValue>,
        _path: &str,
    ) -> Result<BeanRef> {
        let Some(id) = id else {
            return Ok(new_ref(Bean::for_load(Arc::clone(desc))));
        };
        if let Some(bean) = self.existing(desc, &id)? {
            let mut b = write_bean(&bean);
            if b.state() == BeanState::Reference && b.descriptor().name() != desc.name() {
                // the row names a subtype of the referenced type
                *b = Bean::for_load(Arc::clone(desc));
            }
            drop(b);
            return Ok(bean);
        }
        let bean = new_ref(Bean::for_load(Arc::clone(desc)));
        self.stage(desc, id, Arc::clone(&bean))?;
        Ok(bean)
    }

    fn reference(&mut self, desc: &Arc<BeanDescriptor>, id: IdValue, path: &str) -> Result<BeanRef> {
        if let Some(bean) = self.existing(desc, &id)? {
            return Ok(bean);
        }
        let bean = new_ref(Bean::reference(Arc::clone(desc), &id)?);
        self.stage(desc, id, Arc::clone(&bean))?;
        self.pending
            .references
            .push((path.to_string(), Arc::clone(&bean)));
        Ok(bean)
    }

    fn defer_many(&mut self, owner: &BeanRef, path: &str, position: usize) -> Result<BeanList> {
        self.pending
            .deferred
            .push((path.to_string(), Arc::clone(owner), position));
        Ok(BeanList::Deferred(None))
    }
}
