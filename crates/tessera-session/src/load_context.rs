//! Lazy-load contexts and their batch lists.
//!
//! Every query path whose association is not fetched by the main statement
//! gets one context per executed query. The context remembers the beans the
//! query produced at that path (reference beans for to-one paths, owner beans
//! for to-many paths) and loads them in batches: either right after the query
//! (query joins) or when one of them is first accessed (lazy joins).
//!
//! Entries are weak. A bean dropped by the application before its batch ran
//! is skipped, and [`Slot::Abandoned`] marks entries whose unit of work ended.
//! The list of each context sits behind its own lock; every extraction and
//! registration goes through it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tessera_core::{Bean, BeanDescriptor, BeanRef, LoadToken};
use tessera_query::{FetchMode, OrmQueryDetail};

/// State of one batch entry.
#[derive(Debug, Clone)]
pub enum Slot {
    /// Waiting for its batch.
    Pending(Weak<RwLock<Bean>>),
    /// Extracted into a batch window.
    Taken,
    /// Dropped by the application or its unit of work.
    Abandoned,
}

/// Pending entries of one context, in registration order.
#[derive(Debug, Default)]
pub struct BatchList {
    slots: Vec<Slot>,
    /// Leading slots known to be no longer pending
    front: usize,
}

impl BatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bean; returns its slot.
    pub fn register(&mut self, bean: &BeanRef) -> usize {
        self.slots.push(Slot::Pending(Arc::downgrade(bean)));
        self.slots.len() - 1
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Entries still waiting for a batch.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Pending(_)))
            .count()
    }

    fn take(&mut self, index: usize, out: &mut Vec<(usize, BeanRef)>) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if let Slot::Pending(weak) = slot {
            match weak.upgrade() {
                Some(bean) => {
                    out.push((index, bean));
                    *slot = Slot::Taken;
                }
                None => *slot = Slot::Abandoned,
            }
        }
    }

    /// Extract up to `size` live entries around `trigger`: the trigger
    /// itself, then the entries after it, then the nearest ones before it.
    pub fn take_window(&mut self, trigger: usize, size: usize) -> Vec<(usize, BeanRef)> {
        let size = size.max(1);
        let mut out = Vec::with_capacity(size);
        self.take(trigger, &mut out);
        let mut next = trigger + 1;
        while out.len() < size && next < self.slots.len() {
            self.take(next, &mut out);
            next += 1;
        }
        let mut prev = trigger.min(self.slots.len());
        while out.len() < size && prev > self.front {
            prev -= 1;
            self.take(prev, &mut out);
        }
        self.advance_front();
        out
    }

    /// Extract up to `size` live entries from the front.
    pub fn take_front(&mut self, size: usize) -> Vec<(usize, BeanRef)> {
        let size = size.max(1);
        let mut out = Vec::with_capacity(size);
        let mut index = self.front;
        while out.len() < size && index < self.slots.len() {
            self.take(index, &mut out);
            index += 1;
        }
        self.advance_front();
        out
    }

    /// Put an extracted window back after its load failed or was cancelled.
    pub fn restore(&mut self, window: &[(usize, BeanRef)]) {
        for (index, bean) in window {
            if let Some(slot @ Slot::Taken) = self.slots.get_mut(*index) {
                *slot = Slot::Pending(Arc::downgrade(bean));
            }
        }
        self.front = window
            .iter()
            .map(|(index, _)| *index)
            .fold(self.front, usize::min);
    }

    pub fn abandon(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            if matches!(slot, Slot::Pending(_)) {
                *slot = Slot::Abandoned;
            }
        }
    }

    pub fn abandon_all(&mut self) {
        for index in 0..self.slots.len() {
            self.abandon(index);
        }
        self.front = self.slots.len();
    }

    fn advance_front(&mut self) {
        while self
            .slots
            .get(self.front)
            .is_some_and(|s| !matches!(s, Slot::Pending(_)))
        {
            self.front += 1;
        }
    }
}

/// Settings shared by both context kinds.
#[derive(Debug, Clone)]
pub struct LoadSettings {
    /// Path from the root of the query that registered the entries
    pub path: String,
    pub mode: FetchMode,
    pub batch_size: usize,
    /// Detail of the secondary query, rooted at the loaded type
    pub detail: OrmQueryDetail,
}

/// Reference beans of one to-one path.
#[derive(Debug)]
pub struct LoadBeanContext {
    pub settings: LoadSettings,
    /// Declared target type of the association
    pub descriptor: Arc<BeanDescriptor>,
}

/// Owner beans of one to-many path.
#[derive(Debug)]
pub struct LoadManyContext {
    pub settings: LoadSettings,
    /// Type declaring the to-many property
    pub owner: Arc<BeanDescriptor>,
    pub position: usize,
    pub target: Arc<BeanDescriptor>,
    /// To-one property on the target pointing back at the owner
    pub mapped_by: String,
    pub order_by: Option<String>,
}

#[derive(Debug)]
pub enum LoadKind {
    Bean(LoadBeanContext),
    Many(LoadManyContext),
}

/// A load context: its kind plus the locked batch list.
#[derive(Debug)]
pub struct LoadContext {
    id: u64,
    kind: LoadKind,
    list: Mutex<BatchList>,
}

impl LoadContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &LoadKind {
        &self.kind
    }

    pub fn settings(&self) -> &LoadSettings {
        match &self.kind {
            LoadKind::Bean(ctx) => &ctx.settings,
            LoadKind::Many(ctx) => &ctx.settings,
        }
    }

    pub fn list(&self) -> MutexGuard<'_, BatchList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of the load contexts of one unit of work.
///
/// Tokens carry the registry generation; a token issued before the last
/// [`clear`](Self::clear) no longer resolves.
#[derive(Debug, Default)]
pub struct LoadContexts {
    contexts: HashMap<u64, Arc<LoadContext>>,
    next_id: u64,
    generation: u32,
}

impl LoadContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn create(&mut self, kind: LoadKind) -> Arc<LoadContext> {
        self.next_id += 1;
        let ctx = Arc::new(LoadContext {
            id: self.next_id,
            kind,
            list: Mutex::new(BatchList::new()),
        });
        tracing::trace!(
            context = ctx.id,
            path = %ctx.settings().path,
            mode = ?ctx.settings().mode,
            "Created load context"
        );
        self.contexts.insert(ctx.id, Arc::clone(&ctx));
        ctx
    }

    /// Register `bean` with `ctx`; returns its token.
    pub fn register(&self, ctx: &LoadContext, bean: &BeanRef) -> LoadToken {
        let slot = ctx.list().register(bean);
        LoadToken {
            context: ctx.id,
            slot,
            generation: self.generation,
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<LoadContext>> {
        self.contexts.get(&id).cloned()
    }

    /// The context behind `token`, if it is still current.
    pub fn resolve(&self, token: LoadToken) -> Option<Arc<LoadContext>> {
        if token.generation != self.generation {
            return None;
        }
        self.get(token.context)
    }

    /// Mark the entry behind `token` abandoned.
    pub fn abandon(&self, token: LoadToken) {
        if let Some(ctx) = self.resolve(token) {
            ctx.list().abandon(token.slot);
        }
    }

    /// Entries still pending across every context.
    pub fn pending(&self) -> usize {
        self.contexts.values().map(|c| c.list().pending()).sum()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Abandon every entry and drop every context.
    pub fn clear(&mut self) {
        for ctx in self.contexts.values() {
            ctx.list().abandon_all();
        }
        self.contexts.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}
