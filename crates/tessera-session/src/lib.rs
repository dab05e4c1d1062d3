//! Unit of work for Tessera.
//!
//! `tessera-session` executes what `tessera-query` plans. A [`Session`] owns
//! one connection and one unit of work: the [`PersistenceContext`] that keeps
//! a single instance per type and id, and the [`LoadContexts`] that batch
//! every association the main statements did not fetch.
//!
//! # Role In The Architecture
//!
//! - **Queries**: [`Session::find_list`] runs the cached plan, materializes rows
//!   and immediately flushes query joins, one statement per batch.
//! - **Lazy loading**: [`Session::get`] is the access hook of the bean
//!   contract; the first access to a reference bean or a deferred list loads
//!   it together with up to a batch of its siblings.
//! - **Persistence**: [`Session::save`] and [`Session::delete`] run the cached
//!   DML statements and surface concurrency conflicts as
//!   [`Error::OptimisticLock`].
//!
//! Every async operation takes a `Cx` and returns an `Outcome`; cancellation is
//! checked before each statement.
//!
//! # Example
//!
//! ```ignore
//! let database = Arc::new(Database::new(descriptors));
//! let mut session = database.session(conn);
//!
//! let query = Query::new("Order")
//!     .select(&["status"])
//!     .fetch("customer", &[], FetchConfig::lazy(10));
//! let orders = session.find_list(&cx, &query).await?;
//!
//! // First access loads this customer and nine others in one statement
//! let customer = session.get(&cx, &orders[0], "customer").await?;
//! ```

pub mod config;
pub mod load_context;
pub mod persistence_context;
mod staging;

pub use config::SessionConfig;
pub use load_context::{
    BatchList, LoadBeanContext, LoadContext, LoadContexts, LoadKind, LoadManyContext,
    LoadSettings, Slot,
};
pub use persistence_context::PersistenceContext;

use asupersync::{Cx, Outcome};
use staging::{Pending, Staging};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tessera_core::{
    BeanDescriptor, BeanList, BeanRef, BeanState, BindValues, Connection, DescriptorMap,
    EntityNotFoundError, Error, IdValue, KeyGenerationError, LoadToken, OptimisticLockError,
    PropertyValue, Result, Value, read_bean, write_bean,
};
use tessera_query::detail::{resolve_path, target_of};
use tessera_query::dml::{DmlStatement, next_version};
use tessera_query::{
    DmlMetaCache, Expr, FetchMode, OrmQueryDetail, Query, QueryPlan, QueryPlanCache,
};

// ============================================================================
// Database
// ============================================================================

/// State shared by every session: deploy metadata and the plan and DML caches.
#[derive(Debug)]
pub struct Database {
    descriptors: DescriptorMap,
    plans: QueryPlanCache,
    dml: DmlMetaCache,
    config: SessionConfig,
}

impl Database {
    pub fn new(descriptors: DescriptorMap) -> Self {
        Self::with_config(descriptors, SessionConfig::default())
    }

    pub fn with_config(descriptors: DescriptorMap, config: SessionConfig) -> Self {
        Self {
            descriptors,
            plans: QueryPlanCache::new(config.tree_limits()),
            dml: DmlMetaCache::new(),
            config,
        }
    }

    /// Open a unit of work on `connection`.
    pub fn session<C: Connection>(self: &Arc<Self>, connection: C) -> Session<C> {
        Session::new(connection, Arc::clone(self))
    }

    pub fn descriptors(&self) -> &DescriptorMap {
        &self.descriptors
    }

    pub fn plans(&self) -> &QueryPlanCache {
        &self.plans
    }

    pub fn dml(&self) -> &DmlMetaCache {
        &self.dml
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

// ============================================================================
// Session
// ============================================================================

/// What a property access has to load first.
enum Trigger {
    Nothing,
    Missing,
    Reference(Option<LoadToken>),
    Many(Option<LoadToken>),
}

/// One unit of work over one connection.
pub struct Session<C: Connection> {
    connection: C,
    database: Arc<Database>,
    config: SessionConfig,
    context: PersistenceContext,
    loads: LoadContexts,
}

impl<C: Connection> Session<C> {
    pub fn new(connection: C, database: Arc<Database>) -> Self {
        let config = database.config().clone();
        Self::with_config(connection, database, config)
    }

    /// A session whose batch sizes and concurrency mode differ from the
    /// database defaults. Join depth limits stay those of the plan cache.
    pub fn with_config(connection: C, database: Arc<Database>, config: SessionConfig) -> Self {
        Self {
            connection,
            database,
            config,
            context: PersistenceContext::new(),
            loads: LoadContexts::new(),
        }
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn load_contexts(&self) -> &LoadContexts {
        &self.loads
    }

    /// Lazy-load entries not loaded yet.
    pub fn pending_loads(&self) -> usize {
        self.loads.pending()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run `query` and flush its query joins.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %query.entity()))]
    pub async fn find_list(&mut self, cx: &Cx, query: &Query) -> Outcome<Vec<BeanRef>, Error> {
        let (beans, queue) = match self.execute_query(cx, query, &[]).await {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.flush_query_joins(cx, queue).await {
            Outcome::Ok(()) => Outcome::Ok(beans),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// The bean of `entity` with key `id`, from the persistence context when
    /// present.
    pub async fn find_by_id(
        &mut self,
        cx: &Cx,
        entity: &str,
        id: impl Into<IdValue>,
    ) -> Outcome<Option<BeanRef>, Error> {
        let id = id.into();
        let desc = match self.database.descriptors().get(entity) {
            Ok(desc) => Arc::clone(desc),
            Err(e) => return Outcome::Err(e),
        };
        let cached = match self.context.get(&desc, &id) {
            Ok(cached) => cached,
            Err(e) => return Outcome::Err(e),
        };
        if let Some(bean) = cached {
            let (state, missing, token, assignable) = {
                let b = read_bean(&bean);
                (
                    b.state(),
                    b.is_missing(),
                    b.lazy_token(),
                    desc.is_assignable_from(b.type_name()),
                )
            };
            if missing || state == BeanState::Deleted || !assignable {
                return Outcome::Ok(None);
            }
            if state == BeanState::Reference {
                match self.load_reference(cx, &bean, token).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                if read_bean(&bean).is_missing() {
                    return Outcome::Ok(None);
                }
            }
            tracing::trace!(entity, id = %id, "Found in persistence context");
            return Outcome::Ok(Some(bean));
        }

        let query = Query::new(entity).filter(Expr::id_eq(id));
        match self.find_list(cx, &query).await {
            Outcome::Ok(beans) => Outcome::Ok(beans.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Execute one statement and materialize its rows.
    ///
    /// `targets` are existing instances the rows should populate even when
    /// the persistence context no longer holds them. Returns the root beans
    /// and the query-join contexts the statement registered.
    async fn execute_query(
        &mut self,
        cx: &Cx,
        query: &Query,
        targets: &[BeanRef],
    ) -> Outcome<(Vec<BeanRef>, Vec<u64>), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let database = Arc::clone(&self.database);
        let map = database.descriptors();
        let plan = match database
            .plans()
            .get_or_compile(map, query, self.connection.dialect())
        {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        let binds = match query.bind_values(map) {
            Ok(binds) => binds,
            Err(e) => return Outcome::Err(e),
        };
        let bind_log = BindValues::from(binds.clone()).bind_log();
        tracing::debug!(sql = %plan.sql(), binds = %bind_log, "Executing query");

        let rows = match self.connection.query(cx, plan.sql(), &binds).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e.with_statement(plan.sql(), &bind_log)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let read = Staging::new(map, &self.context, targets).and_then(|mut staging| {
            let beans = plan.sql_tree().read_rows(&rows, &mut staging)?;
            Ok((beans, staging.finish()))
        });
        let (beans, staged) = match read {
            Ok(read) => read,
            Err(e) => return Outcome::Err(e),
        };
        let registered = staged
            .commit(&mut self.context)
            .and_then(|pending| self.register_pending(map, &plan, pending));
        match registered {
            Ok(queue) => {
                tracing::debug!(rows = rows.len(), beans = beans.len(), "Query complete");
                Outcome::Ok((beans, queue))
            }
            Err(e) => Outcome::Err(e),
        }
    }

    fn settings_for(&self, plan: &QueryPlan, path: &str) -> LoadSettings {
        match plan.secondary().iter().find(|join| join.path == path) {
            Some(join) => {
                let default = match join.fetch.mode {
                    FetchMode::Query => self.config.default_query_batch_size,
                    _ => self.config.default_lazy_batch_size,
                };
                LoadSettings {
                    path: path.to_string(),
                    mode: join.fetch.mode,
                    batch_size: join.fetch.batch_size_or(default),
                    detail: join.detail.clone(),
                }
            }
            None => LoadSettings {
                path: path.to_string(),
                mode: FetchMode::Lazy,
                batch_size: self.config.default_lazy_batch_size,
                detail: OrmQueryDetail::new(),
            },
        }
    }

    /// Create one context per path for the unfetched associations of a
    /// statement and register every entry; returns the query-join contexts.
    fn register_pending(
        &mut self,
        map: &DescriptorMap,
        plan: &QueryPlan,
        pending: Pending,
    ) -> Result<Vec<u64>> {
        let root = Arc::clone(map.get(plan.entity())?);
        let mut contexts: HashMap<String, Arc<LoadContext>> = HashMap::new();
        let mut query_joins = Vec::new();

        for (path, bean) in pending.references {
            {
                let b = read_bean(&bean);
                if b.state() != BeanState::Reference || b.lazy_token().is_some() {
                    continue;
                }
            }
            let ctx = match contexts.get(&path) {
                Some(ctx) => Arc::clone(ctx),
                None => {
                    let resolved = resolve_path(map, &root, &path)?;
                    let descriptor = target_of(map, resolved.property())?;
                    let settings = self.settings_for(plan, &path);
                    let ctx = self
                        .loads
                        .create(LoadKind::Bean(LoadBeanContext { settings, descriptor }));
                    if ctx.settings().mode == FetchMode::Query {
                        query_joins.push(ctx.id());
                    }
                    contexts.insert(path, Arc::clone(&ctx));
                    ctx
                }
            };
            let token = self.loads.register(&ctx, &bean);
            write_bean(&bean).set_lazy_token(Some(token));
        }

        for (path, owner, position) in pending.deferred {
            let owner_desc = {
                let b = read_bean(&owner);
                let deferred = matches!(
                    b.value_at(position),
                    Some(PropertyValue::Many(BeanList::Deferred(None)))
                );
                if !deferred {
                    continue;
                }
                Arc::clone(b.descriptor())
            };
            let ctx = match contexts.get(&path) {
                Some(ctx) => Arc::clone(ctx),
                None => {
                    let settings = self.settings_for(plan, &path);
                    let many = many_context(map, &owner_desc, position, settings)?;
                    let ctx = self.loads.create(LoadKind::Many(many));
                    if ctx.settings().mode == FetchMode::Query {
                        query_joins.push(ctx.id());
                    }
                    contexts.insert(path, Arc::clone(&ctx));
                    ctx
                }
            };
            let token = self.loads.register(&ctx, &owner);
            write_bean(&owner).load_value(
                position,
                PropertyValue::Many(BeanList::Deferred(Some(token))),
            );
        }
        Ok(query_joins)
    }

    // ========================================================================
    // Batch loading
    // ========================================================================

    /// Drain query-join contexts front first, one statement per batch, until
    /// no query join is left; contexts registered by the secondary
    /// statements themselves are drained too.
    async fn flush_query_joins(&mut self, cx: &Cx, queue: Vec<u64>) -> Outcome<(), Error> {
        let mut queue: VecDeque<u64> = queue.into();
        let mut statements = 0usize;
        while let Some(id) = queue.pop_front() {
            let Some(ctx) = self.loads.get(id) else {
                continue;
            };
            loop {
                let window = ctx.list().take_front(ctx.settings().batch_size);
                if window.is_empty() {
                    break;
                }
                match self.load_window(cx, &ctx, window).await {
                    Outcome::Ok(more) => queue.extend(more),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                statements += 1;
            }
        }
        if statements > 0 {
            tracing::info!(statements, "Flushed query joins");
        }
        Outcome::Ok(())
    }

    /// Load one extracted window; on failure the window goes back to the list.
    async fn load_window(
        &mut self,
        cx: &Cx,
        ctx: &LoadContext,
        window: Vec<(usize, BeanRef)>,
    ) -> Outcome<Vec<u64>, Error> {
        let beans: Vec<BeanRef> = window.iter().map(|(_, bean)| Arc::clone(bean)).collect();
        let outcome = match ctx.kind() {
            LoadKind::Bean(bean_ctx) => self.load_references(cx, bean_ctx, &beans).await,
            LoadKind::Many(many_ctx) => self.load_lists(cx, many_ctx, &beans).await,
        };
        if !matches!(outcome, Outcome::Ok(_)) {
            tracing::debug!(context = ctx.id(), entries = window.len(), "Batch load failed; entries restored");
            ctx.list().restore(&window);
        }
        outcome
    }

    /// Load reference beans with one statement.
    ///
    /// References whose row is gone are flagged missing; the others load
    /// normally.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %ctx.settings.path, batch = beans.len()))]
    async fn load_references(
        &mut self,
        cx: &Cx,
        ctx: &LoadBeanContext,
        beans: &[BeanRef],
    ) -> Outcome<Vec<u64>, Error> {
        let beans: Vec<BeanRef> = beans
            .iter()
            .filter(|b| read_bean(b).state() == BeanState::Reference)
            .cloned()
            .collect();
        let ids: Vec<IdValue> = beans.iter().filter_map(|b| read_bean(b).id()).collect();
        if ids.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let query = Query::new(ctx.descriptor.name())
            .with_detail(ctx.settings.detail.clone())
            .filter(Expr::id_in(pad_ids(ids, ctx.settings.batch_size)));
        let queue = match self.execute_query(cx, &query, &beans).await {
            Outcome::Ok((_, queue)) => queue,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        for bean in &beans {
            let mut b = write_bean(bean);
            if b.state() == BeanState::Reference {
                tracing::debug!(entity = b.type_name(), id = ?b.id(), "Referenced row not found");
                b.mark_missing();
            } else {
                b.set_lazy_token(None);
            }
        }
        Outcome::Ok(queue)
    }

    /// Load the to-many property of a batch of owners with one statement
    /// filtered on the owners' ids through the back reference.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %ctx.settings.path, batch = owners.len()))]
    async fn load_lists(
        &mut self,
        cx: &Cx,
        ctx: &LoadManyContext,
        owners: &[BeanRef],
    ) -> Outcome<Vec<u64>, Error> {
        let owners: Vec<(IdValue, BeanRef)> = owners
            .iter()
            .filter_map(|owner| {
                let b = read_bean(owner);
                let deferred = matches!(
                    b.value_at(ctx.position),
                    Some(PropertyValue::Many(BeanList::Deferred(_)))
                );
                if deferred {
                    b.id().map(|id| (id, Arc::clone(owner)))
                } else {
                    None
                }
            })
            .collect();
        if owners.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let ids = owners.iter().map(|(id, _)| id.clone()).collect();
        let mut detail = ctx.settings.detail.clone();
        detail.root_mut().add_property(&ctx.mapped_by);
        let mut query = Query::new(ctx.target.name())
            .with_detail(detail)
            .filter(Expr::assoc_id_in(
                &ctx.mapped_by,
                pad_ids(ids, ctx.settings.batch_size),
            ));
        if let Some(order_by) = &ctx.order_by {
            query = query.order_by(order_by);
        }
        let (members, queue) = match self.execute_query(cx, &query, &[]).await {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut lists: HashMap<IdValue, Vec<BeanRef>> = owners
            .iter()
            .map(|(id, _)| (id.clone(), Vec::new()))
            .collect();
        for member in members {
            let parent = read_bean(&member)
                .get(&ctx.mapped_by)
                .ok()
                .and_then(PropertyValue::as_one)
                .cloned();
            let Some(parent_id) = parent.and_then(|p| read_bean(&p).id()) else {
                continue;
            };
            if let Some(list) = lists.get_mut(&parent_id) {
                list.push(member);
            }
        }
        for (id, owner) in owners {
            let members = lists.remove(&id).unwrap_or_default();
            write_bean(&owner).load_value(ctx.position, PropertyValue::Many(BeanList::Loaded(members)));
        }
        Outcome::Ok(queue)
    }

    /// Load a reference bean, batched with its pending siblings when its
    /// context is still current.
    async fn load_reference(
        &mut self,
        cx: &Cx,
        bean: &BeanRef,
        token: Option<LoadToken>,
    ) -> Outcome<(), Error> {
        if let Some((ctx, window)) = self.window_for(bean, token) {
            let queue = match self.load_window(cx, &ctx, window).await {
                Outcome::Ok(queue) => queue,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            return self.flush_query_joins(cx, queue).await;
        }

        // Detached from its context: load it alone
        let descriptor = Arc::clone(read_bean(bean).descriptor());
        let ctx = LoadBeanContext {
            settings: LoadSettings {
                path: String::new(),
                mode: FetchMode::Lazy,
                batch_size: 1,
                detail: OrmQueryDetail::new(),
            },
            descriptor,
        };
        if read_bean(bean).state() != BeanState::Reference {
            return self.refresh(cx, bean).await;
        }
        let queue = match self
            .load_references(cx, &ctx, std::slice::from_ref(bean))
            .await
        {
            Outcome::Ok(queue) => queue,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.flush_query_joins(cx, queue).await
    }

    /// Fill the unloaded properties of a partially loaded bean.
    async fn refresh(&mut self, cx: &Cx, bean: &BeanRef) -> Outcome<(), Error> {
        let (name, id) = {
            let b = read_bean(bean);
            (b.type_name().to_string(), b.id())
        };
        let Some(id) = id else {
            return Outcome::Err(Error::mapping(name, "cannot load a bean without id"));
        };
        let query = Query::new(&name).filter(Expr::id_eq(id));
        let queue = match self
            .execute_query(cx, &query, std::slice::from_ref(bean))
            .await
        {
            Outcome::Ok((_, queue)) => queue,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.flush_query_joins(cx, queue).await
    }

    /// Load a deferred list, batched with its pending siblings when its
    /// context is still current.
    async fn load_list(
        &mut self,
        cx: &Cx,
        owner: &BeanRef,
        position: usize,
        token: Option<LoadToken>,
    ) -> Outcome<(), Error> {
        if let Some((ctx, window)) = self.window_for(owner, token) {
            let queue = match self.load_window(cx, &ctx, window).await {
                Outcome::Ok(queue) => queue,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            return self.flush_query_joins(cx, queue).await;
        }

        let owner_desc = Arc::clone(read_bean(owner).descriptor());
        let settings = LoadSettings {
            path: String::new(),
            mode: FetchMode::Lazy,
            batch_size: 1,
            detail: OrmQueryDetail::new(),
        };
        let ctx = match many_context(self.database.descriptors(), &owner_desc, position, settings) {
            Ok(ctx) => ctx,
            Err(e) => return Outcome::Err(e),
        };
        let queue = match self.load_lists(cx, &ctx, std::slice::from_ref(owner)).await {
            Outcome::Ok(queue) => queue,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.flush_query_joins(cx, queue).await
    }

    /// The batch window around `bean`'s entry, when its token still resolves
    /// and the entry was pending.
    fn window_for(
        &self,
        bean: &BeanRef,
        token: Option<LoadToken>,
    ) -> Option<(Arc<LoadContext>, Vec<(usize, BeanRef)>)> {
        let token = token?;
        let ctx = self.loads.resolve(token)?;
        let window = ctx
            .list()
            .take_window(token.slot, ctx.settings().batch_size);
        if window.iter().any(|(_, b)| Arc::ptr_eq(b, bean)) {
            return Some((ctx, window));
        }
        ctx.list().restore(&window);
        None
    }

    // ========================================================================
    // Property access
    // ========================================================================

    /// Read a property, loading it first when it is not loaded yet.
    ///
    /// Reference beans load with their batch on the first access to any
    /// non-id property; deferred lists load with theirs. A reference whose
    /// row no longer exists yields [`Error::EntityNotFound`].
    #[tracing::instrument(level = "trace", skip(self, cx, bean))]
    pub async fn get(&mut self, cx: &Cx, bean: &BeanRef, name: &str) -> Outcome<PropertyValue, Error> {
        let mut position = 0;
        // a reference loads first; a list it defers then loads on the same access
        for pass in 0..2 {
            let trigger = match access_trigger(bean, name) {
                Ok((p, trigger)) => {
                    position = p;
                    trigger
                }
                Err(e) => return Outcome::Err(e),
            };
            let loaded = match trigger {
                Trigger::Nothing => break,
                Trigger::Missing => return Outcome::Err(not_found(bean)),
                Trigger::Reference(_) if pass > 0 => break,
                Trigger::Reference(token) => self.load_reference(cx, bean, token).await,
                Trigger::Many(token) => self.load_list(cx, bean, position, token).await,
            };
            match loaded {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        let b = read_bean(bean);
        if b.is_missing() || !b.is_loaded(position) {
            drop(b);
            return Outcome::Err(not_found(bean));
        }
        Outcome::Ok(b.value_at(position).cloned().unwrap_or(PropertyValue::Unloaded))
    }

    /// Load a reference bean now instead of on first access.
    pub async fn ensure_loaded(&mut self, cx: &Cx, bean: &BeanRef) -> Outcome<(), Error> {
        let (state, missing, token) = {
            let b = read_bean(bean);
            (b.state(), b.is_missing(), b.lazy_token())
        };
        if missing {
            return Outcome::Err(not_found(bean));
        }
        if state != BeanState::Reference {
            return Outcome::Ok(());
        }
        match self.load_reference(cx, bean, token).await {
            Outcome::Ok(()) if read_bean(bean).is_missing() => Outcome::Err(not_found(bean)),
            other => other,
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Insert a new bean or update a changed one.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn save(&mut self, cx: &Cx, bean: &BeanRef) -> Outcome<(), Error> {
        let state = read_bean(bean).state();
        match state {
            BeanState::New => self.insert(cx, bean).await,
            BeanState::Loaded | BeanState::Reference => self.update(cx, bean).await,
            BeanState::Deleted => {
                let name = read_bean(bean).type_name().to_string();
                Outcome::Err(Error::mapping(name, "cannot save a deleted bean"))
            }
        }
    }

    async fn insert(&mut self, cx: &Cx, bean: &BeanRef) -> Outcome<(), Error> {
        let database = Arc::clone(&self.database);
        let dialect = self.connection.dialect();
        let prepared = {
            let mut b = write_bean(bean);
            let desc = Arc::clone(b.descriptor());
            database
                .dml()
                .get(database.descriptors(), &desc, dialect)
                .and_then(|meta| {
                    initial_version(&mut b)?;
                    let generated = meta.insert.uses_generated_key(&b);
                    if !generated && b.id().is_none() {
                        return Err(Error::mapping(desc.name(), "cannot insert a bean without id"));
                    }
                    let mut binds = BindValues::new();
                    meta.insert.bind(&b, !generated, &mut binds)?;
                    Ok((meta, desc, generated, binds))
                })
        };
        let (meta, desc, generated, binds) = match prepared {
            Ok(v) => v,
            Err(e) => return Outcome::Err(e),
        };
        let table = match desc.table() {
            Ok(table) => table.to_string(),
            Err(e) => return Outcome::Err(e),
        };
        let sql = meta.insert.sql(!generated).to_string();
        let bind_log = binds.bind_log();

        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::debug!(sql = %sql, binds = %bind_log, "Executing insert");
        let (count, key) = match self.connection.insert(cx, &sql, binds.values()).await {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e.with_statement(&sql, &bind_log)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if count != 1 {
            return Outcome::Err(row_count_error(&table, &sql, &bind_log, count));
        }

        if generated {
            let key = if meta.insert.native_generated_keys() {
                key
            } else {
                match meta.insert.fallback_key_sql() {
                    Some(key_sql) => match self.connection.query(cx, key_sql, &[]).await {
                        Outcome::Ok(rows) => rows.first().and_then(|row| row.get(0).cloned()),
                        Outcome::Err(e) => return Outcome::Err(e.with_statement(key_sql, "")),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    },
                    None => None,
                }
            };
            let Some(key) = key.filter(|k| !k.is_null()) else {
                return Outcome::Err(Error::KeyGeneration(KeyGenerationError {
                    table,
                    message: "insert returned no generated key".to_string(),
                }));
            };
            let mut b = write_bean(bean);
            if let Err(e) = desc.id_binder().convert_set_id(&IdValue::Single(key), Some(&mut *b)) {
                return Outcome::Err(e);
            }
        }

        let registered = {
            let mut b = write_bean(bean);
            b.reset_dirty();
            b.id()
        };
        if let Some(id) = registered {
            if let Err(e) = self.context.put(&desc, &id, Arc::clone(bean)) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(())
    }

    async fn update(&mut self, cx: &Cx, bean: &BeanRef) -> Outcome<(), Error> {
        let database = Arc::clone(&self.database);
        let dialect = self.connection.dialect();
        let mode = self.config.concurrency_mode;
        let dynamic = self.config.dynamic_updates;
        let prepared = {
            let b = read_bean(bean);
            let desc = Arc::clone(b.descriptor());
            database
                .dml()
                .get(database.descriptors(), &desc, dialect)
                .and_then(|meta| {
                    let update = meta.update.prepare(&b, mode, dynamic)?;
                    Ok((desc.table()?.to_string(), update))
                })
        };
        let (table, update) = match prepared {
            Ok((table, Some(update))) => (table, update),
            Ok((_, None)) => {
                tracing::trace!("Nothing to update");
                return Outcome::Ok(());
            }
            Err(e) => return Outcome::Err(e),
        };
        match self.execute_dml(cx, &table, &update.statement).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let mut b = write_bean(bean);
        if let Some((position, version)) = update.next_version {
            b.load_value(position, PropertyValue::Scalar(version));
        }
        b.reset_dirty();
        Outcome::Ok(())
    }

    /// Delete a loaded bean, guarded by its version when the mode checks
    /// versions.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn delete(&mut self, cx: &Cx, bean: &BeanRef) -> Outcome<(), Error> {
        let database = Arc::clone(&self.database);
        let dialect = self.connection.dialect();
        let mode = self.config.concurrency_mode;
        let prepared = {
            let b = read_bean(bean);
            let desc = Arc::clone(b.descriptor());
            database
                .dml()
                .get(database.descriptors(), &desc, dialect)
                .and_then(|meta| {
                    let id = b
                        .id()
                        .ok_or_else(|| Error::mapping(desc.name(), "cannot delete a bean without id"))?;
                    let version = desc
                        .version_property()
                        .and_then(|p| b.value_at(p.position()))
                        .and_then(PropertyValue::as_value)
                        .cloned();
                    let statement = meta.delete.prepare(&id, version.as_ref(), mode)?;
                    Ok((desc.table()?.to_string(), Arc::clone(&desc), id, statement))
                })
        };
        let (table, desc, id, statement) = match prepared {
            Ok(v) => v,
            Err(e) => return Outcome::Err(e),
        };
        match self.execute_dml(cx, &table, &statement).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let token = {
            let mut b = write_bean(bean);
            b.set_state(BeanState::Deleted);
            b.lazy_token()
        };
        if let Some(token) = token {
            self.loads.abandon(token);
        }
        match self.context.remove(&desc, &id) {
            Ok(_) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn execute_dml(
        &mut self,
        cx: &Cx,
        table: &str,
        statement: &DmlStatement,
    ) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let bind_log = statement.binds.bind_log();
        tracing::debug!(sql = %statement.sql, binds = %bind_log, "Executing statement");
        let count = match self
            .connection
            .execute(cx, &statement.sql, statement.binds.values())
            .await
        {
            Outcome::Ok(count) => count,
            Outcome::Err(e) => return Outcome::Err(e.with_statement(&statement.sql, &bind_log)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if count != 1 {
            tracing::warn!(
                sql = %statement.sql,
                checked = statement.concurrency_checked,
                rows = count,
                "Unexpected row count"
            );
            return Outcome::Err(row_count_error(table, &statement.sql, &bind_log, count));
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop tracking `bean`: it leaves the persistence context and its
    /// pending lazy-load entries are abandoned.
    pub fn detach(&mut self, bean: &BeanRef) -> Result<()> {
        let (desc, id, tokens) = {
            let b = read_bean(bean);
            let mut tokens: Vec<LoadToken> = b.lazy_token().into_iter().collect();
            for position in 0..b.descriptor().properties().len() {
                if let Some(PropertyValue::Many(BeanList::Deferred(Some(token)))) = b.value_at(position) {
                    tokens.push(*token);
                }
            }
            (Arc::clone(b.descriptor()), b.id(), tokens)
        };
        for token in tokens {
            self.loads.abandon(token);
        }
        if let Some(id) = id {
            self.context.remove(&desc, &id)?;
        }
        Ok(())
    }

    /// End the unit of work.
    pub fn commit(&mut self) {
        tracing::info!(
            beans = self.context.len(),
            pending = self.loads.pending(),
            "Unit of work ended"
        );
        self.clear();
    }

    /// Drop the persistence context and every load context. Entries still
    /// pending become abandoned; beans keep the values they hold.
    pub fn clear(&mut self) {
        self.context.clear();
        self.loads.clear();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Repeat the last id so a batch always binds `size` values.
fn pad_ids(mut ids: Vec<IdValue>, size: usize) -> Vec<IdValue> {
    if let Some(last) = ids.last().cloned() {
        while ids.len() < size {
            ids.push(last.clone());
        }
    }
    ids
}

fn many_context(
    map: &DescriptorMap,
    owner: &Arc<BeanDescriptor>,
    position: usize,
    settings: LoadSettings,
) -> Result<LoadManyContext> {
    let prop = owner
        .property_at(position)
        .ok_or_else(|| Error::mapping(owner.name(), format!("no property at {}", position)))?;
    let many = prop
        .assoc_many()
        .ok_or_else(|| Error::mapping_property(owner.name(), &prop.name, "not a to-many property"))?;
    Ok(LoadManyContext {
        settings,
        owner: Arc::clone(owner),
        position,
        target: Arc::clone(map.get(&many.target)?),
        mapped_by: many.mapped_by.clone(),
        order_by: many.order_by.clone(),
    })
}

fn access_trigger(bean: &BeanRef, name: &str) -> Result<(usize, Trigger)> {
    let b = read_bean(bean);
    let desc = b.descriptor();
    let position = desc
        .property_index(name)
        .ok_or_else(|| Error::mapping_property(desc.name(), name, "unknown property"))?;
    let is_id = desc.properties()[position].id;
    let trigger = match b.value_at(position) {
        _ if is_id => Trigger::Nothing,
        _ if b.is_missing() => Trigger::Missing,
        Some(PropertyValue::Many(BeanList::Deferred(token))) => Trigger::Many(*token),
        _ if b.state() == BeanState::Reference => Trigger::Reference(b.lazy_token()),
        _ if !b.is_loaded(position) && b.state() == BeanState::Loaded => Trigger::Reference(None),
        _ => Trigger::Nothing,
    };
    Ok((position, trigger))
}

fn not_found(bean: &BeanRef) -> Error {
    let b = read_bean(bean);
    Error::EntityNotFound(EntityNotFoundError {
        entity: b.type_name().to_string(),
        id: b.id().map_or_else(|| "?".to_string(), |id| id.to_string()),
    })
}

/// A new bean's null version starts at 1.
fn initial_version(bean: &mut tessera_core::Bean) -> Result<()> {
    let desc = Arc::clone(bean.descriptor());
    let Some(prop) = desc.version_property() else {
        return Ok(());
    };
    let current = bean.value_at(prop.position()).and_then(PropertyValue::as_value);
    if current.is_none_or(Value::is_null) {
        let first = next_version(&Value::Null)?.coerce_to(&prop.sql_type)?;
        bean.load_value(prop.position(), PropertyValue::Scalar(first));
    }
    Ok(())
}

fn row_count_error(table: &str, sql: &str, bind_log: &str, actual: u64) -> Error {
    Error::OptimisticLock(OptimisticLockError {
        table: table.to_string(),
        sql: sql.to_string(),
        bind_log: bind_log.to_string(),
        expected_rows: 1,
        actual_rows: actual,
    })
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use std::future::Future;
    use std::sync::Mutex;
    use tessera_core::{BeanDescriptor, BeanProperty, Dialect, IdGeneration, Row, SqlType, new_ref};
    use tessera_query::FetchConfig;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected an error, got: {other:?}")),
        }
    }

    #[derive(Debug, Default)]
    struct Table {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        tables: HashMap<String, Table>,
        queries: Vec<(String, Vec<Value>)>,
        executed: Vec<(String, Vec<Value>)>,
        fail_next_query: bool,
        affected: Option<u64>,
        generated_key: Option<Value>,
    }

    impl MockState {
        fn table(&mut self, name: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
            self.tables.insert(
                name.to_string(),
                Table {
                    columns: columns.iter().map(|c| (*c).to_string()).collect(),
                    rows,
                },
            );
        }

        /// Answer a single-table select filtered on one column.
        fn select(&self, sql: &str, params: &[Value]) -> Vec<Row> {
            if sql.starts_with("select last_insert_rowid()") {
                return self
                    .generated_key
                    .iter()
                    .map(|k| Row::from_values(vec![k.clone()]))
                    .collect();
            }
            let body = sql.strip_prefix("select ").expect("select statement");
            let body = body.strip_prefix("distinct ").unwrap_or(body);
            let (columns, rest) = body.split_once(" from ").expect("from clause");
            let name = rest.split_whitespace().next().expect("table name");
            let table = self.tables.get(name).expect("known table");
            let index = |column: &str| {
                let column = column.rsplit('.').next().unwrap_or(column);
                table
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .expect("known column")
            };
            let wanted: Vec<usize> = columns.split(", ").map(index).collect();
            let filter = rest.split_once(" where ").map(|(_, w)| {
                index(w.split([' ', '=']).next().expect("filter column"))
            });
            table
                .rows
                .iter()
                .filter(|row| filter.is_none_or(|i| params.iter().any(|p| p == &row[i])))
                .map(|row| Row::from_values(wanted.iter().map(|i| row[*i].clone()).collect()))
                .collect()
        }
    }

    #[derive(Debug, Clone)]
    struct MockConnection {
        state: Arc<Mutex<MockState>>,
        dialect: Dialect,
    }

    impl MockConnection {
        fn new(state: Arc<Mutex<MockState>>) -> Self {
            Self {
                state,
                dialect: Dialect::Postgres,
            }
        }
    }

    impl Connection for MockConnection {
        fn dialect(&self) -> Dialect {
            self.dialect
        }

        fn query(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            let state = Arc::clone(&self.state);
            let sql = sql.to_string();
            let params = params.to_vec();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.queries.push((sql.clone(), params.clone()));
                if std::mem::take(&mut guard.fail_next_query) {
                    return Outcome::Err(Error::Custom("connection reset".to_string()));
                }
                Outcome::Ok(guard.select(&sql, &params))
            }
        }

        fn execute(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            let state = Arc::clone(&self.state);
            let sql = sql.to_string();
            let params = params.to_vec();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.executed.push((sql, params));
                Outcome::Ok(guard.affected.unwrap_or(1))
            }
        }

        fn insert(
            &self,
            _cx: &Cx,
            sql: &str,
            params: &[Value],
        ) -> impl Future<Output = Outcome<(u64, Option<Value>), Error>> + Send {
            let state = Arc::clone(&self.state);
            let sql = sql.to_string();
            let params = params.to_vec();
            let native = self.dialect.supports_generated_keys();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.executed.push((sql, params));
                let key = if native { guard.generated_key.clone() } else { None };
                Outcome::Ok((1, key))
            }
        }
    }

    fn descriptors() -> DescriptorMap {
        DescriptorMap::build(vec![
            BeanDescriptor::builder("Customer")
                .table("customer")
                .id_generation(IdGeneration::Identity)
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id().generated())
                .property(BeanProperty::scalar("name", "name", SqlType::VarChar(40)))
                .property(BeanProperty::scalar("version", "version", SqlType::BigInt).version()),
            BeanDescriptor::builder("Order")
                .table("orders")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::scalar("status", "status", SqlType::VarChar(10)))
                .property(BeanProperty::one("customer", "Customer"))
                .property(BeanProperty::many("lines", "Line", "order").order_by("lineNo")),
            BeanDescriptor::builder("Line")
                .table("order_line")
                .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
                .property(BeanProperty::scalar("lineNo", "line_no", SqlType::Integer))
                .property(BeanProperty::one("order", "Order").required()),
        ])
        .expect("valid descriptors")
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn store() -> Arc<Mutex<MockState>> {
        let mut state = MockState::default();
        state.table(
            "customer",
            &["id", "name", "version"],
            vec![
                vec![Value::BigInt(1), text("Ann"), Value::BigInt(1)],
                vec![Value::BigInt(2), text("Bob"), Value::BigInt(1)],
                vec![Value::BigInt(3), text("Cid"), Value::BigInt(4)],
            ],
        );
        state.table(
            "orders",
            &["id", "status", "customer_id"],
            vec![
                vec![Value::BigInt(10), text("NEW"), Value::BigInt(1)],
                vec![Value::BigInt(11), text("NEW"), Value::BigInt(2)],
                vec![Value::BigInt(12), text("SHIPPED"), Value::BigInt(3)],
                vec![Value::BigInt(13), text("NEW"), Value::BigInt(1)],
            ],
        );
        state.table(
            "order_line",
            &["id", "line_no", "order_id"],
            vec![
                vec![Value::BigInt(100), Value::Int(1), Value::BigInt(10)],
                vec![Value::BigInt(101), Value::Int(2), Value::BigInt(10)],
                vec![Value::BigInt(102), Value::Int(1), Value::BigInt(12)],
            ],
        );
        Arc::new(Mutex::new(state))
    }

    fn session(state: &Arc<Mutex<MockState>>) -> Session<MockConnection> {
        Arc::new(Database::new(descriptors())).session(MockConnection::new(Arc::clone(state)))
    }

    fn query_count(state: &Arc<Mutex<MockState>>) -> usize {
        state.lock().expect("lock poisoned").queries.len()
    }

    fn one(value: PropertyValue) -> BeanRef {
        match value {
            PropertyValue::One(Some(bean)) => bean,
            other => std::panic::panic_any(format!("expected a bean, got {other:?}")),
        }
    }

    fn members(value: PropertyValue) -> Vec<BeanRef> {
        match value {
            PropertyValue::Many(BeanList::Loaded(members)) => members,
            other => std::panic::panic_any(format!("expected a loaded list, got {other:?}")),
        }
    }

    fn scalar(bean: &BeanRef, name: &str) -> Value {
        read_bean(bean)
            .scalar(name)
            .expect("known property")
            .cloned()
            .expect("loaded property")
    }

    #[test]
    fn test_find_list_shares_references_and_registers_beans() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let orders = unwrap_outcome(session.find_list(&cx, &Query::new("Order")).await);
            assert_eq!(orders.len(), 4);

            let first = read_bean(&orders[0]).get("customer").expect("property").clone();
            let last = read_bean(&orders[3]).get("customer").expect("property").clone();
            let (first, last) = (one(first), one(last));
            assert!(Arc::ptr_eq(&first, &last));
            assert_eq!(read_bean(&first).state(), BeanState::Reference);

            // four orders and three customer references
            assert_eq!(session.persistence_context().len(), 7);
            // three customers plus four deferred line lists
            assert_eq!(session.pending_loads(), 7);
            assert_eq!(query_count(&state), 1);
        });
    }

    #[test]
    fn test_lazy_reference_loads_a_batch_of_siblings() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let query = Query::new("Order")
                .select(&["status"])
                .fetch("customer", &[], FetchConfig::lazy(2));
            let orders = unwrap_outcome(session.find_list(&cx, &query).await);
            let customers: Vec<BeanRef> = orders
                .iter()
                .map(|o| one(read_bean(o).get("customer").expect("property").clone()))
                .collect();

            let name = unwrap_outcome(session.get(&cx, &customers[0], "name").await);
            assert_eq!(name.as_value(), Some(&text("Ann")));
            assert_eq!(query_count(&state), 2);
            {
                let guard = state.lock().expect("lock poisoned");
                let (sql, params) = &guard.queries[1];
                assert_eq!(
                    sql,
                    "select c.id, c.name, c.version from customer c where c.id in (?,?)"
                );
                assert_eq!(params, &vec![Value::BigInt(1), Value::BigInt(2)]);
            }

            // loaded by the first batch
            unwrap_outcome(session.get(&cx, &customers[1], "name").await);
            assert_eq!(query_count(&state), 2);

            unwrap_outcome(session.get(&cx, &customers[2], "name").await);
            assert_eq!(query_count(&state), 3);
            assert_eq!(scalar(&customers[2], "version"), Value::BigInt(4));
            assert_eq!(session.pending_loads(), 0);
        });
    }

    #[test]
    fn test_missing_row_fails_only_its_own_reference() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let query = Query::new("Order")
                .select(&["status"])
                .fetch("customer", &[], FetchConfig::lazy(0));
            let orders = unwrap_outcome(session.find_list(&cx, &query).await);
            let customers: Vec<BeanRef> = orders
                .iter()
                .take(3)
                .map(|o| one(read_bean(o).get("customer").expect("property").clone()))
                .collect();

            // customer 2 is deleted after the orders were read
            state
                .lock()
                .expect("lock poisoned")
                .tables
                .get_mut("customer")
                .expect("customer table")
                .rows
                .retain(|row| row[0] != Value::BigInt(2));

            let name = unwrap_outcome(session.get(&cx, &customers[2], "name").await);
            assert_eq!(name.as_value(), Some(&text("Cid")));
            assert_eq!(query_count(&state), 2);

            let err = unwrap_err(session.get(&cx, &customers[1], "name").await);
            assert!(matches!(err, Error::EntityNotFound(ref e) if e.id == "2"), "{err}");
            assert_eq!(scalar(&customers[0], "name"), text("Ann"));
            assert_eq!(query_count(&state), 2);
        });
    }

    #[test]
    fn test_query_join_is_flushed_after_main_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let query = Query::new("Order").fetch("lines", &[], FetchConfig::query(0));
            let orders = unwrap_outcome(session.find_list(&cx, &query).await);
            assert_eq!(query_count(&state), 2);
            {
                let guard = state.lock().expect("lock poisoned");
                let (sql, params) = &guard.queries[1];
                assert!(sql.starts_with("select l.id, l.line_no, l.order_id from order_line l"));
                assert!(sql.ends_with("order by l.line_no"), "{sql}");
                assert_eq!(params.len(), 100);
            }

            let lines = members(unwrap_outcome(session.get(&cx, &orders[0], "lines").await));
            assert_eq!(lines.len(), 2);
            let empty = members(unwrap_outcome(session.get(&cx, &orders[1], "lines").await));
            assert!(empty.is_empty());
            let back = one(read_bean(&lines[0]).get("order").expect("property").clone());
            assert!(Arc::ptr_eq(&back, &orders[0]));
            assert_eq!(query_count(&state), 2);
        });
    }

    #[test]
    fn test_lazy_list_loads_every_pending_owner() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let orders = unwrap_outcome(session.find_list(&cx, &Query::new("Order")).await);
            let lines = members(unwrap_outcome(session.get(&cx, &orders[2], "lines").await));
            assert_eq!(lines.len(), 1);
            assert_eq!(query_count(&state), 2);

            let first = members(unwrap_outcome(session.get(&cx, &orders[0], "lines").await));
            assert_eq!(first.len(), 2);
            assert_eq!(query_count(&state), 2);
        });
    }

    #[test]
    fn test_failed_batch_returns_entries_to_pending() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let query = Query::new("Order").select(&["status", "customer"]);
            let orders = unwrap_outcome(session.find_list(&cx, &query).await);
            let customer = one(read_bean(&orders[0]).get("customer").expect("property").clone());
            let pending = session.pending_loads();

            state.lock().expect("lock poisoned").fail_next_query = true;
            let err = unwrap_err(session.get(&cx, &customer, "name").await);
            assert!(err.to_string().contains("connection reset"));
            assert_eq!(session.pending_loads(), pending);
            assert_eq!(read_bean(&customer).state(), BeanState::Reference);

            let name = unwrap_outcome(session.get(&cx, &customer, "name").await);
            assert_eq!(name.as_value(), Some(&text("Ann")));
            assert_eq!(session.pending_loads(), 0);
        });
    }

    #[test]
    fn test_find_by_id_hits_persistence_context() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let order = unwrap_outcome(session.find_by_id(&cx, "Order", 11i64).await)
                .expect("order 11");
            let again = unwrap_outcome(session.find_by_id(&cx, "Order", 11i32).await)
                .expect("order 11");
            assert!(Arc::ptr_eq(&order, &again));
            assert_eq!(query_count(&state), 1);

            // a pending reference loads on lookup
            let customer = unwrap_outcome(session.find_by_id(&cx, "Customer", 2i64).await)
                .expect("customer 2");
            assert_eq!(read_bean(&customer).state(), BeanState::Loaded);
            assert_eq!(query_count(&state), 2);

            assert!(unwrap_outcome(session.find_by_id(&cx, "Order", 99i64).await).is_none());
        });
    }

    #[test]
    fn test_insert_reads_native_generated_key() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        state.lock().expect("lock poisoned").generated_key = Some(Value::BigInt(42));
        let mut session = session(&state);

        rt.block_on(async {
            let desc = Arc::clone(session.database().descriptors().get("Customer").expect("type"));
            let bean = new_ref(tessera_core::Bean::new(desc));
            write_bean(&bean).set_value("name", "Dee").expect("settable");

            unwrap_outcome(session.save(&cx, &bean).await);
            {
                let guard = state.lock().expect("lock poisoned");
                let (sql, params) = &guard.executed[0];
                assert_eq!(sql, "insert into customer (name, version) values (?, ?)");
                assert_eq!(params, &vec![text("Dee"), Value::BigInt(1)]);
            }
            let b = read_bean(&bean);
            assert_eq!(b.id(), Some(IdValue::from(42i64)));
            assert_eq!(b.state(), BeanState::Loaded);
            assert!(!b.is_dirty());
            drop(b);
            assert!(session.persistence_context().contains(
                read_bean(&bean).descriptor(),
                &IdValue::from(42i64)
            ));
        });
    }

    #[test]
    fn test_insert_falls_back_to_last_id_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let database = Arc::new(Database::new(descriptors()));
        let mut conn = MockConnection::new(Arc::clone(&state));
        conn.dialect = Dialect::Sqlite;
        let mut session = database.session(conn);

        rt.block_on(async {
            let desc = Arc::clone(database.descriptors().get("Customer").expect("type"));
            let bean = new_ref(tessera_core::Bean::new(Arc::clone(&desc)));

            let err = unwrap_err(session.save(&cx, &bean).await);
            assert!(matches!(err, Error::KeyGeneration(_)), "{err}");

            state.lock().expect("lock poisoned").generated_key = Some(Value::BigInt(7));
            let bean = new_ref(tessera_core::Bean::new(desc));
            unwrap_outcome(session.save(&cx, &bean).await);
            assert_eq!(read_bean(&bean).id(), Some(IdValue::from(7i64)));
            let guard = state.lock().expect("lock poisoned");
            assert_eq!(guard.queries.last().expect("key query").0, "select last_insert_rowid()");
        });
    }

    #[test]
    fn test_update_changes_only_dirty_columns_and_bumps_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let customer = unwrap_outcome(session.find_by_id(&cx, "Customer", 3i64).await)
                .expect("customer 3");
            write_bean(&customer).set_value("name", "Cyd").expect("settable");
            unwrap_outcome(session.save(&cx, &customer).await);

            {
                let guard = state.lock().expect("lock poisoned");
                let (sql, params) = &guard.executed[0];
                assert_eq!(sql, "update customer set name=?, version=? where id=? and version=?");
                assert_eq!(
                    params,
                    &vec![text("Cyd"), Value::BigInt(5), Value::BigInt(3), Value::BigInt(4)]
                );
            }
            assert_eq!(scalar(&customer, "version"), Value::BigInt(5));
            assert!(!read_bean(&customer).is_dirty());

            // nothing changed, nothing executed
            unwrap_outcome(session.save(&cx, &customer).await);
            assert_eq!(state.lock().expect("lock poisoned").executed.len(), 1);
        });
    }

    #[test]
    fn test_stale_version_is_optimistic_lock_error() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let customer = unwrap_outcome(session.find_by_id(&cx, "Customer", 1i64).await)
                .expect("customer 1");
            write_bean(&customer).set_value("name", "Ana").expect("settable");
            state.lock().expect("lock poisoned").affected = Some(0);

            let err = unwrap_err(session.save(&cx, &customer).await);
            assert!(err.is_optimistic_lock());
            assert_eq!(
                err.sql(),
                Some("update customer set name=?, version=? where id=? and version=?")
            );
            // the failed save leaves the change pending
            assert!(read_bean(&customer).is_dirty());
            assert_eq!(scalar(&customer, "version"), Value::BigInt(1));
        });
    }

    #[test]
    fn test_delete_guards_version_and_leaves_context() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let customer = unwrap_outcome(session.find_by_id(&cx, "Customer", 3i64).await)
                .expect("customer 3");
            unwrap_outcome(session.delete(&cx, &customer).await);
            {
                let guard = state.lock().expect("lock poisoned");
                let (sql, params) = &guard.executed[0];
                assert_eq!(sql, "delete from customer where id=? and version=?");
                assert_eq!(params, &vec![Value::BigInt(3), Value::BigInt(4)]);
            }
            assert_eq!(read_bean(&customer).state(), BeanState::Deleted);
            assert!(session.persistence_context().is_empty());

            let err = unwrap_err(session.save(&cx, &customer).await);
            assert!(matches!(err, Error::Mapping(_)));
        });
    }

    #[test]
    fn test_clear_abandons_pending_and_detached_reference_loads_alone() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let query = Query::new("Order").select(&["status", "customer"]);
            let orders = unwrap_outcome(session.find_list(&cx, &query).await);
            let customer = one(read_bean(&orders[1]).get("customer").expect("property").clone());

            session.commit();
            assert!(session.persistence_context().is_empty());
            assert_eq!(session.pending_loads(), 0);

            let name = unwrap_outcome(session.get(&cx, &customer, "name").await);
            assert_eq!(name.as_value(), Some(&text("Bob")));
            let guard = state.lock().expect("lock poisoned");
            let (sql, params) = guard.queries.last().expect("reference query");
            assert!(sql.ends_with("where c.id in (?)"), "{sql}");
            assert_eq!(params, &vec![Value::BigInt(2)]);
        });
    }

    #[test]
    fn test_partially_selected_bean_refreshes_on_access() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            // the version column is always selected
            let query = Query::new("Customer").select(&["version"]);
            let customers = unwrap_outcome(session.find_list(&cx, &query).await);
            assert!(!read_bean(&customers[0]).is_loaded(1));

            let name = unwrap_outcome(session.get(&cx, &customers[0], "name").await);
            assert_eq!(name.as_value(), Some(&text("Ann")));
            assert_eq!(query_count(&state), 2);
            assert_eq!(scalar(&customers[0], "version"), Value::BigInt(1));
        });
    }

    #[test]
    fn test_detach_abandons_entries() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = store();
        let mut session = session(&state);

        rt.block_on(async {
            let orders = unwrap_outcome(session.find_list(&cx, &Query::new("Order")).await);
            let before = session.pending_loads();
            session.detach(&orders[0]).expect("detach");
            assert_eq!(session.pending_loads(), before - 1);
            assert_eq!(session.persistence_context().len(), 6);
        });
    }
}
