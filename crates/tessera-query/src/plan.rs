//! Compiled query plans and their cache.
//!
//! A plan is compiled once per distinct query shape and then shared by every
//! execution. Join trees are built once per root type and cloned per plan.
//! Neither cache ever evicts: the number of distinct shapes an application
//! issues is bounded by its code.

use crate::compile::compile;
use crate::detail::SecondaryJoin;
use crate::join_tree::{JoinTree, TreeLimits};
use crate::query::Query;
use crate::sql_tree::SqlTree;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tessera_core::{DescriptorMap, Dialect, Result};

/// Compute a cache key from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// SQL text plus the reader that consumes its rows.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub(crate) key: u64,
    pub(crate) entity: String,
    pub(crate) sql: String,
    pub(crate) tree: SqlTree,
    pub(crate) secondary: Vec<SecondaryJoin>,
    pub(crate) bind_count: usize,
    pub(crate) depth_exceeded: bool,
}

impl QueryPlan {
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn sql_tree(&self) -> &SqlTree {
        &self.tree
    }

    /// Query and lazy joins to run after the main statement.
    pub fn secondary(&self) -> &[SecondaryJoin] {
        &self.secondary
    }

    /// Placeholders in [`sql`](Self::sql).
    pub fn bind_count(&self) -> usize {
        self.bind_count
    }

    /// Whether some join was dropped at the maximum join depth.
    pub fn depth_exceeded(&self) -> bool {
        self.depth_exceeded
    }
}

/// Hit/miss counters of a [`QueryPlanCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlanCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub plans: usize,
}

/// Process-wide plan cache keyed by [`Query::plan_key`].
#[derive(Debug, Default)]
pub struct QueryPlanCache {
    limits: TreeLimits,
    plans: RwLock<HashMap<u64, Arc<QueryPlan>>>,
    trees: RwLock<HashMap<String, Arc<JoinTree>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryPlanCache {
    pub fn new(limits: TreeLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> TreeLimits {
        self.limits
    }

    /// The cached plan for `query`, compiling it on first use.
    ///
    /// Two threads missing on the same key may both compile; the first
    /// insert wins and both get the same plan.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %query.entity()))]
    pub fn get_or_compile(
        &self,
        map: &DescriptorMap,
        query: &Query,
        dialect: Dialect,
    ) -> Result<Arc<QueryPlan>> {
        let key = query.plan_key(dialect);
        if let Some(plan) = self
            .plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(plan));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let deploy = self.deploy_tree(map, query.entity())?;
        let plan = Arc::new(compile(map, &deploy, query, dialect, key)?);
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(plans.entry(key).or_insert(plan)))
    }

    /// The join tree of `entity` as expanded from deploy metadata.
    pub fn deploy_tree(&self, map: &DescriptorMap, entity: &str) -> Result<Arc<JoinTree>> {
        if let Some(tree) = self
            .trees
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
        {
            return Ok(Arc::clone(tree));
        }
        let root = map.get(entity)?;
        let tree = Arc::new(JoinTree::build(map, root, self.limits)?);
        let mut trees = self.trees.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(trees.entry(entity.to_string()).or_insert(tree)))
    }

    pub fn len(&self) -> usize {
        self.plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PlanCacheStats {
        PlanCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            plans: self.len(),
        }
    }
}
