//! Query planning and statement generation for Tessera.
//!
//! `tessera-query` turns a [`Query`] (root type, per-path [`OrmQueryDetail`],
//! predicate, ordering) into a cached [`QueryPlan`]: SQL text over an aliased
//! join tree plus the [`SqlTree`] that reads its rows positionally. It also
//! builds the insert/update/delete statements of the [`dml`] module.
//!
//! Nothing here executes SQL; the session layer does that through
//! `tessera_core::Connection`.

pub mod alias;
mod compile;
pub mod detail;
pub mod dml;
pub mod hint;
pub mod join_tree;
pub mod plan;
pub mod predicate;
pub mod query;
pub mod sql_tree;

pub use detail::{
    FetchConfig, FetchMode, OrmQueryDetail, OrmQueryProperties, SecondaryJoin, resolve_path,
    split_path,
};
pub use dml::{DeleteMeta, DmlMeta, DmlMetaCache, DmlStatement, InsertMeta, UpdateMeta};
pub use hint::parse_properties;
pub use join_tree::{ElProperty, JoinNode, JoinTree, NodeKind, PropertyDeployMap, TreeLimits};
pub use plan::{PlanCacheStats, QueryPlan, QueryPlanCache, cache_key};
pub use predicate::{CompareOp, Expr, PathResolver};
pub use query::Query;
pub use sql_tree::{ReadProperty, RowLoadContext, SqlTree, SqlTreeNode};
