//! Tessera - query plans, DML generation and batched lazy loading for
//! object-relational mapping.
//!
//! Tessera sits between mapped entity metadata and a SQL connection:
//!
//! - Deploy metadata built once per process ([`DescriptorMap`])
//! - Cached SELECT plans over aliased join trees ([`QueryPlanCache`])
//! - Insert, update and delete statements with optimistic concurrency
//! - A unit of work ([`Session`]) with an identity map and batched lazy loading
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! let descriptors = DescriptorMap::build(vec![
//!     BeanDescriptor::builder("Customer")
//!         .table("customer")
//!         .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
//!         .property(BeanProperty::scalar("name", "name", SqlType::VarChar(40))),
//!     BeanDescriptor::builder("Order")
//!         .table("orders")
//!         .property(BeanProperty::scalar("id", "id", SqlType::BigInt).id())
//!         .property(BeanProperty::scalar("status", "status", SqlType::VarChar(10)))
//!         .property(BeanProperty::one("customer", "Customer")),
//! ])?;
//!
//! let database = Arc::new(Database::new(descriptors));
//! let mut session = database.session(conn);
//!
//! let query = Query::new("Order")
//!     .select(&["status"])
//!     .fetch("customer", &[], FetchConfig::lazy(10));
//! let orders = session.find_list(&cx, &query).await?;
//!
//! // One statement loads this customer and up to nine others
//! let customer = session.get(&cx, &orders[0], "customer").await?;
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: every statement runs under an asupersync `Cx`
//! - **Plan reuse**: literal values never reach SQL text, so plans are shared
//! - **Partial loading**: explicit property selection with reference beans
//! - **Batching**: lazy and query joins load siblings in one statement

// Re-export all public types from sub-crates
pub use tessera_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    Bean,
    BeanDescriptor,
    BeanList,
    BeanProperty,
    BeanRef,
    BeanState,
    BindValues,
    ConcurrencyMode,
    Connection,
    DataBind,
    DataReader,
    DescriptorBuilder,
    DescriptorMap,
    Dialect,
    Error,
    IdBinder,
    IdGeneration,
    IdKind,
    IdValue,
    LoadToken,
    PropertyKind,
    PropertyValue,
    Result,
    Row,
    SqlType,
    Value,
    // Bean handles
    new_ref,
    read_bean,
    write_bean,
};

pub use tessera_core::error::{
    ConfigError, EntityNotFoundError, KeyGenerationError, MappingError, MaxJoinDepthError,
    OptimisticLockError, StatementError, StatementErrorKind, TypeError,
};

pub use tessera_query::{
    CompareOp, DmlMetaCache, Expr, FetchConfig, FetchMode, OrmQueryDetail, OrmQueryProperties,
    PlanCacheStats, Query, QueryPlan, QueryPlanCache, TreeLimits, parse_properties,
};

pub use tessera_session::{
    Database, LoadContexts, PersistenceContext, Session, SessionConfig,
};

/// Lower level building blocks for drivers and tooling.
pub mod core {
    pub use tessera_core::*;
}

/// Query planning internals.
pub mod query {
    pub use tessera_query::*;
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        BeanDescriptor, BeanProperty, BeanRef, BeanState, ConcurrencyMode, Connection, Cx,
        Database, DescriptorMap, Dialect, Error, Expr, FetchConfig, FetchMode, IdGeneration,
        IdValue, Outcome, PropertyValue, Query, Result, Row, Session, SessionConfig, SqlType,
        Value, new_ref, read_bean, write_bean,
    };
    pub use std::sync::Arc;
}
