//! Deploy metadata: immutable per-entity-type descriptions built once at startup.
//!
//! A [`DescriptorMap`] is built from a set of [`DescriptorBuilder`]s. Building is
//! two-phase: every type is first created from its own declarations, then a
//! second pass resolves cross-type references (imported foreign keys, to-many
//! join columns) that can only be known once every type exists, since
//! associations may be cyclic.

mod descriptor;
mod id_binder;
mod property;

pub use descriptor::{
    BeanDescriptor, DescriptorBuilder, DescriptorMap, IdGeneration, InheritInfo, TableJoin,
};
pub use id_binder::{IdBinder, IdColumn, IdKind, IdValue, in_clause};
pub use property::{AssocMany, AssocOne, BeanProperty, EmbeddedInfo, ImportedColumn, PropertyKind};

use serde::{Deserialize, Serialize};

/// Optimistic concurrency mode applied to updates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    /// No concurrency check, the where clause only holds the id.
    None,
    /// Check the version column.
    #[default]
    Version,
    /// Check the remembered old value of every changed column.
    All,
}
