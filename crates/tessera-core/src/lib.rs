//! Core types and traits for Tessera.
//!
//! This crate provides the foundations shared by the query compiler and the
//! session layer:
//!
//! - `Value`, `Row` and the positional `DataReader` / `DataBind` seams
//! - `Connection` trait for executing generated statements
//! - Deploy metadata (`BeanDescriptor`, `BeanProperty`, `DescriptorMap`)
//! - `IdBinder` for every primary key shape
//! - `Bean`, the explicit entity capability contract (dirty tracking, lazy hooks)
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod bean;
pub mod bind;
pub mod connection;
pub mod deploy;
pub mod dialect;
pub mod dml_request;
pub mod error;
pub mod field_set;
pub mod row;
pub mod types;
pub mod value;

pub use bean::{
    Bean, BeanList, BeanRef, BeanState, Intercept, LoadToken, PropertyValue, new_ref, read_bean,
    write_bean,
};
pub use bind::{BindValues, DataBind};
pub use connection::Connection;
pub use deploy::{
    BeanDescriptor, BeanProperty, ConcurrencyMode, DescriptorBuilder, DescriptorMap, IdBinder,
    IdGeneration, IdKind, IdValue, PropertyKind,
};
pub use dialect::Dialect;
pub use dml_request::{DmlMode, GenerateDmlRequest};
pub use error::{
    ConfigError, EntityNotFoundError, Error, KeyGenerationError, MappingError, MaxJoinDepthError,
    OptimisticLockError, Result, StatementError, StatementErrorKind, TypeError,
};
pub use field_set::FieldSet;
pub use row::{DataReader, Row, RowReader};
pub use types::SqlType;
pub use value::Value;
