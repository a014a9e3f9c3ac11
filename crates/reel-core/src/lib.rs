//! Core types and traits for the reel persistence core.
//!
//! This crate provides the foundations every other reel crate builds on:
//!
//! - `Value`, `Date` and `Row` for column data
//! - `Statement` and `Expr`, a dialect-neutral statement AST
//! - `Executor`, the seam to a relational store
//! - `Entity`, `Ref` and the association field types
//! - `Registry`, the metadata registry
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod executor;
pub mod field;
pub mod model;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod statement;
pub mod validate;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConstraintKind, ConstraintViolation, DetachedLazyAccess, Error,
    FieldValidationError, NotManaged, QueryError, QueryErrorKind, Result, StaleState, TypeError,
    UnpersistedReference, ValidationError, ValidationErrorKind, WriteKind,
};
pub use executor::{ExecResult, Executor, RowStream};
pub use field::{FieldSchema, Formula, IdGeneration, IdentitySchema, SqlType};
pub use model::{AnyRef, Entity, EntitySchema, ManagedCell, Ref, unknown_field};
pub use registry::{EntityMeta, Registry, RegistryBuilder};
pub use relationship::{
    Association, Cardinality, CascadePolicy, EdgeSchema, ElementCollectionSchema, Fetch, Install,
    Inverse, JoinSpec, LazyPlaceholder, Related, RelatedSet, SessionToken, Side, Targets,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::{
    BinaryOp, Dialect, Expr, Func, Join, JoinKind, OrderBy, OrderDirection, SelectItem,
    SelectStatement, Statement, TableRef,
};
pub use validate::validate_scalars;
pub use value::{Date, Value};
