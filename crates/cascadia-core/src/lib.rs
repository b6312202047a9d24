//! Core types and traits for Cascadia.
//!
//! This crate provides the foundations the persistence engine builds on:
//!
//! - `Value` and `Row` for dynamically typed column data
//! - `Entity` / `EntityRef` for in-memory object graphs
//! - `EntityMetadata` and the validated `Registry` describing entity types
//! - `Driver` for the primitive insert/update/delete/select operations
//! - `EntityListener` / `EntitySubscriber` lifecycle hooks
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod driver;
pub mod entity;
pub mod error;
pub mod events;
pub mod metadata;
pub mod registry;
pub mod row;
pub mod value;

pub use driver::{BoxFuture, Driver, InsertBatch, Predicate, QueryRunner, StatementKind};
pub use entity::{Baseline, Entity, EntityKey, EntityRef, Identifier, Property};
pub use error::{
    CascadeError, ConfigError, CycleError, Error, FieldValidationError, OptimisticLockError,
    QueryError, QueryErrorKind, ResolutionError, Result, SubjectError, TransactionError,
    TransactionErrorKind, ValidationError, ValidationErrorKind, WriteKind,
};
pub use events::{EntityListener, EntitySubscriber, HookEvent, HookPoint, dispatch_listener};
pub use metadata::{
    Cascade, ColumnMetadata, ColumnRole, EntityMetadata, Generation, JunctionDescriptor,
    OrphanAction, ReferentialAction, RelationKind, RelationMetadata, SqlType,
};
pub use registry::{JunctionInfo, JunctionSide, Registry, RegistryBuilder};
pub use row::{ColumnInfo, Row};
pub use value::{Value, hash_values};
