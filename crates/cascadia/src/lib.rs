//! Cascadia - dependency-ordered persistence of entity object graphs.
//!
//! Cascadia sits between an application's in-memory objects and a relational
//! database. Handing it a graph of related entities with [`Persister::save`]
//! or [`Persister::remove`] makes it work out which rows to insert, update
//! or delete, in which order, and in how few statements:
//!
//! - related entities are reached through relations whose cascade rules
//!   allow it
//! - only columns that differ from the last known persisted state are written
//! - parents are written before the children referencing them, and cycles
//!   through nullable foreign keys are split into insert-then-update
//! - independent writes of the same type are batched into multi-row
//!   statements
//! - everything runs in one transaction that is rolled back on any failure
//!
//! # Quick Start
//!
//! ```ignore
//! use cascadia::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(
//!     Registry::builder()
//!         .entity(
//!             EntityMetadata::new("Category", "categories")
//!                 .column(ColumnMetadata::increment_id("id"))
//!                 .column(ColumnMetadata::new("name", SqlType::Text)),
//!         )
//!         .entity(
//!             EntityMetadata::new("Post", "posts")
//!                 .column(ColumnMetadata::increment_id("id"))
//!                 .column(ColumnMetadata::new("title", SqlType::Text))
//!                 .column(ColumnMetadata::new("category_id", SqlType::BigInt).nullable())
//!                 .relation(
//!                     RelationMetadata::many_to_one("category", "Category", "category_id")
//!                         .cascade(Cascade::SAVE),
//!                 ),
//!         )
//!         .build()?,
//! );
//!
//! async fn publish(cx: &Cx, persister: &Persister<impl Driver>) -> Outcome<PersistReport, Error> {
//!     let category = EntityRef::new(Entity::new("Category").with("name", "news"));
//!     let post = EntityRef::new(
//!         Entity::new("Post")
//!             .with("title", "Hello")
//!             .with_ref("category", Some(category)),
//!     );
//!     // Inserts the category, then the post with its generated id.
//!     persister.save(cx, &[post]).await
//! }
//! ```
//!
//! # Crates
//!
//! - `cascadia-core`: values, entities, metadata registry, errors, the
//!   [`Driver`] trait
//! - `cascadia-persist`: the persistence engine and [`Persister`]
//! - `cascadia-memory`: an in-memory driver for tests

pub use cascadia_core::{
    // asupersync re-exports
    Budget,
    Cx,
    Outcome,
    RegionId,
    TaskId,
    // Values and rows
    Row,
    Value,
    // Entities
    Baseline,
    Entity,
    EntityKey,
    EntityRef,
    Identifier,
    Property,
    // Metadata
    Cascade,
    ColumnMetadata,
    ColumnRole,
    EntityMetadata,
    Generation,
    JunctionDescriptor,
    OrphanAction,
    ReferentialAction,
    Registry,
    RegistryBuilder,
    RelationKind,
    RelationMetadata,
    SqlType,
    // Hooks
    EntityListener,
    EntitySubscriber,
    HookEvent,
    HookPoint,
    // Driver boundary
    BoxFuture,
    Driver,
    InsertBatch,
    Predicate,
    QueryRunner,
    StatementKind,
    // Errors
    CascadeError,
    ConfigError,
    CycleError,
    Error,
    OptimisticLockError,
    QueryError,
    QueryErrorKind,
    ResolutionError,
    Result,
    SubjectError,
    TransactionError,
    TransactionErrorKind,
    ValidationError,
    WriteKind,
};

pub use cascadia_persist::{
    ChangeSetComputer, Clock, DependencyOrderer, ExecutionPlan, FindOptions, GraphWalker,
    Operation, OperationKind, PersistOptions, PersistReport, Persister, PersisterConfig, Step,
    Subject, SubjectGraph, SubjectId,
};

/// Re-exports for building entities and persisting them.
///
/// ```ignore
/// use cascadia::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Cascade, ColumnMetadata, Cx, Driver, Entity, EntityListener, EntityMetadata, EntityRef,
        EntitySubscriber, Error, FindOptions, HookEvent, HookPoint, Identifier, OrphanAction,
        Outcome, PersistOptions, PersistReport, Persister, PersisterConfig, ReferentialAction,
        Registry, RelationMetadata, Result, SqlType, Value,
    };
}
