//! Lifecycle hooks.
//!
//! Two kinds of hook exist:
//!
//! - [`EntityListener`]: synchronous callbacks attached to one entity type's
//!   metadata, receiving the entity itself. They run first.
//! - [`EntitySubscriber`]: async callbacks registered on the registry, either
//!   for every type or for the type named by [`EntitySubscriber::listen_to`].
//!   They receive a [`HookEvent`] with a [`QueryRunner`] joined to the
//!   engine's transaction.
//!
//! Both may change the entity's own non-key columns in `before_*` hooks.

use crate::driver::{BoxFuture, QueryRunner};
use crate::entity::{Entity, EntityRef};
use crate::error::{Error, Result};
use crate::metadata::EntityMetadata;
use asupersync::{Cx, Outcome};

/// Points in a subject's execution where hooks fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
    BeforeSoftRemove,
    AfterSoftRemove,
    BeforeRecover,
    AfterRecover,
}

impl HookPoint {
    pub const fn is_before(&self) -> bool {
        matches!(
            self,
            HookPoint::BeforeInsert
                | HookPoint::BeforeUpdate
                | HookPoint::BeforeRemove
                | HookPoint::BeforeSoftRemove
                | HookPoint::BeforeRecover
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeInsert => "before_insert",
            HookPoint::AfterInsert => "after_insert",
            HookPoint::BeforeUpdate => "before_update",
            HookPoint::AfterUpdate => "after_update",
            HookPoint::BeforeRemove => "before_remove",
            HookPoint::AfterRemove => "after_remove",
            HookPoint::BeforeSoftRemove => "before_soft_remove",
            HookPoint::AfterSoftRemove => "after_soft_remove",
            HookPoint::BeforeRecover => "before_recover",
            HookPoint::AfterRecover => "after_recover",
        }
    }
}

/// Entity-level lifecycle callbacks.
///
/// All methods default to no-ops. Returning an error aborts the whole call
/// and rolls back its transaction.
///
/// # Example
///
/// ```ignore
/// struct Slugify;
///
/// impl EntityListener for Slugify {
///     fn before_insert(&self, entity: &mut Entity) -> Result<()> {
///         if let Some(title) = entity.value("title").and_then(Value::as_str) {
///             let slug = title.to_lowercase().replace(' ', "-");
///             entity.set("slug", slug);
///         }
///         Ok(())
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait EntityListener: Send + Sync {
    /// Called before a new entity is inserted.
    fn before_insert(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    /// Called after the insert; generated values are already backfilled when
    /// the call writes them back.
    fn after_insert(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn before_update(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn after_update(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn before_remove(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn after_remove(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn before_soft_remove(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn after_soft_remove(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn before_recover(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }

    fn after_recover(&self, entity: &mut Entity) -> Result<()> {
        Ok(())
    }
}

/// Route a hook point to the matching listener method.
pub fn dispatch_listener(
    listener: &dyn EntityListener,
    point: HookPoint,
    entity: &mut Entity,
) -> Result<()> {
    match point {
        HookPoint::BeforeInsert => listener.before_insert(entity),
        HookPoint::AfterInsert => listener.after_insert(entity),
        HookPoint::BeforeUpdate => listener.before_update(entity),
        HookPoint::AfterUpdate => listener.after_update(entity),
        HookPoint::BeforeRemove => listener.before_remove(entity),
        HookPoint::AfterRemove => listener.after_remove(entity),
        HookPoint::BeforeSoftRemove => listener.before_soft_remove(entity),
        HookPoint::AfterSoftRemove => listener.after_soft_remove(entity),
        HookPoint::BeforeRecover => listener.before_recover(entity),
        HookPoint::AfterRecover => listener.after_recover(entity),
    }
}

/// Context handed to subscribers.
pub struct HookEvent<'a> {
    pub cx: &'a Cx,
    pub point: HookPoint,
    pub entity: &'a EntityRef,
    pub metadata: &'a EntityMetadata,
    /// Runs statements inside the engine's transaction.
    pub queries: &'a dyn QueryRunner,
}

/// Registry-level async lifecycle subscriber.
///
/// Implementations must not hold the entity's lock across an await point.
pub trait EntitySubscriber: Send + Sync {
    /// Entity type this subscriber is limited to; `None` receives every type.
    fn listen_to(&self) -> Option<&str> {
        None
    }

    fn on_event<'a>(&'a self, event: &'a HookEvent<'a>) -> BoxFuture<'a, Outcome<(), Error>>;
}
