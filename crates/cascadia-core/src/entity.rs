//! Dynamic entity objects.
//!
//! An [`Entity`] is a bag of named properties bound to an entity type by
//! name. Properties hold column values, references to other entities, or
//! embedded property groups. A property that is absent is "unset" and is
//! never written; `Property::Value(Value::Null)` is an explicit NULL.
//!
//! Entities are shared through [`EntityRef`] handles so an object graph can
//! contain cycles. The persistence engine identifies objects by handle
//! address, never by primary key, since new entities have no key yet.

use crate::value::{Value, hash_values};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A single property of an entity.
#[derive(Debug, Clone)]
pub enum Property {
    /// A column value (possibly an explicit NULL).
    Value(Value),
    /// A to-one relation. `None` clears the relation.
    Ref(Option<EntityRef>),
    /// A to-many relation collection.
    Refs(Vec<EntityRef>),
    /// An embedded property group, flattened into the owner's columns.
    Embedded(BTreeMap<String, Property>),
}

/// Ordered primary-key values of a persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier(Vec<(String, Value)>);

impl Identifier {
    pub fn new(parts: Vec<(String, Value)>) -> Self {
        Self(parts)
    }

    /// Identifier with a single key column.
    pub fn single(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self(vec![(column.into(), value.into())])
    }

    pub fn parts(&self) -> &[(String, Value)] {
        &self.0
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(c, _)| c.as_str())
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    /// Hash of the key values, consistent with [`Identifier::same_as`].
    pub fn hash_key(&self) -> u64 {
        hash_values(&self.values())
    }

    pub fn same_as(&self, other: &Identifier) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|((ca, va), (cb, vb))| ca == cb && va.same_as(vb))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (column, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", column, value)?;
        }
        Ok(())
    }
}

/// Last known persisted state of an entity.
///
/// `columns` maps column names to stored values. `relations` holds the target
/// identifiers of to-many relations that were explicitly loaded; a relation
/// missing from this map was never loaded and has no baseline to diff against.
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    pub columns: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, Vec<Identifier>>,
}

/// An in-memory entity instance.
#[derive(Debug, Clone)]
pub struct Entity {
    type_name: String,
    props: BTreeMap<String, Property>,
    baseline: Option<Baseline>,
}

impl Entity {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            props: BTreeMap::new(),
            baseline: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Builder form of [`Entity::set`].
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set(path, value);
        self
    }

    /// Builder form of [`Entity::set_ref`].
    pub fn with_ref(mut self, name: &str, target: Option<EntityRef>) -> Self {
        self.set_ref(name, target);
        self
    }

    /// Builder form of [`Entity::set_refs`].
    pub fn with_refs(mut self, name: &str, targets: Vec<EntityRef>) -> Self {
        self.set_refs(name, targets);
        self
    }

    /// Set a column value. Dotted paths (`address.city`) write into embedded groups.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        self.set_property(path, Property::Value(value.into()));
    }

    pub fn set_ref(&mut self, name: &str, target: Option<EntityRef>) {
        self.set_property(name, Property::Ref(target));
    }

    pub fn set_refs(&mut self, name: &str, targets: Vec<EntityRef>) {
        self.set_property(name, Property::Refs(targets));
    }

    /// Append to a to-many collection, creating it if unset.
    pub fn push_ref(&mut self, name: &str, target: EntityRef) {
        match self.props.get_mut(name) {
            Some(Property::Refs(items)) => items.push(target),
            _ => {
                self.props
                    .insert(name.to_string(), Property::Refs(vec![target]));
            }
        }
    }

    /// Replace the property at `path`, creating embedded groups on the way.
    pub fn set_property(&mut self, path: &str, property: Property) {
        insert_at(&mut self.props, path, property);
    }

    /// Remove the property at `path`, returning what was there.
    pub fn unset(&mut self, path: &str) -> Option<Property> {
        match path.rsplit_once('.') {
            None => self.props.remove(path),
            Some((parent, leaf)) => match lookup_mut(&mut self.props, parent)? {
                Property::Embedded(inner) => inner.remove(leaf),
                _ => None,
            },
        }
    }

    pub fn property(&self, path: &str) -> Option<&Property> {
        lookup(&self.props, path)
    }

    /// Column value at `path`, or `None` when unset.
    pub fn value(&self, path: &str) -> Option<&Value> {
        match self.property(path)? {
            Property::Value(v) => Some(v),
            _ => None,
        }
    }

    /// To-one relation state: `None` when unset, `Some(None)` when cleared.
    pub fn reference(&self, name: &str) -> Option<Option<&EntityRef>> {
        match self.props.get(name)? {
            Property::Ref(target) => Some(target.as_ref()),
            _ => None,
        }
    }

    /// To-many collection, or `None` when unset.
    pub fn references(&self, name: &str) -> Option<&[EntityRef]> {
        match self.props.get(name)? {
            Property::Refs(items) => Some(items),
            _ => None,
        }
    }

    /// Top-level properties in name order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.props.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    pub fn set_baseline(&mut self, baseline: Option<Baseline>) {
        self.baseline = baseline;
    }
}

fn lookup<'a>(map: &'a BTreeMap<String, Property>, path: &str) -> Option<&'a Property> {
    match path.split_once('.') {
        None => map.get(path),
        Some((head, rest)) => match map.get(head)? {
            Property::Embedded(inner) => lookup(inner, rest),
            _ => None,
        },
    }
}

fn lookup_mut<'a>(
    map: &'a mut BTreeMap<String, Property>,
    path: &str,
) -> Option<&'a mut Property> {
    match path.split_once('.') {
        None => map.get_mut(path),
        Some((head, rest)) => match map.get_mut(head)? {
            Property::Embedded(inner) => lookup_mut(inner, rest),
            _ => None,
        },
    }
}

fn insert_at(map: &mut BTreeMap<String, Property>, path: &str, property: Property) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), property);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Property::Embedded(BTreeMap::new()));
            if !matches!(slot, Property::Embedded(_)) {
                *slot = Property::Embedded(BTreeMap::new());
            }
            if let Property::Embedded(inner) = slot {
                insert_at(inner, rest, property);
            }
        }
    }
}

/// Address-based identity of an [`EntityRef`].
pub type EntityKey = usize;

/// Shared, mutable handle to an [`Entity`].
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Lock for reading. A poisoned lock still yields the entity.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identity of the underlying allocation.
    pub fn key(&self) -> EntityKey {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn type_name(&self) -> String {
        self.read().type_name().to_string()
    }

    /// Cloned column value at `path`.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.read().value(path).cloned()
    }

    pub fn set(&self, path: &str, value: impl Into<Value>) {
        self.write().set(path, value);
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        EntityRef::new(entity)
    }
}

impl fmt::Debug for EntityRef {
    // Graphs may be cyclic, so only the type and address are printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(entity) => write!(f, "EntityRef({}@{:#x})", entity.type_name(), self.key()),
            Err(_) => write!(f, "EntityRef(<locked>@{:#x})", self.key()),
        }
    }
}
