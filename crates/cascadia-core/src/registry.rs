//! The metadata registry.
//!
//! A [`Registry`] is built once at startup from [`EntityMetadata`] values and
//! shared read-only (usually behind an `Arc`) by every persistence call. The
//! builder validates cross-entity references and precomputes the lookups the
//! engine needs on its hot path: subscribers per entity type and the junction
//! tables touching each type.

use crate::entity::{Entity, EntityRef, Property};
use crate::error::{ConfigError, Error, Result, ValidationError, ValidationErrorKind};
use crate::events::EntitySubscriber;
use crate::metadata::{
    ColumnRole, EntityMetadata, JunctionDescriptor, RelationKind, RelationMetadata, SqlType,
};
use crate::value::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Which end of a junction an entity sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JunctionSide {
    Owner,
    Inverse,
}

/// A junction table together with the entity types it links.
#[derive(Debug, Clone)]
pub struct JunctionInfo {
    /// Position in [`Registry::junctions`].
    pub id: usize,
    pub descriptor: JunctionDescriptor,
    /// Entity type declaring the junction.
    pub owner: String,
    pub owner_relation: String,
    /// Entity type on the other end.
    pub inverse: String,
    /// Relation on the inverse type mirroring this one, if declared.
    pub inverse_relation: Option<String>,
}

impl JunctionInfo {
    /// Junction columns for the given side.
    pub fn columns(&self, side: JunctionSide) -> &[String] {
        match side {
            JunctionSide::Owner => &self.descriptor.owner_columns,
            JunctionSide::Inverse => &self.descriptor.inverse_columns,
        }
    }
}

/// Builder for [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    entities: Vec<EntityMetadata>,
    subscribers: Vec<Arc<dyn EntitySubscriber>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, metadata: EntityMetadata) -> Self {
        self.entities.push(metadata);
        self
    }

    pub fn subscriber(mut self, subscriber: Arc<dyn EntitySubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Validate the metadata and freeze it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn build(mut self) -> Result<Registry> {
        let mut index = HashMap::new();
        for (i, meta) in self.entities.iter().enumerate() {
            if index.insert(meta.name.clone(), i).is_some() {
                return Err(config(format!("entity type {} registered twice", meta.name)));
            }
        }

        for meta in &self.entities {
            validate_columns(meta)?;
        }

        // Relation nullability derives from the owner's join columns.
        let mut nullability = Vec::new();
        for (ei, meta) in self.entities.iter().enumerate() {
            for (ri, rel) in meta.relations.iter().enumerate() {
                let target = index
                    .get(&rel.target)
                    .map(|&t| &self.entities[t])
                    .ok_or_else(|| {
                        config(format!(
                            "{}.{} targets unknown entity type {}",
                            meta.name, rel.property, rel.target
                        ))
                    })?;
                validate_relation(meta, rel, target)?;
                let nullable = rel.join_columns.iter().all(|c| {
                    meta.column_named(c).is_some_and(|col| col.nullable)
                });
                nullability.push((ei, ri, nullable));
            }
        }
        for (ei, ri, nullable) in nullability {
            self.entities[ei].relations[ri].nullable = nullable;
        }

        let mut junctions = Vec::new();
        let mut junction_index = HashMap::new();
        let mut touching: HashMap<String, Vec<(usize, JunctionSide)>> = HashMap::new();
        for meta in &self.entities {
            for rel in &meta.relations {
                let Some(descriptor) = &rel.junction else {
                    continue;
                };
                let inverse_relation = self.entities[index[&rel.target]]
                    .relations
                    .iter()
                    .find(|r| {
                        r.kind == RelationKind::ManyToMany
                            && r.target == meta.name
                            && r.inverse.as_deref() == Some(rel.property.as_str())
                    })
                    .map(|r| r.property.clone());
                let ji = junctions.len();
                junction_index.insert((meta.name.clone(), rel.property.clone()), (ji, JunctionSide::Owner));
                if let Some(inv) = &inverse_relation {
                    junction_index.insert((rel.target.clone(), inv.clone()), (ji, JunctionSide::Inverse));
                }
                touching
                    .entry(meta.name.clone())
                    .or_default()
                    .push((ji, JunctionSide::Owner));
                touching
                    .entry(rel.target.clone())
                    .or_default()
                    .push((ji, JunctionSide::Inverse));
                junctions.push(JunctionInfo {
                    id: ji,
                    descriptor: descriptor.clone(),
                    owner: meta.name.clone(),
                    owner_relation: rel.property.clone(),
                    inverse: rel.target.clone(),
                    inverse_relation,
                });
            }
        }

        let mut subscribers_by_type = HashMap::new();
        for meta in &self.entities {
            let list: Vec<_> = self
                .subscribers
                .iter()
                .filter(|s| s.listen_to().is_none_or(|t| t == meta.name))
                .cloned()
                .collect();
            subscribers_by_type.insert(meta.name.clone(), list);
        }

        tracing::debug!(
            entities = self.entities.len(),
            junctions = junctions.len(),
            subscribers = self.subscribers.len(),
            "Registry built"
        );

        Ok(Registry {
            entities: self.entities.into_iter().map(Arc::new).collect(),
            index,
            subscribers_by_type,
            junctions,
            junction_index,
            touching,
        })
    }
}

fn config(message: String) -> Error {
    Error::Config(ConfigError::new(message))
}

fn validate_columns(meta: &EntityMetadata) -> Result<()> {
    if meta.primary_columns().next().is_none() {
        return Err(config(format!("{} declares no primary key", meta.name)));
    }
    let mut seen = HashSet::new();
    for col in &meta.columns {
        if !seen.insert(col.column_name.as_str()) {
            return Err(config(format!(
                "{} maps column {} twice",
                meta.name, col.column_name
            )));
        }
        if col.primary && col.nullable {
            return Err(config(format!(
                "{}.{} is a nullable primary key",
                meta.name, col.property_path
            )));
        }
    }
    for role in [
        ColumnRole::Version,
        ColumnRole::CreateDate,
        ColumnRole::UpdateDate,
        ColumnRole::DeleteDate,
    ] {
        if meta.columns.iter().filter(|c| c.role == Some(role)).count() > 1 {
            return Err(config(format!(
                "{} declares more than one {:?} column",
                meta.name, role
            )));
        }
    }
    if let Some(version) = meta.version_column() {
        if !matches!(version.sql_type, SqlType::Integer | SqlType::BigInt) {
            return Err(config(format!(
                "{}.{} is a version column but not an integer",
                meta.name, version.property_path
            )));
        }
    }
    Ok(())
}

fn validate_relation(
    meta: &EntityMetadata,
    rel: &RelationMetadata,
    target: &EntityMetadata,
) -> Result<()> {
    let target_pk = target.primary_columns().count();
    let own_pk = meta.primary_columns().count();
    let name = format!("{}.{}", meta.name, rel.property);

    if rel.is_owner() && !rel.join_columns.is_empty() {
        if rel.join_columns.len() != target_pk {
            return Err(config(format!(
                "{name} has {} join columns but {} has a {}-column key",
                rel.join_columns.len(),
                target.name,
                target_pk
            )));
        }
        for column in &rel.join_columns {
            if meta.column_named(column).is_none() {
                return Err(config(format!(
                    "{name} joins on column {column} which {} does not declare",
                    meta.name
                )));
            }
        }
    }

    let mirror = |kinds: &[RelationKind], owner: bool| -> Result<()> {
        let inverse = rel
            .inverse
            .as_deref()
            .ok_or_else(|| config(format!("{name} needs an inverse property")))?;
        let back = target.relation_named(inverse).ok_or_else(|| {
            config(format!("{name} names missing inverse {}.{inverse}", target.name))
        })?;
        if !kinds.contains(&back.kind) || back.target != meta.name || back.is_owner() != owner {
            return Err(config(format!(
                "{name} inverse {}.{inverse} does not point back at {}",
                target.name, meta.name
            )));
        }
        Ok(())
    };

    match rel.kind {
        RelationKind::ManyToOne => {
            if rel.join_columns.is_empty() {
                return Err(config(format!("{name} declares no join column")));
            }
        }
        RelationKind::OneToMany => mirror(&[RelationKind::ManyToOne, RelationKind::OneToOne], true)?,
        RelationKind::OneToOne if !rel.is_owner() => mirror(&[RelationKind::OneToOne], true)?,
        RelationKind::OneToOne => {}
        RelationKind::ManyToMany => match &rel.junction {
            Some(junction) => {
                if junction.owner_columns.len() != own_pk
                    || junction.inverse_columns.len() != target_pk
                {
                    return Err(config(format!(
                        "{name} junction {} columns do not match the key sizes",
                        junction.table
                    )));
                }
            }
            None => mirror(&[RelationKind::ManyToMany], true)?,
        },
    }
    Ok(())
}

/// Validated, read-only entity metadata.
pub struct Registry {
    entities: Vec<Arc<EntityMetadata>>,
    index: HashMap<String, usize>,
    subscribers_by_type: HashMap<String, Vec<Arc<dyn EntitySubscriber>>>,
    junctions: Vec<JunctionInfo>,
    junction_index: HashMap<(String, String), (usize, JunctionSide)>,
    touching: HashMap<String, Vec<(usize, JunctionSide)>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("entities", &self.index.keys().collect::<Vec<_>>())
            .field("junctions", &self.junctions.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<EntityMetadata>> {
        self.index.get(name).map(|&i| &self.entities[i])
    }

    /// Metadata for `name`, or a configuration error.
    pub fn metadata(&self, name: &str) -> Result<&Arc<EntityMetadata>> {
        self.get(name)
            .ok_or_else(|| config(format!("unknown entity type {name}")))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.iter()
    }

    /// Subscribers that receive events for `name`, in registration order.
    pub fn subscribers_for(&self, name: &str) -> &[Arc<dyn EntitySubscriber>] {
        self.subscribers_by_type
            .get(name)
            .map_or(&[], Vec::as_slice)
    }

    pub fn junctions(&self) -> &[JunctionInfo] {
        &self.junctions
    }

    /// Junction behind a many-to-many relation, from either side.
    pub fn junction_for(&self, entity: &str, relation: &str) -> Option<(&JunctionInfo, JunctionSide)> {
        self.junction_index
            .get(&(entity.to_string(), relation.to_string()))
            .map(|&(i, side)| (&self.junctions[i], side))
    }

    /// All junctions with `entity` on either end.
    pub fn junctions_touching(&self, entity: &str) -> impl Iterator<Item = (&JunctionInfo, JunctionSide)> {
        self.touching
            .get(entity)
            .into_iter()
            .flatten()
            .map(|&(i, side)| (&self.junctions[i], side))
    }

    /// Check an entity's properties against its declared schema.
    pub fn bind(&self, entity: &Entity) -> Result<()> {
        let meta = self.metadata(entity.type_name())?;
        let mut errors = ValidationError::new();
        for (name, property) in entity.properties() {
            self.bind_property(meta, name, property, &mut errors);
        }
        errors.into_result().map_err(Error::Validation)
    }

    fn bind_property(
        &self,
        meta: &EntityMetadata,
        path: &str,
        property: &Property,
        errors: &mut ValidationError,
    ) {
        if let Some(rel) = meta.relation_named(path) {
            let targets: Vec<&EntityRef> = match (property, rel.kind.is_to_many()) {
                (Property::Ref(target), false) => target.iter().collect(),
                (Property::Refs(items), true) => items.iter().collect(),
                _ => {
                    let expected = if rel.kind.is_to_many() { "a collection" } else { "a single reference" };
                    errors.add(path, ValidationErrorKind::Shape, format!("relation expects {expected}"));
                    return;
                }
            };
            for target in targets {
                let type_name = target.type_name();
                if type_name != rel.target {
                    errors.add(
                        path,
                        ValidationErrorKind::TargetType,
                        format!("expected {} but got {}", rel.target, type_name),
                    );
                }
            }
            return;
        }

        if let Some(col) = meta.column_at(path) {
            match property {
                Property::Value(v) if col.sql_type.accepts(v) => {}
                Property::Value(v) => errors.add(
                    path,
                    ValidationErrorKind::Shape,
                    format!("{} cannot hold {}", col.sql_type.sql_name(), v.type_name()),
                ),
                _ => errors.add(path, ValidationErrorKind::Shape, "column expects a value"),
            }
            return;
        }

        match property {
            Property::Embedded(inner) if meta.has_embedded(path) => {
                for (name, nested) in inner {
                    self.bind_property(meta, &format!("{path}.{name}"), nested, errors);
                }
            }
            _ => errors.add(
                path,
                ValidationErrorKind::UnknownProperty,
                format!("{} declares no property {path}", meta.name),
            ),
        }
    }

    /// Build an entity graph from a plain JSON object.
    ///
    /// Nested objects become relations or embedded groups according to the
    /// metadata; scalars are coerced to their column types.
    pub fn entity_from_json(&self, type_name: &str, json: &serde_json::Value) -> Result<EntityRef> {
        let meta = self.metadata(type_name)?;
        let serde_json::Value::Object(map) = json else {
            let mut errors = ValidationError::new();
            errors.add(type_name, ValidationErrorKind::Shape, "expected a JSON object");
            return Err(Error::Validation(errors));
        };
        let mut entity = Entity::new(type_name);
        let mut errors = ValidationError::new();
        for (key, value) in map {
            match self.json_property(meta, key, value, &mut errors)? {
                Some(property) => entity.set_property(key, property),
                None => continue,
            }
        }
        errors.into_result().map_err(Error::Validation)?;
        Ok(EntityRef::new(entity))
    }

    fn json_property(
        &self,
        meta: &EntityMetadata,
        path: &str,
        value: &serde_json::Value,
        errors: &mut ValidationError,
    ) -> Result<Option<Property>> {
        if let Some(rel) = meta.relation_named(path) {
            let property = match (value, rel.kind.is_to_many()) {
                (serde_json::Value::Null, false) => Property::Ref(None),
                (serde_json::Value::Object(_), false) => {
                    Property::Ref(Some(self.entity_from_json(&rel.target, value)?))
                }
                (serde_json::Value::Array(items), true) => Property::Refs(
                    items
                        .iter()
                        .map(|item| self.entity_from_json(&rel.target, item))
                        .collect::<Result<Vec<_>>>()?,
                ),
                _ => {
                    errors.add(path, ValidationErrorKind::Shape, "unexpected JSON shape for relation");
                    return Ok(None);
                }
            };
            return Ok(Some(property));
        }

        if let Some(col) = meta.column_at(path) {
            return Ok(Some(Property::Value(col.sql_type.coerce(Value::from(value.clone())))));
        }

        if let serde_json::Value::Object(inner) = value {
            if meta.has_embedded(path) {
                let mut group = BTreeMap::new();
                for (key, nested) in inner {
                    let nested_path = format!("{path}.{key}");
                    if let Some(property) = self.json_property(meta, &nested_path, nested, errors)? {
                        group.insert(key.clone(), property);
                    }
                }
                return Ok(Some(Property::Embedded(group)));
            }
        }

        errors.add(
            path,
            ValidationErrorKind::UnknownProperty,
            format!("{} declares no property {path}", meta.name),
        );
        Ok(None)
    }
}
