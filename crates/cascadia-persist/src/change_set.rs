//! Change-set computation.
//!
//! Classifies every subject (insert, update, delete, soft delete, recover or
//! unchanged) and derives exactly what must be written: the column values,
//! the foreign keys that wait on another subject's generated key, and the
//! junction rows to add or remove.
//!
//! Unset properties are never written. A property explicitly set to NULL is
//! a change like any other.

use crate::config::{PREFETCH_CHUNK, PersistOptions};
use crate::subject::{
    Endpoint, FkBinding, JunctionLink, JunctionRemoval, Operation, OperationKind, SubjectGraph,
    SubjectId, identifier_of,
};
use cascadia_core::{
    CascadeError, ColumnRole, ConfigError, Driver, Entity, EntityMetadata, EntityRef, Error,
    Identifier, JunctionInfo, JunctionSide, OrphanAction, Predicate, RelationKind,
    RelationMetadata, Registry, ResolutionError, Result, SqlType, ValidationError,
    ValidationErrorKind, Value,
};
use asupersync::{Cx, Outcome};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Column values and key bindings derived for one subject.
#[derive(Debug, Default)]
pub(crate) struct ColumnChanges {
    pub changed: Vec<(String, Value)>,
    pub bindings: Vec<FkBinding>,
    pub previous_version: Option<Value>,
}

/// Where an owning to-one relation points.
enum Target {
    Cleared,
    Subject(SubjectId),
    Detached(EntityRef),
}

/// Entity state copied out under a single read lock.
struct Snapshot {
    values: HashMap<String, Value>,
    /// Owning to-one relations that are set; `None` means cleared.
    references: HashMap<String, Option<EntityRef>>,
}

impl Snapshot {
    fn take(metadata: &EntityMetadata, entity: &EntityRef) -> Self {
        let guard = entity.read();
        let values = metadata
            .columns
            .iter()
            .filter_map(|c| {
                guard
                    .value(&c.property_path)
                    .map(|v| (c.property_path.clone(), v.clone()))
            })
            .collect();
        let references = metadata
            .relations
            .iter()
            .filter(|r| r.is_owner() && !r.kind.is_to_many())
            .filter_map(|r| {
                guard
                    .reference(&r.property)
                    .map(|target| (r.property.clone(), target.cloned()))
            })
            .collect();
        Self { values, references }
    }
}

/// Computes the change set of a walked [`SubjectGraph`].
pub struct ChangeSetComputer<'a> {
    registry: &'a Registry,
    operation: Operation,
    options: &'a PersistOptions,
    now: i64,
}

impl<'a> ChangeSetComputer<'a> {
    pub fn new(
        registry: &'a Registry,
        operation: Operation,
        options: &'a PersistOptions,
        now: i64,
    ) -> Self {
        Self {
            registry,
            operation,
            options,
            now,
        }
    }

    /// Read identifiers and baselines off the entities.
    pub fn resolve(&self, graph: &mut SubjectGraph) {
        for subject in &mut graph.subjects {
            subject.identifier = identifier_of(&subject.metadata, &subject.entity);
            let baseline = subject.entity.read().baseline().cloned();
            if let Some(baseline) = baseline {
                subject.adopt_baseline(&baseline);
            }
        }
    }

    /// Whether any subject needs its persisted state looked up.
    pub fn needs_prefetch(&self, graph: &SubjectGraph) -> bool {
        self.operation == Operation::Save
            && self.options.prefetch
            && graph.iter().any(wants_prefetch)
    }

    /// Classify every subject and compute its writes.
    #[tracing::instrument(level = "debug", skip_all, fields(subjects = graph.len()))]
    pub fn compute(&self, graph: &mut SubjectGraph) -> Result<()> {
        if self.operation == Operation::Save {
            self.classify_for_save(graph);
            let walked = graph.len();
            for id in 0..walked {
                self.compute_columns(graph, id)?;
            }
            self.compute_junctions(graph)?;
            self.collect_orphans(graph, walked)?;
        } else {
            for id in 0..graph.len() {
                self.compute_removal(graph, id)?;
            }
        }

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for subject in graph.iter() {
            *counts.entry(kind_name(subject.kind)).or_default() += 1;
        }
        tracing::debug!(operation = self.operation.as_str(), counts = ?counts, "Change set computed");
        Ok(())
    }

    /// Recompute a subject's column changes, e.g. after a before-hook
    /// modified the entity. Deferred bindings stay deferred.
    pub(crate) fn refresh(&self, graph: &mut SubjectGraph, id: SubjectId) -> Result<()> {
        let subject = graph.get(id);
        if subject.orphan || !matches!(subject.kind, OperationKind::Insert | OperationKind::Update) {
            return Ok(());
        }
        let changes = self.column_changes(graph, id)?;
        let subject = graph.get_mut(id);
        let deferred: Vec<String> = subject
            .bindings
            .iter()
            .filter(|b| b.deferred)
            .map(|b| b.relation.clone())
            .collect();
        subject.changed_columns = changes.changed;
        subject.bindings = changes.bindings;
        for binding in &mut subject.bindings {
            binding.deferred = deferred.contains(&binding.relation);
        }
        subject.previous_version = changes.previous_version;
        tracing::trace!(subject = %subject, changed = subject.changed_columns.len(), "Refreshed changes");
        Ok(())
    }

    fn classify_for_save(&self, graph: &mut SubjectGraph) {
        for subject in &mut graph.subjects {
            if subject.can_insert || subject.can_update {
                subject.fk_only = false;
            }
            let may_update = subject.can_update || subject.fk_only;
            subject.kind = match &subject.identifier {
                None if subject.can_insert => OperationKind::Insert,
                None => OperationKind::Unchanged,
                // Persisted, or unknown because lookups are disabled.
                Some(_) if subject.database_entity.is_some() || !subject.fetched => {
                    if may_update {
                        OperationKind::Update
                    } else {
                        OperationKind::Unchanged
                    }
                }
                Some(_) if subject.can_insert => OperationKind::Insert,
                Some(_) => OperationKind::Unchanged,
            };
        }
    }

    fn compute_columns(&self, graph: &mut SubjectGraph, id: SubjectId) -> Result<()> {
        let kind = graph.get(id).kind;
        if !matches!(kind, OperationKind::Insert | OperationKind::Update) {
            return Ok(());
        }
        let changes = self.column_changes(graph, id)?;
        let subject = graph.get_mut(id);
        subject.changed_columns = changes.changed;
        subject.bindings = changes.bindings;
        subject.previous_version = changes.previous_version;
        if kind == OperationKind::Update
            && subject.changed_columns.is_empty()
            && subject.bindings.is_empty()
        {
            subject.kind = OperationKind::Unchanged;
        }
        Ok(())
    }

    pub(crate) fn column_changes(&self, graph: &SubjectGraph, id: SubjectId) -> Result<ColumnChanges> {
        let subject = graph.get(id);
        let metadata = &subject.metadata;
        let snapshot = Snapshot::take(metadata, &subject.entity);

        let mut candidates: Vec<(String, Value)> = Vec::new();
        let mut bindings = Vec::new();
        let mut handled: HashSet<&str> = HashSet::new();

        for relation in metadata
            .relations
            .iter()
            .filter(|r| r.is_owner() && !r.kind.is_to_many())
        {
            let overridden = subject
                .overrides
                .iter()
                .rev()
                .find(|(name, _)| *name == relation.property);
            if subject.fk_only && overridden.is_none() {
                continue;
            }
            let target = match overridden {
                Some((_, Some(parent))) => Target::Subject(*parent),
                Some((_, None)) => Target::Cleared,
                None => match snapshot.references.get(&relation.property) {
                    None => continue,
                    Some(None) => Target::Cleared,
                    Some(Some(entity)) => match graph.find(entity) {
                        Some(t) => Target::Subject(t),
                        None => Target::Detached(entity.clone()),
                    },
                },
            };
            handled.extend(relation.join_columns.iter().map(String::as_str));

            let target_meta = self.registry.metadata(&relation.target)?;
            let pairs: Vec<(String, String)> = relation
                .join_columns
                .iter()
                .cloned()
                .zip(target_meta.primary_columns().map(|c| c.column_name.clone()))
                .collect();

            let identifier = match target {
                Target::Cleared => {
                    candidates.extend(pairs.into_iter().map(|(c, _)| (c, Value::Null)));
                    continue;
                }
                Target::Subject(t) if graph.get(t).kind == OperationKind::Insert => {
                    bindings.push(FkBinding {
                        relation: relation.property.clone(),
                        target: t,
                        columns: pairs,
                        nullable: relation.nullable,
                        deferred: false,
                    });
                    continue;
                }
                Target::Subject(t) => graph.get(t).identifier.clone().ok_or_else(|| {
                    Error::IdentifierResolution(ResolutionError {
                        entity: metadata.name.clone(),
                        relation: relation.property.clone(),
                        target: relation.target.clone(),
                    })
                })?,
                Target::Detached(entity) => identifier_of(target_meta, &entity).ok_or_else(|| {
                    Error::CascadeNotAllowed(CascadeError {
                        entity: metadata.name.clone(),
                        relation: relation.property.clone(),
                        target: relation.target.clone(),
                    })
                })?,
            };
            for (column, referenced) in pairs {
                let value = identifier.get(&referenced).cloned().unwrap_or(Value::Null);
                candidates.push((column, value));
            }
        }

        if !subject.fk_only {
            for column in &metadata.columns {
                if handled.contains(column.column_name.as_str()) {
                    continue;
                }
                if let Some(value) = snapshot.values.get(&column.property_path) {
                    candidates.push((column.column_name.clone(), value.clone()));
                }
            }
        }

        if subject.kind == OperationKind::Insert {
            return Ok(self.insert_changes(metadata, candidates, bindings));
        }

        let database = subject.database_entity.as_ref();
        let mut changed: Vec<(String, Value)> = candidates
            .into_iter()
            .filter(|(column, value)| {
                let Some(meta) = metadata.column_named(column) else {
                    return false;
                };
                !meta.primary
                    && meta.role != Some(ColumnRole::Version)
                    && !matches!(value, Value::Default)
                    && database.is_none_or(|db| db.get(column).is_none_or(|old| !old.same_as(value)))
            })
            .collect();

        let mut previous_version = None;
        if !changed.is_empty() || !bindings.is_empty() {
            if let Some(version) = metadata.version_column() {
                let current = snapshot
                    .values
                    .get(&version.property_path)
                    .or_else(|| database.and_then(|db| db.get(&version.column_name)))
                    .filter(|v| !v.is_null())
                    .cloned();
                let next = match &current {
                    Some(v) => v.incremented().ok_or_else(|| {
                        Error::Custom(format!(
                            "{}.{} holds {} which cannot be incremented",
                            metadata.name, version.property_path, v
                        ))
                    })?,
                    None => one(version.sql_type),
                };
                changed.push((version.column_name.clone(), next));
                previous_version = current;
            }
            if let Some(updated) = metadata.column_with_role(ColumnRole::UpdateDate) {
                if !changed.iter().any(|(c, _)| *c == updated.column_name) {
                    changed.push((updated.column_name.clone(), Value::Timestamp(self.now)));
                }
            }
        }

        Ok(ColumnChanges {
            changed,
            bindings,
            previous_version,
        })
    }

    fn insert_changes(
        &self,
        metadata: &EntityMetadata,
        mut changed: Vec<(String, Value)>,
        bindings: Vec<FkBinding>,
    ) -> ColumnChanges {
        for column in &metadata.columns {
            let Some(role) = column.role else {
                continue;
            };
            if changed.iter().any(|(c, v)| *c == column.column_name && !v.is_null()) {
                continue;
            }
            let value = match role {
                ColumnRole::Version => one(column.sql_type),
                ColumnRole::CreateDate | ColumnRole::UpdateDate => Value::Timestamp(self.now),
                ColumnRole::DeleteDate => continue,
            };
            changed.retain(|(c, _)| *c != column.column_name);
            changed.push((column.column_name.clone(), value));
        }
        ColumnChanges {
            changed,
            bindings,
            previous_version: None,
        }
    }

    fn compute_removal(&self, graph: &mut SubjectGraph, id: SubjectId) -> Result<()> {
        let metadata = graph.get(id).metadata.clone();
        let delete_date = metadata.delete_date_column();
        if matches!(self.operation, Operation::SoftRemove | Operation::Recover) && delete_date.is_none() {
            return Err(Error::Config(ConfigError::new(format!(
                "{} has no delete date column and cannot be soft removed or recovered",
                metadata.name
            ))));
        }

        let subject = graph.get_mut(id);
        if subject.identifier.is_none() {
            if subject.root {
                let mut errors = ValidationError::new();
                errors.add(
                    metadata.name.as_str(),
                    ValidationErrorKind::Custom,
                    format!("cannot {} an entity that was never persisted", self.operation.as_str()),
                );
                return Err(Error::Validation(errors));
            }
            subject.kind = OperationKind::Unchanged;
            return Ok(());
        }

        subject.kind = match (self.operation, delete_date) {
            (Operation::Recover, _) => OperationKind::Recover,
            (Operation::Remove, Some(_)) if !self.options.permanent => OperationKind::SoftDelete,
            (Operation::Remove, _) => OperationKind::Delete,
            _ => OperationKind::SoftDelete,
        };

        match (subject.kind, delete_date) {
            (OperationKind::SoftDelete, Some(column)) => {
                subject.changed_columns = vec![(column.column_name.clone(), Value::Timestamp(self.now))];
            }
            (OperationKind::Recover, Some(column)) => {
                subject.changed_columns = vec![(column.column_name.clone(), Value::Null)];
            }
            _ => {
                if let Some(version) = metadata.version_column() {
                    let current = subject
                        .entity
                        .get(&version.property_path)
                        .or_else(|| {
                            subject
                                .database_entity
                                .as_ref()
                                .and_then(|db| db.get(&version.column_name).cloned())
                        })
                        .filter(|v| !v.is_null());
                    subject.previous_version = current;
                }
                subject.junction_removes = clear_junctions(self.registry, &metadata.name);
            }
        }
        Ok(())
    }

    fn compute_junctions(&self, graph: &mut SubjectGraph) -> Result<()> {
        let mut seen_inserts = HashSet::new();
        let mut seen_removes = HashSet::new();
        for id in 0..graph.len() {
            let (inserts, removes) =
                self.junction_changes(graph, id, &mut seen_inserts, &mut seen_removes)?;
            let subject = graph.get_mut(id);
            subject.junction_inserts.extend(inserts);
            subject.junction_removes.extend(removes);
        }
        Ok(())
    }

    /// Junction rows to add and remove for one subject's collections.
    ///
    /// A new subject links every item. An existing subject is diffed against
    /// its loaded baseline; without one the collection is left alone.
    fn junction_changes(
        &self,
        graph: &SubjectGraph,
        id: SubjectId,
        seen_inserts: &mut HashSet<LinkKey>,
        seen_removes: &mut HashSet<LinkKey>,
    ) -> Result<(Vec<JunctionLink>, Vec<JunctionRemoval>)> {
        let subject = graph.get(id);
        let is_new = subject.kind == OperationKind::Insert;
        let mut inserts = Vec::new();
        let mut removes = Vec::new();
        if subject.fk_only || subject.orphan || (!is_new && !subject.can_update) {
            return Ok((inserts, removes));
        }

        for relation in subject
            .metadata
            .relations
            .iter()
            .filter(|r| r.kind == RelationKind::ManyToMany)
        {
            let Some((info, side)) = self.registry.junction_for(subject.type_name(), &relation.property) else {
                continue;
            };
            let items = subject
                .entity
                .read()
                .references(&relation.property)
                .map(<[EntityRef]>::to_vec);
            let Some(items) = items else {
                continue;
            };
            let loaded = if is_new {
                None
            } else {
                match subject
                    .loaded_relations
                    .as_ref()
                    .and_then(|l| l.get(&relation.property))
                {
                    Some(loaded) => Some(loaded),
                    None => continue,
                }
            };

            let target_meta = self.registry.metadata(&relation.target)?;
            let mut current: Vec<Identifier> = Vec::new();
            for item in &items {
                let (endpoint, identifier) = match graph.find(item) {
                    Some(t) => (Endpoint::Subject(t), graph.get(t).identifier.clone()),
                    None => {
                        let identifier = identifier_of(target_meta, item).ok_or_else(|| {
                            Error::CascadeNotAllowed(CascadeError {
                                entity: subject.type_name().to_string(),
                                relation: relation.property.clone(),
                                target: relation.target.clone(),
                            })
                        })?;
                        (Endpoint::Fixed(identifier.clone()), Some(identifier))
                    }
                };
                let linked = match (loaded, &identifier) {
                    (Some(loaded), Some(identifier)) => loaded.iter().any(|l| l.same_as(identifier)),
                    _ => false,
                };
                current.extend(identifier);
                if linked {
                    continue;
                }
                let link = orient(info, side, Endpoint::Subject(id), endpoint);
                if seen_inserts.insert(link_key(&link)) {
                    inserts.push(link);
                }
            }

            for old in loaded.into_iter().flatten() {
                if current.iter().any(|c| c.same_as(old)) {
                    continue;
                }
                let endpoint = graph
                    .find_by_identifier(&relation.target, old)
                    .map_or_else(|| Endpoint::Fixed(old.clone()), Endpoint::Subject);
                let link = orient(info, side, Endpoint::Subject(id), endpoint);
                if seen_removes.insert(link_key(&link)) {
                    removes.push(JunctionRemoval::Link(link));
                }
            }
        }
        Ok((inserts, removes))
    }

    /// Children dropped from a loaded one-to-many collection.
    fn collect_orphans(&self, graph: &mut SubjectGraph, walked: usize) -> Result<()> {
        for id in 0..walked {
            let subject = graph.get(id);
            if subject.kind == OperationKind::Insert || subject.fk_only || !subject.can_update {
                continue;
            }
            let Some(loaded) = subject.loaded_relations.clone() else {
                continue;
            };
            let metadata = subject.metadata.clone();
            let entity = subject.entity.clone();

            for relation in metadata
                .relations
                .iter()
                .filter(|r| r.kind == RelationKind::OneToMany && r.orphan != OrphanAction::Disable)
            {
                let Some(before) = loaded.get(&relation.property) else {
                    continue;
                };
                let items = entity
                    .read()
                    .references(&relation.property)
                    .map(<[EntityRef]>::to_vec);
                let Some(items) = items else {
                    continue;
                };
                let target_meta = self.registry.metadata(&relation.target)?.clone();
                let current: Vec<Identifier> = items
                    .iter()
                    .filter_map(|item| match graph.find(item) {
                        Some(t) => graph.get(t).identifier.clone(),
                        None => identifier_of(&target_meta, item),
                    })
                    .collect();
                for old in before {
                    if current.iter().any(|c| c.same_as(old))
                        || graph.find_by_identifier(&relation.target, old).is_some()
                    {
                        continue;
                    }
                    self.add_orphan(graph, &target_meta, relation, old)?;
                }
            }
        }
        Ok(())
    }

    fn add_orphan(
        &self,
        graph: &mut SubjectGraph,
        target_meta: &Arc<EntityMetadata>,
        relation: &RelationMetadata,
        identifier: &Identifier,
    ) -> Result<()> {
        let mut entity = Entity::new(target_meta.name.as_str());
        for (column, value) in identifier.parts() {
            if let Some(meta) = target_meta.column_named(column) {
                entity.set(&meta.property_path, value.clone());
            }
        }
        let handle = EntityRef::new(entity);
        let (id, _) = graph.insert(target_meta.clone(), &handle);
        let subject = graph.get_mut(id);
        subject.identifier = Some(identifier.clone());
        subject.orphan = true;

        match relation.orphan {
            OrphanAction::Delete => {
                subject.kind = OperationKind::Delete;
                subject.junction_removes = clear_junctions(self.registry, &target_meta.name);
            }
            OrphanAction::Nullify | OrphanAction::Disable => {
                let join_columns = relation
                    .inverse
                    .as_deref()
                    .and_then(|inverse| target_meta.relation_named(inverse))
                    .map(|r| r.join_columns.clone())
                    .unwrap_or_default();
                subject.kind = OperationKind::Update;
                subject.changed_columns = join_columns.into_iter().map(|c| (c, Value::Null)).collect();
            }
        }
        tracing::trace!(subject = %subject, action = ?relation.orphan, "Orphaned child");
        Ok(())
    }
}

/// Dedup key of a junction row: junction, owner, inverse.
type LinkKey = (usize, (usize, u64), (usize, u64));

fn link_key(link: &JunctionLink) -> LinkKey {
    (link.junction, link.owner.dedup_key(), link.inverse.dedup_key())
}

/// Put the owning entity first, whichever side the collection lives on.
fn orient(info: &JunctionInfo, side: JunctionSide, this: Endpoint, other: Endpoint) -> JunctionLink {
    let (owner, inverse) = match side {
        JunctionSide::Owner => (this, other),
        JunctionSide::Inverse => (other, this),
    };
    JunctionLink {
        junction: info.id,
        owner,
        inverse,
    }
}

fn clear_junctions(registry: &Registry, type_name: &str) -> Vec<JunctionRemoval> {
    registry
        .junctions_touching(type_name)
        .map(|(info, side)| JunctionRemoval::All {
            junction: info.id,
            side,
        })
        .collect()
}

fn one(sql_type: SqlType) -> Value {
    match sql_type {
        SqlType::Integer => Value::Int(1),
        _ => Value::BigInt(1),
    }
}

const fn kind_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Insert => "insert",
        OperationKind::Update => "update",
        OperationKind::Delete => "delete",
        OperationKind::SoftDelete => "soft_delete",
        OperationKind::Recover => "recover",
        OperationKind::Unchanged => "unchanged",
    }
}

fn wants_prefetch(subject: &crate::subject::Subject) -> bool {
    subject.identifier.is_some()
        && subject.database_entity.is_none()
        && !subject.fetched
        && (subject.can_insert || subject.can_update || subject.fk_only)
}

/// Look up the persisted rows of identified subjects that carry no baseline.
///
/// Issues one lookup per entity type and chunk of keys. Returns a description
/// of each statement run.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn prefetch<D: Driver>(cx: &Cx, driver: &D, graph: &mut SubjectGraph) -> Outcome<Vec<String>, Error> {
    let mut groups: Vec<(Arc<EntityMetadata>, Vec<SubjectId>)> = Vec::new();
    for subject in graph.iter().filter(|s| wants_prefetch(s)) {
        match groups.iter_mut().find(|(m, _)| m.name == subject.metadata.name) {
            Some((_, ids)) => ids.push(subject.id),
            None => groups.push((subject.metadata.clone(), vec![subject.id])),
        }
    }

    let mut statements = Vec::new();
    for (metadata, ids) in groups {
        for chunk in ids.chunks(PREFETCH_CHUNK) {
            let mut by_key: HashMap<u64, Vec<SubjectId>> = HashMap::new();
            let mut identifiers = Vec::with_capacity(chunk.len());
            for &id in chunk {
                if let Some(identifier) = &graph.get(id).identifier {
                    by_key.entry(identifier.hash_key()).or_default().push(id);
                    identifiers.push(identifier.clone());
                }
            }
            let predicate = Predicate::any_identifier(&identifiers);
            let rows = match driver.select_rows(cx, &metadata.table, &predicate).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            statements.push(format!("SELECT {} ({} keys)", metadata.table, identifiers.len()));

            for &id in chunk {
                graph.get_mut(id).fetched = true;
            }
            for row in rows {
                let columns: BTreeMap<String, Value> = row
                    .iter()
                    .map(|(c, v)| (c.to_string(), v.clone()))
                    .collect();
                let Some(found) = row_identifier(&metadata, &columns) else {
                    continue;
                };
                for &id in by_key.get(&found.hash_key()).into_iter().flatten() {
                    let subject = graph.get_mut(id);
                    if subject.identifier.as_ref().is_some_and(|i| i.same_as(&found)) {
                        subject.database_entity = Some(columns.clone());
                    }
                }
            }
            tracing::trace!(entity = %metadata.name, keys = chunk.len(), "Prefetched rows");
        }
    }
    Outcome::Ok(statements)
}

/// Primary key of a fetched row.
pub(crate) fn row_identifier(metadata: &EntityMetadata, columns: &BTreeMap<String, Value>) -> Option<Identifier> {
    let mut parts = Vec::new();
    for column in metadata.primary_columns() {
        let value = columns.get(&column.column_name)?;
        parts.push((column.column_name.clone(), value.clone()));
    }
    Some(Identifier::new(parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blog, fixed_clock};
    use crate::walker::GraphWalker;
    use cascadia_core::Baseline;

    fn computed(registry: &Registry, operation: Operation, options: &PersistOptions, roots: &[EntityRef]) -> Result<SubjectGraph> {
        let mut graph = GraphWalker::new(registry, operation).walk(roots)?;
        let computer = ChangeSetComputer::new(registry, operation, options, fixed_clock());
        computer.resolve(&mut graph);
        computer.compute(&mut graph)?;
        Ok(graph)
    }

    fn persisted(entity: Entity, columns: &[(&str, Value)]) -> EntityRef {
        let mut entity = entity;
        for (c, v) in columns {
            entity.set(c, v.clone());
        }
        entity.set_baseline(Some(Baseline {
            columns: columns.iter().map(|(c, v)| ((*c).to_string(), v.clone())).collect(),
            relations: BTreeMap::new(),
        }));
        EntityRef::new(entity)
    }

    #[test]
    fn new_entities_insert_with_bindings() {
        let registry = blog();
        let category = EntityRef::new(Entity::new("Category").with("name", "News"));
        let post = EntityRef::new(
            Entity::new("Post")
                .with("title", "Hi")
                .with_ref("category", Some(category.clone())),
        );
        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post.clone()]).unwrap();

        let post = graph.get(graph.find(&post).unwrap());
        assert_eq!(post.kind, OperationKind::Insert);
        assert_eq!(post.bindings.len(), 1);
        assert_eq!(post.bindings[0].columns, vec![("category_id".to_string(), "id".to_string())]);
        assert!(post.changed_columns.contains(&("version".to_string(), Value::BigInt(1))));
        assert!(post.changed_columns.contains(&("title".to_string(), Value::Text("Hi".into()))));
        assert_eq!(graph.get(graph.find(&category).unwrap()).kind, OperationKind::Insert);
    }

    #[test]
    fn unchanged_entity_produces_no_write() {
        let registry = blog();
        let post = persisted(
            Entity::new("Post"),
            &[("id", Value::BigInt(1)), ("title", Value::Text("x".into())), ("version", Value::BigInt(1))],
        );
        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post]).unwrap();
        assert_eq!(graph.get(0).kind, OperationKind::Unchanged);
        assert!(graph.get(0).changed_columns.is_empty());
    }

    #[test]
    fn explicit_null_is_a_change_but_unset_is_not() {
        let registry = blog();
        let post = persisted(
            Entity::new("Post"),
            &[("id", Value::BigInt(1)), ("title", Value::Text("x".into())), ("version", Value::BigInt(3))],
        );
        post.set("title", Value::Null);
        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post.clone()]).unwrap();
        let subject = graph.get(0);
        assert_eq!(subject.kind, OperationKind::Update);
        assert_eq!(
            subject.changed_columns,
            vec![("title".to_string(), Value::Null), ("version".to_string(), Value::BigInt(4))]
        );
        assert_eq!(subject.previous_version, Some(Value::BigInt(3)));

        post.write().unset("title");
        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post]).unwrap();
        assert_eq!(graph.get(0).kind, OperationKind::Unchanged);
    }

    #[test]
    fn many_to_many_without_loaded_baseline_is_left_alone() {
        let registry = blog();
        let tag = EntityRef::new(Entity::new("Tag").with("id", 9_i64));
        let post = persisted(Entity::new("Post"), &[("id", Value::BigInt(1)), ("version", Value::BigInt(1))]);
        post.write().set_refs("tags", vec![tag.clone()]);

        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post.clone()]).unwrap();
        assert!(graph.get(0).junction_inserts.is_empty());

        let mut baseline = post.read().baseline().cloned().unwrap();
        baseline.relations.insert("tags".into(), vec![Identifier::single("id", 4_i64)]);
        post.write().set_baseline(Some(baseline));
        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post]).unwrap();
        let subject = graph.get(0);
        assert_eq!(subject.junction_inserts.len(), 1);
        assert_eq!(subject.junction_removes.len(), 1);
        assert!(matches!(
            &subject.junction_removes[0],
            JunctionRemoval::Link(JunctionLink { inverse: Endpoint::Fixed(id), .. }) if id.get("id") == Some(&Value::BigInt(4))
        ));
    }

    #[test]
    fn links_from_both_sides_are_deduplicated() {
        let registry = blog();
        let tag = EntityRef::new(Entity::new("Tag").with("label", "rust"));
        let post = EntityRef::new(Entity::new("Post").with_refs("tags", vec![tag.clone()]));
        tag.write().set_refs("posts", vec![post.clone()]);

        // Both roots, so neither relation needs to cascade.
        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post, tag]).unwrap();
        let links: usize = graph.iter().map(|s| s.junction_inserts.len()).sum();
        assert_eq!(links, 1);
        let link = &graph.get(0).junction_inserts[0];
        assert!(matches!((&link.owner, &link.inverse), (Endpoint::Subject(0), Endpoint::Subject(1))));
    }

    #[test]
    fn removal_kinds() {
        let registry = blog();
        let post = EntityRef::new(Entity::new("Post").with("id", 2_i64).with("version", 5_i64));
        let graph = computed(&registry, Operation::Remove, &PersistOptions::default(), &[post.clone()]).unwrap();
        let subject = graph.get(0);
        assert_eq!(subject.kind, OperationKind::Delete);
        assert_eq!(subject.previous_version, Some(Value::BigInt(5)));
        assert_eq!(subject.junction_removes.len(), 1);

        let err = computed(&registry, Operation::SoftRemove, &PersistOptions::default(), &[post]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let fresh = EntityRef::new(Entity::new("Post"));
        let err = computed(&registry, Operation::Remove, &PersistOptions::default(), &[fresh]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn dropped_children_become_orphans() {
        let registry = blog();
        let kept = persisted(Entity::new("Comment"), &[("id", Value::BigInt(1)), ("post_id", Value::BigInt(7))]);
        let post = persisted(Entity::new("Post"), &[("id", Value::BigInt(7)), ("version", Value::BigInt(1))]);
        let mut baseline = post.read().baseline().cloned().unwrap();
        baseline.relations.insert(
            "comments".into(),
            vec![Identifier::single("id", 1_i64), Identifier::single("id", 2_i64)],
        );
        post.write().set_baseline(Some(baseline));
        post.write().set_refs("comments", vec![kept]);

        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[post]).unwrap();
        let orphan = graph.iter().find(|s| s.orphan).unwrap();
        assert_eq!(orphan.kind, OperationKind::Delete);
        assert_eq!(orphan.identifier, Some(Identifier::single("id", 2_i64)));
        assert_eq!(graph.iter().filter(|s| s.orphan).count(), 1);
    }

    #[test]
    fn clock_stamps_dates() {
        let registry = Registry::builder()
            .entity(
                EntityMetadata::new("Note", "notes")
                    .column(cascadia_core::ColumnMetadata::increment_id("id"))
                    .column(cascadia_core::ColumnMetadata::new("created", SqlType::Timestamp).create_date())
                    .column(cascadia_core::ColumnMetadata::new("deleted", SqlType::Timestamp).delete_date()),
            )
            .build()
            .unwrap();
        let note = EntityRef::new(Entity::new("Note"));
        let graph = computed(&registry, Operation::Save, &PersistOptions::default(), &[note.clone()]).unwrap();
        assert_eq!(
            graph.get(0).changed_columns,
            vec![("created".to_string(), Value::Timestamp(fixed_clock()))]
        );

        note.set("id", 1_i64);
        let graph = computed(&registry, Operation::Remove, &PersistOptions::default(), &[note.clone()]).unwrap();
        assert_eq!(graph.get(0).kind, OperationKind::SoftDelete);
        let graph = computed(&registry, Operation::Remove, &PersistOptions::default().permanent(true), &[note]).unwrap();
        assert_eq!(graph.get(0).kind, OperationKind::Delete);
    }
}
