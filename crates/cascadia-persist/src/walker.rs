//! Object-graph walking.
//!
//! Starting from the caller's root entities, the walker follows relations
//! according to their cascade flags and produces one subject per reachable
//! entity. Identity is the entity handle, so an entity reached along several
//! paths (or through a cycle) is visited once.

use crate::subject::{Operation, SubjectGraph, SubjectId, identifier_of};
use cascadia_core::{CascadeError, EntityRef, Error, RelationKind, RelationMetadata, Registry, Result};

/// A related entity reached without permission to insert it.
struct PendingReference {
    from: SubjectId,
    relation: String,
    target: EntityRef,
}

/// Builds the [`SubjectGraph`] for one persistence call.
pub struct GraphWalker<'r> {
    registry: &'r Registry,
    operation: Operation,
    graph: SubjectGraph,
    stack: Vec<SubjectId>,
    references: Vec<PendingReference>,
}

impl<'r> GraphWalker<'r> {
    pub fn new(registry: &'r Registry, operation: Operation) -> Self {
        Self {
            registry,
            operation,
            graph: SubjectGraph::new(),
            stack: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Walk the graph from `roots`.
    ///
    /// Fails with [`Error::CascadeNotAllowed`] when a save reaches an unsaved
    /// entity through a relation that does not cascade inserts, and with a
    /// validation error when an entity does not match its declared schema.
    #[tracing::instrument(level = "debug", skip_all, fields(roots = roots.len()))]
    pub fn walk(mut self, roots: &[EntityRef]) -> Result<SubjectGraph> {
        for root in roots {
            let id = self.reach(root, true, true)?;
            self.graph.get_mut(id).root = true;
        }

        while let Some(id) = self.stack.pop() {
            self.visit(id)?;
        }

        self.check_references()?;

        tracing::debug!(
            operation = self.operation.as_str(),
            subjects = self.graph.len(),
            "Graph walked"
        );
        Ok(self.graph)
    }

    /// Register `entity` as a subject, widening its permissions if it was
    /// already reached.
    fn reach(&mut self, entity: &EntityRef, can_insert: bool, can_update: bool) -> Result<SubjectId> {
        let metadata = self.registry.metadata(&entity.type_name())?.clone();
        let (id, created) = self.graph.insert(metadata, entity);
        if created {
            self.registry.bind(&entity.read())?;
            self.stack.push(id);
            tracing::trace!(subject = id, entity = %entity.type_name(), "Reached entity");
        }
        let subject = self.graph.get_mut(id);
        subject.can_insert |= can_insert;
        subject.can_update |= can_update;
        Ok(id)
    }

    fn visit(&mut self, id: SubjectId) -> Result<()> {
        let metadata = self.graph.get(id).metadata.clone();
        let entity = self.graph.get(id).entity.clone();

        for relation in &metadata.relations {
            let targets = related(&entity, relation);
            if targets.is_empty() {
                continue;
            }
            match self.operation {
                Operation::Save => self.visit_for_save(id, relation, targets)?,
                Operation::Remove | Operation::SoftRemove | Operation::Recover => {
                    let follows = match self.operation {
                        Operation::Remove => relation.cascade.remove,
                        Operation::SoftRemove => relation.cascade.soft_remove,
                        _ => relation.cascade.recover,
                    };
                    if follows {
                        for target in &targets {
                            self.reach(target, false, false)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_for_save(
        &mut self,
        id: SubjectId,
        relation: &RelationMetadata,
        targets: Vec<EntityRef>,
    ) -> Result<()> {
        let cascade = relation.cascade;
        let cascades = cascade.insert || cascade.update;
        let dictates_child = matches!(relation.kind, RelationKind::OneToMany)
            || (relation.kind == RelationKind::OneToOne && !relation.is_owner());

        for target in targets {
            let child = if cascades {
                let child = self.reach(&target, cascade.insert, cascade.update)?;
                if !cascade.insert {
                    self.refer(id, relation, &target);
                }
                Some(child)
            } else if dictates_child && self.is_identified(relation, &target)? {
                // The child row exists; only its foreign key may be rewritten.
                let child = self.reach(&target, false, false)?;
                self.graph.get_mut(child).fk_only = true;
                Some(child)
            } else {
                self.refer(id, relation, &target);
                None
            };

            if dictates_child {
                if let (Some(child), Some(inverse)) = (child, relation.inverse.as_ref()) {
                    self.graph
                        .get_mut(child)
                        .overrides
                        .push((inverse.clone(), Some(id)));
                }
            }
        }
        Ok(())
    }

    fn refer(&mut self, from: SubjectId, relation: &RelationMetadata, target: &EntityRef) {
        self.references.push(PendingReference {
            from,
            relation: relation.property.clone(),
            target: target.clone(),
        });
    }

    fn is_identified(&self, relation: &RelationMetadata, target: &EntityRef) -> Result<bool> {
        let metadata = self.registry.metadata(&relation.target)?;
        Ok(identifier_of(metadata, target).is_some())
    }

    /// Every referenced entity must either exist already or be inserted by
    /// this call.
    fn check_references(&self) -> Result<()> {
        for reference in &self.references {
            let insertable = self
                .graph
                .find(&reference.target)
                .is_some_and(|t| self.graph.get(t).can_insert);
            if insertable {
                continue;
            }
            let target_type = reference.target.type_name();
            let metadata = self.registry.metadata(&target_type)?;
            if identifier_of(metadata, &reference.target).is_none() {
                let from = self.graph.get(reference.from);
                return Err(Error::CascadeNotAllowed(CascadeError {
                    entity: from.type_name().to_string(),
                    relation: reference.relation.clone(),
                    target: target_type,
                }));
            }
        }
        Ok(())
    }
}

/// Entities currently held by a relation property.
fn related(entity: &EntityRef, relation: &RelationMetadata) -> Vec<EntityRef> {
    let guard = entity.read();
    if relation.kind.is_to_many() {
        guard
            .references(&relation.property)
            .map(<[EntityRef]>::to_vec)
            .unwrap_or_default()
    } else {
        guard
            .reference(&relation.property)
            .flatten()
            .cloned()
            .into_iter()
            .collect()
    }
}
