//! Dependency ordering of a change set.
//!
//! Every row write, junction write and relation update becomes a node.
//! Edges say "must run before": a referenced row is inserted before the row
//! holding the foreign key, junction rows are written after both endpoints
//! exist and removed before either is deleted, and a referencing row is
//! deleted before the row it references.
//!
//! Nodes are scheduled in layers with Kahn's algorithm. Within a layer they
//! are sorted by operation kind, then by the order their entity type first
//! appeared, and only then by discovery order. This is not pure discovery
//! order: roots `[Post, Tag, Post]` run as `Post, Post, Tag`, so that
//! same-type writes sit next to each other and share one statement. Nodes
//! in a layer never depend on each other, so the regrouping cannot break a
//! dependency.
//!
//! When no node is ready the remaining graph contains a cycle. The cycle is
//! broken at an edge whose foreign key is nullable: the row is written with
//! NULL and a relation update sets the key once both rows exist. A cycle of
//! mandatory keys is an error. A new row referencing itself is the
//! one-node case of the same rule and is handled while the graph is built.

use crate::subject::{
    Endpoint, FkBinding, JunctionRemoval, OperationKind, RelationUpdate, SubjectGraph, SubjectId,
    identifier_of,
};
use cascadia_core::{
    CycleError, EntityMetadata, Error, Identifier, Registry, RelationMetadata, Result, Value,
};
use std::collections::{HashMap, HashSet};

/// One scheduled unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// The subject's own row write, per its [`OperationKind`].
    Write(SubjectId),
    JunctionInsert { subject: SubjectId, index: usize },
    JunctionRemove { subject: SubjectId, index: usize },
    RelationUpdate { subject: SubjectId, index: usize },
}

impl Step {
    pub const fn subject(&self) -> SubjectId {
        match self {
            Step::Write(subject)
            | Step::JunctionInsert { subject, .. }
            | Step::JunctionRemove { subject, .. }
            | Step::RelationUpdate { subject, .. } => *subject,
        }
    }
}

/// Steps grouped into layers; a step only depends on earlier layers.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub layers: Vec<Vec<Step>>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(Vec::is_empty)
    }

    /// Total number of steps.
    pub fn len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.layers.iter().flatten()
    }
}

#[derive(Debug, Clone)]
enum EdgeKind {
    /// Cannot be broken.
    Fixed,
    /// Insert of a referenced row before the row binding its key.
    Binding { subject: SubjectId, binding: usize },
    /// Delete of a referencing row before the referenced row.
    DeleteReference {
        subject: SubjectId,
        relation: String,
        target: SubjectId,
        nullable: bool,
    },
}

#[derive(Debug)]
struct Edge {
    from: usize,
    to: usize,
    kind: EdgeKind,
    active: bool,
}

/// Node/edge graph under construction.
#[derive(Default)]
struct Dependencies {
    nodes: Vec<Step>,
    edges: Vec<Edge>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    indegree: Vec<usize>,
    writes: HashMap<SubjectId, usize>,
    seen: HashSet<(usize, usize)>,
}

impl Dependencies {
    fn add_node(&mut self, step: Step) -> usize {
        let node = self.nodes.len();
        self.nodes.push(step);
        self.incoming.push(Vec::new());
        self.outgoing.push(Vec::new());
        self.indegree.push(0);
        if let Step::Write(subject) = step {
            self.writes.insert(subject, node);
        }
        node
    }

    fn add_edge(&mut self, from: usize, to: usize, kind: EdgeKind) {
        // Plain duplicates add nothing; breakable edges stay distinct so
        // each can be broken on its own.
        if from == to || (matches!(kind, EdgeKind::Fixed) && !self.seen.insert((from, to))) {
            return;
        }
        let edge = self.edges.len();
        self.edges.push(Edge {
            from,
            to,
            kind,
            active: true,
        });
        self.outgoing[from].push(edge);
        self.incoming[to].push(edge);
        self.indegree[to] += 1;
    }

    fn write(&self, subject: SubjectId) -> Option<usize> {
        self.writes.get(&subject).copied()
    }
}

/// Orders a computed change set into an [`ExecutionPlan`].
pub struct DependencyOrderer<'r> {
    registry: &'r Registry,
}

impl<'r> DependencyOrderer<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    /// Build the plan. May defer nullable foreign keys into relation
    /// updates on the graph's subjects to break cycles.
    #[tracing::instrument(level = "debug", skip_all, fields(subjects = graph.len()))]
    pub fn order(&self, graph: &mut SubjectGraph) -> Result<ExecutionPlan> {
        let mut deps = self.build(graph)?;

        let mut type_rank: HashMap<&str, usize> = HashMap::new();
        let type_names: Vec<String> = graph.iter().map(|s| s.type_name().to_string()).collect();
        for name in &type_names {
            let next = type_rank.len();
            type_rank.entry(name.as_str()).or_insert(next);
        }

        let mut done = vec![false; deps.nodes.len()];
        let mut scheduled = 0;
        let mut layers = Vec::new();
        let mut ready: Vec<usize> = (0..deps.nodes.len())
            .filter(|&n| deps.indegree[n] == 0)
            .collect();
        let mut broken = 0usize;

        while scheduled < deps.nodes.len() {
            if ready.is_empty() {
                self.break_cycle(graph, &mut deps, &done)?;
                broken += 1;
                done.resize(deps.nodes.len(), false);
                ready = (0..deps.nodes.len())
                    .filter(|&n| !done[n] && deps.indegree[n] == 0)
                    .collect();
                continue;
            }

            ready.sort_by_key(|&n| {
                let step = deps.nodes[n];
                let subject = graph.get(step.subject());
                (
                    kind_rank(step, subject.kind),
                    type_rank.get(subject.type_name()).copied().unwrap_or(usize::MAX),
                    subject.id,
                    step_index(step),
                )
            });

            let mut next = Vec::new();
            for &node in &ready {
                done[node] = true;
                scheduled += 1;
                for &edge in &deps.outgoing[node] {
                    if !deps.edges[edge].active {
                        continue;
                    }
                    let to = deps.edges[edge].to;
                    deps.indegree[to] -= 1;
                    if deps.indegree[to] == 0 && !done[to] {
                        next.push(to);
                    }
                }
            }
            layers.push(ready.iter().map(|&n| deps.nodes[n]).collect());
            ready = next;
        }

        tracing::debug!(
            layers = layers.len(),
            steps = deps.nodes.len(),
            broken_cycles = broken,
            "Dependency order computed"
        );
        Ok(ExecutionPlan { layers })
    }

    fn build(&self, graph: &mut SubjectGraph) -> Result<Dependencies> {
        let mut deps = Dependencies::default();
        let mut self_references: Vec<(SubjectId, usize, usize)> = Vec::new();

        for subject in graph.pending() {
            deps.add_node(Step::Write(subject.id));
        }
        for subject in graph.iter() {
            for index in 0..subject.junction_inserts.len() {
                deps.add_node(Step::JunctionInsert {
                    subject: subject.id,
                    index,
                });
            }
            for index in 0..subject.junction_removes.len() {
                deps.add_node(Step::JunctionRemove {
                    subject: subject.id,
                    index,
                });
            }
        }

        let is_insert = |id: SubjectId| graph.get(id).kind == OperationKind::Insert;
        let is_delete = |id: SubjectId| graph.get(id).kind == OperationKind::Delete;

        for node in 0..deps.nodes.len() {
            let step = deps.nodes[node];
            match step {
                Step::Write(id) => {
                    for (index, binding) in graph.get(id).bindings.iter().enumerate() {
                        if binding.target == id {
                            if is_insert(id) {
                                self_references.push((id, index, node));
                            }
                            continue;
                        }
                        if let Some(target) = deps.write(binding.target).filter(|_| is_insert(binding.target)) {
                            deps.add_edge(
                                target,
                                node,
                                EdgeKind::Binding {
                                    subject: id,
                                    binding: index,
                                },
                            );
                        }
                    }
                }
                Step::JunctionInsert { subject, index } => {
                    let link = &graph.get(subject).junction_inserts[index];
                    for endpoint in [&link.owner, &link.inverse] {
                        if let Endpoint::Subject(e) = endpoint {
                            if let Some(write) = deps.write(*e).filter(|_| is_insert(*e)) {
                                deps.add_edge(write, node, EdgeKind::Fixed);
                            }
                        }
                    }
                }
                Step::JunctionRemove { subject, index } => {
                    match &graph.get(subject).junction_removes[index] {
                        JunctionRemoval::Link(link) => {
                            for endpoint in [&link.owner, &link.inverse] {
                                if let Endpoint::Subject(e) = endpoint {
                                    if let Some(write) = deps.write(*e).filter(|_| is_delete(*e)) {
                                        deps.add_edge(node, write, EdgeKind::Fixed);
                                    }
                                }
                            }
                        }
                        JunctionRemoval::All { .. } => {
                            if let Some(write) = deps.write(subject) {
                                deps.add_edge(node, write, EdgeKind::Fixed);
                            }
                        }
                    }
                }
                Step::RelationUpdate { .. } => {}
            }
        }

        for (subject, binding, write) in self_references {
            Self::defer_self_reference(graph, &mut deps, subject, binding, write)?;
        }

        self.add_delete_edges(graph, &mut deps);
        Ok(deps)
    }

    /// A new row pointing at itself has no key to bind yet. A nullable key
    /// is written as NULL and set by a relation update after the insert.
    fn defer_self_reference(
        graph: &mut SubjectGraph,
        deps: &mut Dependencies,
        subject: SubjectId,
        binding: usize,
        write: usize,
    ) -> Result<()> {
        let owner = graph.get_mut(subject);
        if !owner.bindings[binding].nullable {
            let entities = vec![owner.to_string()];
            tracing::warn!(entities = ?entities, "Mandatory self reference on a new row");
            return Err(Error::CyclicDependency(CycleError { entities }));
        }
        owner.bindings[binding].deferred = true;
        let deferred = owner.bindings[binding].clone();
        owner.relation_updates.push(RelationUpdate {
            binding: deferred,
            clear: false,
        });
        let index = owner.relation_updates.len() - 1;
        let update = deps.add_node(Step::RelationUpdate { subject, index });
        deps.add_edge(write, update, EdgeKind::Fixed);
        tracing::debug!(subject = %graph.get(subject), relation = %graph.get(subject).bindings[binding].relation, "Deferred self reference");
        Ok(())
    }

    /// Rows referencing a row being deleted go first: deleted themselves,
    /// or updated away from it.
    fn add_delete_edges(&self, graph: &SubjectGraph, deps: &mut Dependencies) {
        let mut deleted: HashMap<(&str, u64), Vec<SubjectId>> = HashMap::new();
        for subject in graph.pending().filter(|s| s.kind == OperationKind::Delete) {
            if let Some(identifier) = &subject.identifier {
                deleted
                    .entry((subject.type_name(), identifier.hash_key()))
                    .or_default()
                    .push(subject.id);
            }
        }
        if deleted.is_empty() {
            return;
        }
        let lookup = |type_name: &str, identifier: &Identifier| -> Option<SubjectId> {
            deleted
                .get(&(type_name, identifier.hash_key()))?
                .iter()
                .copied()
                .find(|&id| {
                    graph
                        .get(id)
                        .identifier
                        .as_ref()
                        .is_some_and(|i| i.same_as(identifier))
                })
        };

        for subject in graph.pending() {
            let Some(from) = deps.write(subject.id) else {
                continue;
            };
            for relation in subject
                .metadata
                .relations
                .iter()
                .filter(|r| r.is_owner() && !r.kind.is_to_many())
            {
                let Ok(target_meta) = self.registry.metadata(&relation.target) else {
                    continue;
                };
                let referenced = match subject.kind {
                    OperationKind::Delete => current_reference(graph, subject.id, relation, target_meta),
                    OperationKind::Update => stored_reference(graph, subject.id, &relation.join_columns, target_meta),
                    _ => None,
                };
                let Some(target) = referenced.and_then(|id| lookup(&relation.target, &id)) else {
                    continue;
                };
                if target == subject.id {
                    continue;
                }
                let Some(to) = deps.write(target) else {
                    continue;
                };
                let kind = if subject.kind == OperationKind::Delete {
                    EdgeKind::DeleteReference {
                        subject: subject.id,
                        relation: relation.property.clone(),
                        target,
                        nullable: relation.nullable,
                    }
                } else {
                    EdgeKind::Fixed
                };
                deps.add_edge(from, to, kind);
            }
        }
    }

    /// Find a cycle among the unscheduled nodes and break it at a nullable
    /// foreign key.
    fn break_cycle(&self, graph: &mut SubjectGraph, deps: &mut Dependencies, done: &[bool]) -> Result<()> {
        let cycle = find_cycle(deps, done);

        let breakable = cycle.iter().copied().find(|&e| match &deps.edges[e].kind {
            EdgeKind::Binding { subject, binding } => graph.get(*subject).bindings[*binding].nullable,
            EdgeKind::DeleteReference { nullable, .. } => *nullable,
            EdgeKind::Fixed => false,
        });

        let Some(edge) = breakable else {
            // Walked backwards; report in dependency order.
            let mut entities: Vec<String> = Vec::new();
            for &e in cycle.iter().rev() {
                let name = graph.get(deps.nodes[deps.edges[e].from].subject()).to_string();
                if entities.last() != Some(&name) && entities.first() != Some(&name) {
                    entities.push(name);
                }
            }
            tracing::warn!(entities = ?entities, "Unbreakable dependency cycle");
            return Err(Error::CyclicDependency(CycleError { entities }));
        };

        deps.edges[edge].active = false;
        let (from, to) = (deps.edges[edge].from, deps.edges[edge].to);
        deps.indegree[to] -= 1;

        match deps.edges[edge].kind.clone() {
            EdgeKind::Binding { subject, binding } => {
                let owner = graph.get_mut(subject);
                owner.bindings[binding].deferred = true;
                let deferred = owner.bindings[binding].clone();
                owner.relation_updates.push(RelationUpdate {
                    binding: deferred,
                    clear: false,
                });
                let index = owner.relation_updates.len() - 1;
                let update = deps.add_node(Step::RelationUpdate { subject, index });
                deps.add_edge(to, update, EdgeKind::Fixed);
                deps.add_edge(from, update, EdgeKind::Fixed);
                tracing::debug!(subject = %graph.get(subject), relation = %graph.get(subject).bindings[binding].relation, "Deferred foreign key to break cycle");
            }
            EdgeKind::DeleteReference {
                subject,
                relation,
                target,
                ..
            } => {
                let columns = self.relation_columns(graph, subject, &relation);
                let owner = graph.get_mut(subject);
                owner.relation_updates.push(RelationUpdate {
                    binding: FkBinding {
                        relation: relation.clone(),
                        target,
                        columns,
                        nullable: true,
                        deferred: false,
                    },
                    clear: true,
                });
                let index = owner.relation_updates.len() - 1;
                let update = deps.add_node(Step::RelationUpdate { subject, index });
                deps.add_edge(update, to, EdgeKind::Fixed);
                deps.add_edge(update, from, EdgeKind::Fixed);
                tracing::debug!(subject = %graph.get(subject), relation = %relation, "Detaching foreign key before delete to break cycle");
            }
            EdgeKind::Fixed => {}
        }
        Ok(())
    }

    fn relation_columns(&self, graph: &SubjectGraph, subject: SubjectId, relation: &str) -> Vec<(String, String)> {
        let metadata = &graph.get(subject).metadata;
        let Some(relation) = metadata.relation_named(relation) else {
            return Vec::new();
        };
        let keys: Vec<String> = self
            .registry
            .metadata(&relation.target)
            .map(|m| m.primary_columns().map(|c| c.column_name.clone()).collect())
            .unwrap_or_default();
        relation.join_columns.iter().cloned().zip(keys).collect()
    }
}

/// Walk incoming edges from an unscheduled node until one repeats. Every
/// unscheduled node has an active incoming edge from another, so this
/// always ends on a cycle. Returns the cycle's edges, walked backwards.
fn find_cycle(deps: &Dependencies, done: &[bool]) -> Vec<usize> {
    let Some(start) = (0..deps.nodes.len()).find(|&n| !done[n]) else {
        return Vec::new();
    };
    let mut position: HashMap<usize, usize> = HashMap::new();
    let mut path = Vec::new();
    let mut node = start;
    loop {
        if let Some(&at) = position.get(&node) {
            return path[at..].to_vec();
        }
        position.insert(node, path.len());
        let Some(&edge) = deps.incoming[node]
            .iter()
            .find(|&&e| deps.edges[e].active && !done[deps.edges[e].from])
        else {
            return path;
        };
        path.push(edge);
        node = deps.edges[edge].from;
    }
}

/// Key of the row a to-one relation currently points at.
fn current_reference(
    graph: &SubjectGraph,
    id: SubjectId,
    relation: &RelationMetadata,
    target_meta: &EntityMetadata,
) -> Option<Identifier> {
    let subject = graph.get(id);
    let target = subject
        .entity
        .read()
        .reference(&relation.property)
        .map(|t| t.cloned());
    match target {
        Some(Some(target)) => match graph.find(&target) {
            Some(t) => graph.get(t).identifier.clone(),
            None => identifier_of(target_meta, &target),
        },
        Some(None) => None,
        None => {
            let values: Vec<Value> = {
                let guard = subject.entity.read();
                relation
                    .join_columns
                    .iter()
                    .filter_map(|c| {
                        let path = subject.metadata.column_named(c)?.property_path.as_str();
                        guard.value(path).cloned()
                    })
                    .collect()
            };
            build_identifier(target_meta, values)
                .or_else(|| stored_reference(graph, id, &relation.join_columns, target_meta))
        }
    }
}

/// Key of the row a stored foreign key points at.
fn stored_reference(
    graph: &SubjectGraph,
    id: SubjectId,
    join_columns: &[String],
    target_meta: &EntityMetadata,
) -> Option<Identifier> {
    let stored = graph.get(id).database_entity.as_ref()?;
    let values: Vec<Value> = join_columns
        .iter()
        .filter_map(|c| stored.get(c).cloned())
        .collect();
    build_identifier(target_meta, values)
}

fn build_identifier(target_meta: &EntityMetadata, values: Vec<Value>) -> Option<Identifier> {
    let keys: Vec<String> = target_meta
        .primary_columns()
        .map(|c| c.column_name.clone())
        .collect();
    if values.len() != keys.len() || values.iter().any(Value::is_null) {
        return None;
    }
    Some(Identifier::new(keys.into_iter().zip(values).collect()))
}

const fn kind_rank(step: Step, kind: OperationKind) -> u8 {
    match step {
        Step::Write(_) => match kind {
            OperationKind::Insert => 0,
            OperationKind::Update => 1,
            OperationKind::Recover => 2,
            OperationKind::SoftDelete => 6,
            OperationKind::Delete => 7,
            OperationKind::Unchanged => 8,
        },
        Step::RelationUpdate { .. } => 3,
        Step::JunctionInsert { .. } => 4,
        Step::JunctionRemove { .. } => 5,
    }
}

const fn step_index(step: Step) -> usize {
    match step {
        Step::Write(_) => 0,
        Step::JunctionInsert { index, .. }
        | Step::JunctionRemove { index, .. }
        | Step::RelationUpdate { index, .. } => index + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_set::ChangeSetComputer;
    use crate::config::PersistOptions;
    use crate::subject::Operation;
    use crate::test_support::{blog, fixed_clock};
    use crate::walker::GraphWalker;
    use cascadia_core::{Cascade, ColumnMetadata, Entity, EntityRef, SqlType};

    fn plan(registry: &Registry, operation: Operation, roots: &[EntityRef]) -> Result<(SubjectGraph, ExecutionPlan)> {
        let mut graph = GraphWalker::new(registry, operation).walk(roots)?;
        let options = PersistOptions::default();
        let computer = ChangeSetComputer::new(registry, operation, &options, fixed_clock());
        computer.resolve(&mut graph);
        computer.compute(&mut graph)?;
        let plan = DependencyOrderer::new(registry).order(&mut graph)?;
        Ok((graph, plan))
    }

    fn position(plan: &ExecutionPlan, step: Step) -> usize {
        plan.steps().position(|s| *s == step).unwrap()
    }

    #[test]
    fn referenced_rows_insert_first() {
        let registry = blog();
        let category = EntityRef::new(Entity::new("Category").with("name", "News"));
        let tag = EntityRef::new(Entity::new("Tag").with("id", 3_i64));
        let post = EntityRef::new(
            Entity::new("Post")
                .with_ref("category", Some(category.clone()))
                .with_refs("tags", vec![tag]),
        );
        let (graph, plan) = plan(&registry, Operation::Save, &[post.clone()]).unwrap();
        let post = graph.find(&post).unwrap();
        let category = graph.find(&category).unwrap();

        assert!(position(&plan, Step::Write(category)) < position(&plan, Step::Write(post)));
        assert!(
            position(&plan, Step::Write(post))
                < position(&plan, Step::JunctionInsert { subject: post, index: 0 })
        );
        assert_eq!(plan.layers.len(), 3);
    }

    #[test]
    fn same_kind_and_type_are_adjacent() {
        let registry = blog();
        let posts: Vec<EntityRef> = (0..4)
            .map(|i| EntityRef::new(Entity::new("Post").with("title", format!("p{i}"))))
            .collect();
        let mut roots = posts.clone();
        roots.insert(2, EntityRef::new(Entity::new("Tag")));
        let (graph, plan) = plan(&registry, Operation::Save, &roots).unwrap();
        assert_eq!(plan.layers.len(), 1);
        let types: Vec<&str> = plan.layers[0]
            .iter()
            .map(|s| graph.get(s.subject()).type_name())
            .collect();
        assert_eq!(types, vec!["Post", "Post", "Post", "Post", "Tag"]);
    }

    #[test]
    fn delete_referencing_rows_first() {
        let registry = blog();
        let category = EntityRef::new(Entity::new("Category").with("id", 1_i64));
        let post = EntityRef::new(
            Entity::new("Post")
                .with("id", 5_i64)
                .with("category_id", 1_i64),
        );
        let (graph, plan) = plan(&registry, Operation::Remove, &[category.clone(), post.clone()]).unwrap();
        let category = graph.find(&category).unwrap();
        let post = graph.find(&post).unwrap();

        let order: Vec<Step> = plan.steps().copied().collect();
        assert_eq!(
            order,
            vec![
                Step::JunctionRemove { subject: post, index: 0 },
                Step::Write(post),
                Step::Write(category),
            ]
        );
    }

    fn pair_registry(nullable: bool) -> Registry {
        let fk = |name: &str| {
            let column = ColumnMetadata::new(name, SqlType::BigInt);
            if nullable { column.nullable() } else { column }
        };
        Registry::builder()
            .entity(
                EntityMetadata::new("A", "a")
                    .column(ColumnMetadata::increment_id("id"))
                    .column(fk("b_id"))
                    .relation(RelationMetadata::many_to_one("b", "B", "b_id").cascade(Cascade::SAVE)),
            )
            .entity(
                EntityMetadata::new("B", "b")
                    .column(ColumnMetadata::increment_id("id"))
                    .column(fk("a_id"))
                    .relation(RelationMetadata::many_to_one("a", "A", "a_id").cascade(Cascade::SAVE)),
            )
            .build()
            .unwrap()
    }

    fn cyclic_pair() -> (EntityRef, EntityRef) {
        let a = EntityRef::new(Entity::new("A"));
        let b = EntityRef::new(Entity::new("B").with_ref("a", Some(a.clone())));
        a.write().set_ref("b", Some(b.clone()));
        (a, b)
    }

    #[test]
    fn nullable_cycle_is_broken_with_relation_update() {
        let registry = pair_registry(true);
        let (a, _) = cyclic_pair();
        let (graph, plan) = plan(&registry, Operation::Save, &[a]).unwrap();

        let deferred: Vec<&FkBinding> = graph
            .iter()
            .flat_map(|s| s.bindings.iter().filter(|b| b.deferred))
            .collect();
        assert_eq!(deferred.len(), 1);
        let updates: Vec<Step> = plan
            .steps()
            .copied()
            .filter(|s| matches!(s, Step::RelationUpdate { .. }))
            .collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(plan.steps().last(), updates.last());
    }

    #[test]
    fn mandatory_cycle_is_rejected() {
        let registry = pair_registry(false);
        let (a, _) = cyclic_pair();
        let err = plan(&registry, Operation::Save, &[a]).unwrap_err();
        let Error::CyclicDependency(cycle) = err else {
            panic!("expected cycle error, got {err:?}");
        };
        let mut names = cycle.entities.clone();
        names.sort();
        assert_eq!(names, vec!["A(new)".to_string(), "B(new)".to_string()]);
    }
}
