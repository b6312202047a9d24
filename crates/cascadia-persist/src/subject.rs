//! Subjects: the engine's per-entity work items.
//!
//! Every entity reached while walking a persistence call becomes exactly one
//! [`Subject`]. The walker creates them, the change-set computer classifies
//! them and fills in the column changes, the orderer schedules their writes
//! and the executor carries them out.

use cascadia_core::{
    Baseline, EntityKey, EntityMetadata, EntityRef, Identifier, JunctionSide, Value, WriteKind,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Index of a subject inside its [`SubjectGraph`].
pub type SubjectId = usize;

/// The persistence call a graph was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Save,
    Remove,
    SoftRemove,
    Recover,
}

impl Operation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Remove => "remove",
            Operation::SoftRemove => "soft_remove",
            Operation::Recover => "recover",
        }
    }
}

/// What will happen to a subject's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    SoftDelete,
    Recover,
    /// Nothing to write; kept in the graph for relation resolution.
    Unchanged,
}

impl OperationKind {
    pub const fn write_kind(&self) -> Option<WriteKind> {
        match self {
            OperationKind::Insert => Some(WriteKind::Insert),
            OperationKind::Update => Some(WriteKind::Update),
            OperationKind::Delete => Some(WriteKind::Delete),
            OperationKind::SoftDelete => Some(WriteKind::SoftDelete),
            OperationKind::Recover => Some(WriteKind::Recover),
            OperationKind::Unchanged => None,
        }
    }
}

/// Foreign-key columns whose values come from another subject's identifier.
///
/// Created whenever the referenced subject is being inserted, since its key
/// is only known once that insert ran.
#[derive(Debug, Clone)]
pub struct FkBinding {
    pub relation: String,
    pub target: SubjectId,
    /// `(column on this subject, referenced key column on the target)`
    pub columns: Vec<(String, String)>,
    pub nullable: bool,
    /// Set when a dependency cycle was broken at this binding: the row is
    /// written with NULL here and a relation update fills in the value.
    pub deferred: bool,
}

/// A follow-up write of foreign-key columns after both rows exist.
#[derive(Debug, Clone)]
pub struct RelationUpdate {
    pub binding: FkBinding,
    /// Write NULL instead of the target's key. Used to detach a row before
    /// the row it references is deleted.
    pub clear: bool,
}

/// One end of a junction row.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Subject(SubjectId),
    /// An entity outside the graph with a known key.
    Fixed(Identifier),
}

impl Endpoint {
    pub(crate) fn dedup_key(&self) -> (usize, u64) {
        match self {
            Endpoint::Subject(id) => (0, *id as u64),
            Endpoint::Fixed(identifier) => (1, identifier.hash_key()),
        }
    }
}

/// A junction row, always oriented owner-first.
#[derive(Debug, Clone)]
pub struct JunctionLink {
    /// Index into [`Registry::junctions`](cascadia_core::Registry::junctions).
    pub junction: usize,
    pub owner: Endpoint,
    pub inverse: Endpoint,
}

/// Junction rows to delete.
#[derive(Debug, Clone)]
pub enum JunctionRemoval {
    /// A single link.
    Link(JunctionLink),
    /// Every row referencing the subject from `side`.
    All { junction: usize, side: JunctionSide },
}

impl JunctionRemoval {
    pub const fn junction(&self) -> usize {
        match self {
            JunctionRemoval::Link(link) => link.junction,
            JunctionRemoval::All { junction, .. } => *junction,
        }
    }
}

/// A unit of persistence work for one entity.
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct Subject {
    pub id: SubjectId,
    pub metadata: Arc<EntityMetadata>,
    pub entity: EntityRef,
    /// Persisted column values, from the entity's baseline or a prefetch.
    pub database_entity: Option<BTreeMap<String, Value>>,
    /// A prefetch looked this row up; with no `database_entity` the row
    /// does not exist.
    pub fetched: bool,
    /// To-many relations loaded into the baseline.
    pub loaded_relations: Option<BTreeMap<String, Vec<Identifier>>>,
    pub identifier: Option<Identifier>,
    pub kind: OperationKind,
    /// Literal column values to write.
    pub changed_columns: Vec<(String, Value)>,
    pub bindings: Vec<FkBinding>,
    pub relation_updates: Vec<RelationUpdate>,
    pub junction_inserts: Vec<JunctionLink>,
    pub junction_removes: Vec<JunctionRemoval>,
    /// Version value guarding an update or delete.
    pub previous_version: Option<Value>,
    /// Column values confirmed written, including generated ones.
    pub written: BTreeMap<String, Value>,
    /// Reached through a relation that cascades inserts (or a root).
    pub can_insert: bool,
    /// Reached through a relation that cascades updates (or a root).
    pub can_update: bool,
    /// Reached only as a child of a non-cascading one-to-many: only its
    /// foreign key to the parent may change.
    pub fk_only: bool,
    /// One-to-many inverse relations whose value is dictated by the parent
    /// collection holding this entity. `None` detaches the child.
    pub overrides: Vec<(String, Option<SubjectId>)>,
    /// Created for a child dropped from a loaded collection.
    pub orphan: bool,
    pub root: bool,
}

impl Subject {
    pub fn new(id: SubjectId, metadata: Arc<EntityMetadata>, entity: EntityRef) -> Self {
        Self {
            id,
            metadata,
            entity,
            database_entity: None,
            fetched: false,
            loaded_relations: None,
            identifier: None,
            kind: OperationKind::Unchanged,
            changed_columns: Vec::new(),
            bindings: Vec::new(),
            relation_updates: Vec::new(),
            junction_inserts: Vec::new(),
            junction_removes: Vec::new(),
            previous_version: None,
            written: BTreeMap::new(),
            can_insert: false,
            can_update: false,
            fk_only: false,
            overrides: Vec::new(),
            orphan: false,
            root: false,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.metadata.name
    }

    pub fn table(&self) -> &str {
        &self.metadata.table
    }

    /// Identifier rendered for messages, `new` when unresolved.
    pub fn describe_identifier(&self) -> String {
        self.identifier
            .as_ref()
            .map_or_else(|| "new".to_string(), ToString::to_string)
    }

    /// Whether the row write can share a statement with its neighbours.
    pub(crate) fn is_batchable(&self) -> bool {
        match self.kind {
            OperationKind::Insert => self.relation_updates.is_empty(),
            OperationKind::Delete => self.previous_version.is_none(),
            _ => false,
        }
    }

    /// Seed the persisted state from an entity baseline.
    pub(crate) fn adopt_baseline(&mut self, baseline: &Baseline) {
        self.database_entity = Some(baseline.columns.clone());
        self.loaded_relations = Some(baseline.relations.clone());
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(id) => write!(f, "{}({})", self.metadata.name, id),
            None => write!(f, "{}(new)", self.metadata.name),
        }
    }
}

/// Read an entity's primary key, if every key column holds a non-NULL value.
pub fn identifier_of(metadata: &EntityMetadata, entity: &EntityRef) -> Option<Identifier> {
    let guard = entity.read();
    let mut parts = Vec::new();
    for column in metadata.primary_columns() {
        match guard.value(&column.property_path) {
            Some(v) if !v.is_null() && !matches!(v, Value::Default) => {
                parts.push((column.column_name.clone(), v.clone()));
            }
            _ => return None,
        }
    }
    Some(Identifier::new(parts))
}

/// All subjects of one persistence call, indexed by entity identity.
#[derive(Debug, Default)]
pub struct SubjectGraph {
    pub subjects: Vec<Subject>,
    index: HashMap<EntityKey, SubjectId>,
}

impl SubjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Subject for an entity handle, if the entity was reached.
    pub fn find(&self, entity: &EntityRef) -> Option<SubjectId> {
        self.index.get(&entity.key()).copied()
    }

    /// Subject of the given type with a matching identifier.
    pub fn find_by_identifier(&self, type_name: &str, identifier: &Identifier) -> Option<SubjectId> {
        self.subjects
            .iter()
            .find(|s| {
                s.type_name() == type_name
                    && s.identifier.as_ref().is_some_and(|id| id.same_as(identifier))
            })
            .map(|s| s.id)
    }

    /// Add a subject for `entity`, or return the existing one.
    ///
    /// The boolean is true when the subject was created by this call.
    pub fn insert(&mut self, metadata: Arc<EntityMetadata>, entity: &EntityRef) -> (SubjectId, bool) {
        if let Some(&id) = self.index.get(&entity.key()) {
            return (id, false);
        }
        let id = self.subjects.len();
        self.index.insert(entity.key(), id);
        self.subjects.push(Subject::new(id, metadata, entity.clone()));
        (id, true)
    }

    pub fn get(&self, id: SubjectId) -> &Subject {
        &self.subjects[id]
    }

    pub fn get_mut(&mut self, id: SubjectId) -> &mut Subject {
        &mut self.subjects[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    /// Subjects with a row write to perform.
    pub fn pending(&self) -> impl Iterator<Item = &Subject> {
        self.subjects
            .iter()
            .filter(|s| s.kind != OperationKind::Unchanged)
    }
}
