//! Execution of an ordered change set.
//!
//! Walks the [`ExecutionPlan`] layer by layer and issues the primitive
//! writes. Within a layer, steps are independent, so neighbouring inserts
//! of one entity type share a multi-row insert, neighbouring deletes of one
//! type share an `IN` delete, and neighbouring junction inserts into the
//! same table share a statement.
//!
//! Before hooks run immediately before a subject's statement and after hooks
//! immediately after it. Hook changes to the entity are folded back into the
//! subject's column changes before it is written.

use crate::change_set::{ChangeSetComputer, row_identifier};
use crate::config::PersistOptions;
use crate::hooks::HookDispatcher;
use crate::orderer::{ExecutionPlan, Step};
use crate::subject::{
    Endpoint, FkBinding, JunctionRemoval, OperationKind, Subject, SubjectGraph, SubjectId,
};
use cascadia_core::{
    Driver, EntityRef, Error, HookPoint, Identifier, InsertBatch, OptimisticLockError, Predicate,
    Property, QueryRunner, Registry, ResolutionError, Result, SubjectError, Value, WriteKind,
};
use asupersync::{Cx, Outcome};
use serde::Serialize;
use std::collections::BTreeMap;

/// What a persistence call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    /// Rows inserted.
    pub inserted: usize,
    /// Rows updated, including orphans detached from their parent.
    pub updated: usize,
    /// Rows physically deleted.
    pub deleted: usize,
    /// Rows stamped with a delete date.
    pub soft_deleted: usize,
    /// Rows whose delete date was cleared.
    pub recovered: usize,
    /// Junction rows inserted.
    pub junction_inserted: usize,
    /// Junction rows deleted.
    pub junction_removed: usize,
    /// Deferred foreign-key writes.
    pub relation_updates: usize,
    /// Statements issued, lookups and transaction control included.
    pub statements: usize,
    /// One line per statement, in execution order.
    pub plan: Vec<String>,
}

impl PersistReport {
    /// Total number of row writes.
    pub fn total(&self) -> usize {
        self.inserted
            + self.updated
            + self.deleted
            + self.soft_deleted
            + self.recovered
            + self.junction_inserted
            + self.junction_removed
            + self.relation_updates
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Render the report as a JSON object.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn record(&mut self, line: String) {
        self.statements += 1;
        self.plan.push(line);
    }
}

/// Values written back onto caller entities, so they can be restored when
/// the transaction rolls back.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    entries: Vec<(EntityRef, String, Option<Property>)>,
}

impl UndoLog {
    fn record(&mut self, entity: EntityRef, path: String, previous: Option<Property>) {
        self.entries.push((entity, path, previous));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restore every recorded property, newest first.
    pub fn revert(self) -> usize {
        let count = self.entries.len();
        for (entity, path, previous) in self.entries.into_iter().rev() {
            let mut entity = entity.write();
            match previous {
                Some(property) => entity.set_property(&path, property),
                None => {
                    entity.unset(&path);
                }
            }
        }
        count
    }
}

/// Steps sharing one statement.
#[derive(Debug)]
enum Batch {
    Insert(Vec<SubjectId>),
    Delete(Vec<SubjectId>),
    Links(Vec<Step>),
    Single(Step),
}

pub(crate) struct Executor<'a, D: Driver> {
    cx: &'a Cx,
    driver: &'a D,
    registry: &'a Registry,
    options: &'a PersistOptions,
    changes: &'a ChangeSetComputer<'a>,
    hooks: HookDispatcher<'a>,
    undo: UndoLog,
    report: PersistReport,
}

impl<'a, D: Driver> Executor<'a, D> {
    pub fn new(
        cx: &'a Cx,
        driver: &'a D,
        registry: &'a Registry,
        options: &'a PersistOptions,
        changes: &'a ChangeSetComputer<'a>,
        report: PersistReport,
    ) -> Self {
        Self {
            cx,
            driver,
            registry,
            options,
            changes,
            hooks: HookDispatcher::new(registry, options.listeners),
            undo: UndoLog::default(),
            report,
        }
    }

    pub fn finish(self) -> (PersistReport, UndoLog) {
        (self.report, self.undo)
    }

    fn queries(&self) -> &'a dyn QueryRunner {
        self.driver
    }

    /// Execute every step of the plan in order.
    #[tracing::instrument(level = "debug", skip_all, fields(steps = plan.len()))]
    pub async fn run(&mut self, graph: &mut SubjectGraph, plan: &ExecutionPlan) -> Outcome<(), Error> {
        for layer in &plan.layers {
            for batch in self.batches(graph, layer) {
                let outcome = match batch {
                    Batch::Insert(ids) => self.insert_group(graph, &ids).await,
                    Batch::Delete(ids) => self.delete_group(graph, &ids).await,
                    Batch::Links(steps) => self.insert_links(graph, &steps).await,
                    Batch::Single(step) => self.single(graph, step).await,
                };
                match outcome {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        Outcome::Ok(())
    }

    /// Coalesce neighbouring steps of a layer.
    fn batches(&self, graph: &SubjectGraph, layer: &[Step]) -> Vec<Batch> {
        let limit = self.options.chunk.unwrap_or(usize::MAX);
        let insert_limit = if self.driver.supports_multi_row_insert() {
            limit
        } else {
            1
        };

        let mut batches: Vec<Batch> = Vec::new();
        for &step in layer {
            match step {
                Step::Write(id) if graph.get(id).is_batchable() => {
                    let subject = graph.get(id);
                    let insert = subject.kind == OperationKind::Insert;
                    let cap = if insert { insert_limit } else { limit };
                    let joined = match batches.last_mut() {
                        Some(Batch::Insert(ids)) if insert => {
                            push_if_same_type(graph, ids, id, cap)
                        }
                        Some(Batch::Delete(ids)) if !insert => {
                            push_if_same_type(graph, ids, id, cap)
                        }
                        _ => false,
                    };
                    if !joined {
                        batches.push(if insert {
                            Batch::Insert(vec![id])
                        } else {
                            Batch::Delete(vec![id])
                        });
                    }
                }
                Step::JunctionInsert { subject, index } => {
                    let junction = graph.get(subject).junction_inserts[index].junction;
                    let joined = match batches.last_mut() {
                        Some(Batch::Links(steps)) if steps.len() < insert_limit => {
                            let same = steps.first().is_some_and(|first| {
                                link_junction(graph, *first) == Some(junction)
                            });
                            if same {
                                steps.push(step);
                            }
                            same
                        }
                        _ => false,
                    };
                    if !joined {
                        batches.push(Batch::Links(vec![step]));
                    }
                }
                other => batches.push(Batch::Single(other)),
            }
        }
        batches
    }

    async fn single(&mut self, graph: &mut SubjectGraph, step: Step) -> Outcome<(), Error> {
        match step {
            Step::Write(id) => match graph.get(id).kind {
                OperationKind::Update => self.update(graph, id).await,
                OperationKind::SoftDelete => self.stamp(graph, id, HookPoint::BeforeSoftRemove).await,
                OperationKind::Recover => self.stamp(graph, id, HookPoint::BeforeRecover).await,
                OperationKind::Insert => self.insert_group(graph, &[id]).await,
                OperationKind::Delete => self.delete_group(graph, &[id]).await,
                OperationKind::Unchanged => Outcome::Ok(()),
            },
            Step::JunctionInsert { .. } => self.insert_links(graph, &[step]).await,
            Step::JunctionRemove { subject, index } => self.remove_link(graph, subject, index).await,
            Step::RelationUpdate { subject, index } => self.relation_update(graph, subject, index).await,
        }
    }

    async fn fire_all(&self, graph: &SubjectGraph, ids: &[SubjectId], point: HookPoint) -> Outcome<(), Error> {
        if !self.hooks.enabled() {
            return Outcome::Ok(());
        }
        for &id in ids {
            match self.hooks.fire(self.cx, point, graph.get(id), self.queries()).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Fire before hooks and fold any entity changes back into the subjects.
    async fn prepare(&self, graph: &mut SubjectGraph, ids: &[SubjectId], point: HookPoint) -> Outcome<(), Error> {
        match self.fire_all(graph, ids, point).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if self.hooks.enabled() {
            for &id in ids {
                if let Err(e) = self.changes.refresh(graph, id) {
                    return Outcome::Err(e);
                }
            }
        }
        Outcome::Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rows = ids.len()))]
    async fn insert_group(&mut self, graph: &mut SubjectGraph, ids: &[SubjectId]) -> Outcome<(), Error> {
        match self.prepare(graph, ids, HookPoint::BeforeInsert).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let first = graph.get(ids[0]);
        let metadata = first.metadata.clone();
        let mut rows = Vec::with_capacity(ids.len());
        for &id in ids {
            match resolved_values(graph, id) {
                Ok(values) => rows.push(values),
                Err(e) => return Outcome::Err(subject_error(graph.get(id), WriteKind::Insert, e)),
            }
        }

        let columns: Vec<String> = metadata
            .columns
            .iter()
            .map(|c| c.column_name.clone())
            .filter(|c| rows.iter().any(|row| row.iter().any(|(name, _)| name == c)))
            .collect();
        let mut batch = InsertBatch::new(columns.clone());
        for row in &rows {
            batch.push(
                columns
                    .iter()
                    .map(|c| {
                        row.iter()
                            .find(|(name, _)| name == c)
                            .map_or(Value::Default, |(_, v)| v.clone())
                    })
                    .collect(),
            );
        }

        tracing::debug!(table = %metadata.table, rows = batch.len(), "Inserting");
        let generated = match self.driver.insert_rows(self.cx, &metadata.table, &batch).await {
            Outcome::Ok(generated) => generated,
            Outcome::Err(e) => return Outcome::Err(batch_error(graph.get(ids[0]), WriteKind::Insert, ids.len(), e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.report.record(format!("INSERT {} ({} rows)", metadata.table, ids.len()));

        for (index, (&id, values)) in ids.iter().zip(rows).enumerate() {
            let mut written: BTreeMap<String, Value> = values
                .into_iter()
                .filter(|(_, v)| !matches!(v, Value::Default))
                .collect();
            if let Some(row) = generated.get(index) {
                for (column, value) in row.iter() {
                    written.insert(column.to_string(), value.clone());
                }
            }
            let Some(identifier) = row_identifier(&metadata, &written) else {
                let subject = graph.get(id);
                return Outcome::Err(subject_error(
                    subject,
                    WriteKind::Insert,
                    Error::IdentifierResolution(ResolutionError {
                        entity: subject.type_name().to_string(),
                        relation: "primary key".to_string(),
                        target: subject.type_name().to_string(),
                    }),
                ));
            };

            let pairs: Vec<(String, Value)> = written.iter().map(|(c, v)| (c.clone(), v.clone())).collect();
            let subject = graph.get_mut(id);
            subject.identifier = Some(identifier);
            subject.written = written;
            tracing::trace!(subject = %subject, "Inserted");
            self.backfill(graph.get(id), &pairs);
        }
        self.report.inserted += ids.len();

        self.fire_all(graph, ids, HookPoint::AfterInsert).await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn update(&mut self, graph: &mut SubjectGraph, id: SubjectId) -> Outcome<(), Error> {
        match self.prepare(graph, &[id], HookPoint::BeforeUpdate).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let values = match resolved_values(graph, id) {
            Ok(values) => values,
            Err(e) => return Outcome::Err(subject_error(graph.get(id), WriteKind::Update, e)),
        };
        let subject = graph.get(id);
        if values.is_empty() {
            tracing::trace!(subject = %subject, "Nothing left to update after hooks");
            return self.fire_all(graph, &[id], HookPoint::AfterUpdate).await;
        }
        let (predicate, guard) = match guarded_predicate(subject) {
            Ok(found) => found,
            Err(e) => return Outcome::Err(subject_error(subject, WriteKind::Update, e)),
        };

        tracing::debug!(subject = %subject, columns = values.len(), guarded = guard.is_some(), "Updating");
        let affected = match self
            .driver
            .update_rows(self.cx, subject.table(), &predicate, &values)
            .await
        {
            Outcome::Ok(affected) => affected,
            Outcome::Err(e) => return Outcome::Err(subject_error(subject, WriteKind::Update, e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.report.record(format!("UPDATE {} ({})", subject.table(), subject.describe_identifier()));
        if affected == 0 {
            if let Some(expected) = guard {
                return Outcome::Err(optimistic_lock(subject, &expected));
            }
        }

        self.backfill(subject, &values);
        let subject = graph.get_mut(id);
        subject.written.extend(values);
        self.report.updated += 1;

        self.fire_all(graph, &[id], HookPoint::AfterUpdate).await
    }

    /// Soft delete or recover: write the delete date column only.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn stamp(&mut self, graph: &mut SubjectGraph, id: SubjectId, before: HookPoint) -> Outcome<(), Error> {
        let (after, operation) = if before == HookPoint::BeforeRecover {
            (HookPoint::AfterRecover, WriteKind::Recover)
        } else {
            (HookPoint::AfterSoftRemove, WriteKind::SoftDelete)
        };
        match self.fire_all(graph, &[id], before).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let subject = graph.get(id);
        let Some(identifier) = subject.identifier.as_ref() else {
            return Outcome::Err(subject_error(subject, operation, unresolved(subject)));
        };
        let predicate = Predicate::identifier(identifier);
        let values = subject.changed_columns.clone();
        match self
            .driver
            .update_rows(self.cx, subject.table(), &predicate, &values)
            .await
        {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(subject_error(subject, operation, e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.report.record(format!("UPDATE {} ({}) {}", subject.table(), subject.describe_identifier(), operation.as_str()));
        tracing::trace!(subject = %subject, operation = operation.as_str(), "Stamped delete date");

        self.backfill(subject, &values);
        if operation == WriteKind::Recover {
            self.report.recovered += 1;
        } else {
            self.report.soft_deleted += 1;
        }
        graph.get_mut(id).written.extend(values);

        self.fire_all(graph, &[id], after).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rows = ids.len()))]
    async fn delete_group(&mut self, graph: &mut SubjectGraph, ids: &[SubjectId]) -> Outcome<(), Error> {
        match self.fire_all(graph, ids, HookPoint::BeforeRemove).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let first = graph.get(ids[0]);
        let (predicate, guard) = if ids.len() == 1 {
            match guarded_predicate(first) {
                Ok(found) => found,
                Err(e) => return Outcome::Err(subject_error(first, WriteKind::Delete, e)),
            }
        } else {
            let mut identifiers = Vec::with_capacity(ids.len());
            for &id in ids {
                let subject = graph.get(id);
                match &subject.identifier {
                    Some(identifier) => identifiers.push(identifier.clone()),
                    None => return Outcome::Err(subject_error(subject, WriteKind::Delete, unresolved(subject))),
                }
            }
            (Predicate::any_identifier(&identifiers), None)
        };

        tracing::debug!(table = %first.table(), rows = ids.len(), guarded = guard.is_some(), "Deleting");
        let affected = match self.driver.delete_rows(self.cx, first.table(), &predicate).await {
            Outcome::Ok(affected) => affected,
            Outcome::Err(e) => return Outcome::Err(batch_error(first, WriteKind::Delete, ids.len(), e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.report.record(format!("DELETE {} ({} rows)", first.table(), ids.len()));
        if affected == 0 {
            if let Some(expected) = guard {
                return Outcome::Err(optimistic_lock(first, &expected));
            }
        }
        self.report.deleted += ids.len();

        self.fire_all(graph, ids, HookPoint::AfterRemove).await
    }

    async fn insert_links(&mut self, graph: &mut SubjectGraph, steps: &[Step]) -> Outcome<(), Error> {
        let Some(junction) = steps.first().and_then(|s| link_junction(graph, *s)) else {
            return Outcome::Ok(());
        };
        let info = &self.registry.junctions()[junction];
        let columns: Vec<String> = info
            .descriptor
            .owner_columns
            .iter()
            .chain(&info.descriptor.inverse_columns)
            .cloned()
            .collect();

        let mut batch = InsertBatch::new(columns);
        for &step in steps {
            let Step::JunctionInsert { subject, index } = step else {
                continue;
            };
            let owner = graph.get(subject);
            let link = &owner.junction_inserts[index];
            let resolved = endpoint_values(graph, owner, &link.owner, &info.owner, &info.descriptor.table)
                .and_then(|mut row| {
                    row.extend(endpoint_values(graph, owner, &link.inverse, &info.inverse, &info.descriptor.table)?);
                    Ok(row)
                });
            match resolved {
                Ok(row) => batch.push(row),
                Err(e) => return Outcome::Err(subject_error(owner, WriteKind::JunctionInsert, e)),
            }
        }

        tracing::debug!(table = %info.descriptor.table, rows = batch.len(), "Linking");
        match self
            .driver
            .insert_rows(self.cx, &info.descriptor.table, &batch)
            .await
        {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => {
                return Outcome::Err(batch_error(
                    graph.get(steps[0].subject()),
                    WriteKind::JunctionInsert,
                    batch.len(),
                    e,
                ));
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.report.record(format!("INSERT {} ({} rows)", info.descriptor.table, batch.len()));
        self.report.junction_inserted += batch.len();
        Outcome::Ok(())
    }

    async fn remove_link(&mut self, graph: &mut SubjectGraph, id: SubjectId, index: usize) -> Outcome<(), Error> {
        let subject = graph.get(id);
        let removal = &subject.junction_removes[index];
        let info = &self.registry.junctions()[removal.junction()];

        let predicate = match removal {
            JunctionRemoval::Link(link) => {
                let owner = endpoint_values(graph, subject, &link.owner, &info.owner, &info.descriptor.table);
                let inverse = endpoint_values(graph, subject, &link.inverse, &info.inverse, &info.descriptor.table);
                match (owner, inverse) {
                    (Ok(owner), Ok(inverse)) => column_predicate(
                        info.descriptor.owner_columns.iter().chain(&info.descriptor.inverse_columns),
                        owner.into_iter().chain(inverse),
                    ),
                    (Err(e), _) | (_, Err(e)) => {
                        return Outcome::Err(subject_error(subject, WriteKind::JunctionRemove, e));
                    }
                }
            }
            JunctionRemoval::All { side, .. } => match &subject.identifier {
                Some(identifier) => column_predicate(info.columns(*side).iter(), identifier.values()),
                None => {
                    return Outcome::Err(subject_error(subject, WriteKind::JunctionRemove, unresolved(subject)));
                }
            },
        };

        let removed = match self
            .driver
            .delete_rows(self.cx, &info.descriptor.table, &predicate)
            .await
        {
            Outcome::Ok(removed) => removed,
            Outcome::Err(e) => return Outcome::Err(subject_error(subject, WriteKind::JunctionRemove, e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        tracing::trace!(table = %info.descriptor.table, subject = %subject, removed, "Unlinked");
        self.report.record(format!("DELETE {} ({})", info.descriptor.table, predicate));
        self.report.junction_removed += usize::try_from(removed).unwrap_or(usize::MAX);
        Outcome::Ok(())
    }

    async fn relation_update(&mut self, graph: &mut SubjectGraph, id: SubjectId, index: usize) -> Outcome<(), Error> {
        let subject = graph.get(id);
        let update = &subject.relation_updates[index];
        let Some(identifier) = subject.identifier.as_ref() else {
            return Outcome::Err(subject_error(subject, WriteKind::RelationUpdate, unresolved(subject)));
        };

        let values: Vec<(String, Value)> = if update.clear {
            update
                .binding
                .columns
                .iter()
                .map(|(column, _)| (column.clone(), Value::Null))
                .collect()
        } else {
            match target_identifier(graph, subject, &update.binding) {
                Ok(target) => update
                    .binding
                    .columns
                    .iter()
                    .map(|(column, referenced)| {
                        (column.clone(), target.get(referenced).cloned().unwrap_or(Value::Null))
                    })
                    .collect(),
                Err(e) => return Outcome::Err(subject_error(subject, WriteKind::RelationUpdate, e)),
            }
        };

        let predicate = Predicate::identifier(identifier);
        match self
            .driver
            .update_rows(self.cx, subject.table(), &predicate, &values)
            .await
        {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(subject_error(subject, WriteKind::RelationUpdate, e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        tracing::debug!(subject = %subject, relation = %update.binding.relation, clear = update.clear, "Relation updated");
        self.report.record(format!("UPDATE {} ({}) {}", subject.table(), subject.describe_identifier(), update.binding.relation));
        self.report.relation_updates += 1;

        if !update.clear {
            self.backfill(subject, &values);
        }
        graph.get_mut(id).written.extend(values);
        Outcome::Ok(())
    }

    /// Write confirmed column values back onto the caller's entity.
    fn backfill(&mut self, subject: &Subject, values: &[(String, Value)]) {
        if !self.options.reload || subject.orphan {
            return;
        }
        let mut entity = subject.entity.write();
        for (column, value) in values {
            let Some(meta) = subject.metadata.column_named(column) else {
                continue;
            };
            if matches!(value, Value::Default) {
                continue;
            }
            let previous = entity.property(&meta.property_path).cloned();
            if let Some(Property::Value(current)) = &previous {
                if current.same_as(value) {
                    continue;
                }
            }
            self.undo
                .record(subject.entity.clone(), meta.property_path.clone(), previous);
            entity.set(&meta.property_path, value.clone());
        }
    }
}

fn push_if_same_type(graph: &SubjectGraph, ids: &mut Vec<SubjectId>, id: SubjectId, cap: usize) -> bool {
    let same = ids.len() < cap
        && ids
            .first()
            .is_some_and(|&first| graph.get(first).type_name() == graph.get(id).type_name());
    if same {
        ids.push(id);
    }
    same
}

fn link_junction(graph: &SubjectGraph, step: Step) -> Option<usize> {
    match step {
        Step::JunctionInsert { subject, index } => Some(graph.get(subject).junction_inserts[index].junction),
        _ => None,
    }
}

/// The subject's column changes with foreign-key bindings filled in.
fn resolved_values(graph: &SubjectGraph, id: SubjectId) -> Result<Vec<(String, Value)>> {
    let subject = graph.get(id);
    let mut values = subject.changed_columns.clone();
    for binding in &subject.bindings {
        let target = if binding.deferred {
            None
        } else {
            Some(target_identifier(graph, subject, binding)?)
        };
        for (column, referenced) in &binding.columns {
            let value = target
                .and_then(|t| t.get(referenced).cloned())
                .unwrap_or(Value::Null);
            values.retain(|(c, _)| c != column);
            values.push((column.clone(), value));
        }
    }
    Ok(values)
}

fn target_identifier<'g>(graph: &'g SubjectGraph, subject: &Subject, binding: &FkBinding) -> Result<&'g Identifier> {
    let target = graph.get(binding.target);
    target.identifier.as_ref().ok_or_else(|| {
        Error::IdentifierResolution(ResolutionError {
            entity: subject.type_name().to_string(),
            relation: binding.relation.clone(),
            target: target.type_name().to_string(),
        })
    })
}

fn endpoint_values(
    graph: &SubjectGraph,
    owner: &Subject,
    endpoint: &Endpoint,
    type_name: &str,
    table: &str,
) -> Result<Vec<Value>> {
    match endpoint {
        Endpoint::Fixed(identifier) => Ok(identifier.values()),
        Endpoint::Subject(id) => graph
            .get(*id)
            .identifier
            .as_ref()
            .map(Identifier::values)
            .ok_or_else(|| {
                Error::IdentifierResolution(ResolutionError {
                    entity: owner.type_name().to_string(),
                    relation: table.to_string(),
                    target: type_name.to_string(),
                })
            }),
    }
}

fn column_predicate<'c>(
    columns: impl Iterator<Item = &'c String>,
    values: impl IntoIterator<Item = Value>,
) -> Predicate {
    Predicate::And(
        columns
            .zip(values)
            .map(|(c, v)| Predicate::Eq(c.clone(), v))
            .collect(),
    )
}

/// Primary-key predicate, plus the version guard when the subject has one.
fn guarded_predicate(subject: &Subject) -> Result<(Predicate, Option<Value>)> {
    let identifier = subject.identifier.as_ref().ok_or_else(|| unresolved(subject))?;
    let mut predicate = Predicate::identifier(identifier);
    let guard = match (subject.metadata.version_column(), &subject.previous_version) {
        (Some(column), Some(previous)) => {
            predicate = predicate.and(Predicate::Eq(column.column_name.clone(), previous.clone()));
            Some(previous.clone())
        }
        _ => None,
    };
    Ok((predicate, guard))
}

fn unresolved(subject: &Subject) -> Error {
    Error::IdentifierResolution(ResolutionError {
        entity: subject.type_name().to_string(),
        relation: "primary key".to_string(),
        target: subject.type_name().to_string(),
    })
}

fn optimistic_lock(subject: &Subject, expected: &Value) -> Error {
    tracing::debug!(subject = %subject, expected = %expected, "Version guard matched no row");
    Error::OptimisticLock(OptimisticLockError {
        entity: subject.type_name().to_string(),
        identifier: subject.describe_identifier(),
        expected_version: expected.to_string(),
    })
}

/// Attach the failing subject to a driver error. Errors that already name
/// their subject pass through.
fn subject_error(subject: &Subject, operation: WriteKind, error: Error) -> Error {
    batch_error(subject, operation, 1, error)
}

/// A failed multi-row statement cannot tell which row was at fault, so the
/// error names the first subject and the row count.
fn batch_error(first: &Subject, operation: WriteKind, rows: usize, error: Error) -> Error {
    match error {
        Error::OptimisticLock(_) | Error::IdentifierResolution(_) | Error::SubjectExecution(_) => error,
        other => Error::SubjectExecution(SubjectError {
            entity: first.type_name().to_string(),
            identifier: first.describe_identifier(),
            operation,
            rows,
            source: Box::new(other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascadia_core::{ColumnMetadata, Entity, EntityMetadata, SqlType};
    use std::sync::Arc;

    fn subject(version: Option<Value>) -> Subject {
        let metadata = Arc::new(
            EntityMetadata::new("Doc", "docs")
                .column(ColumnMetadata::increment_id("id"))
                .column(ColumnMetadata::new("version", SqlType::BigInt).version()),
        );
        let mut subject = Subject::new(0, metadata, EntityRef::new(Entity::new("Doc")));
        subject.identifier = Some(Identifier::single("id", 7_i64));
        subject.previous_version = version;
        subject
    }

    #[test]
    fn version_guard_joins_identifier() {
        let (predicate, guard) = guarded_predicate(&subject(Some(Value::BigInt(3)))).unwrap();
        assert_eq!(predicate.to_string(), "id = 7 AND version = 3");
        assert_eq!(guard, Some(Value::BigInt(3)));

        let (predicate, guard) = guarded_predicate(&subject(None)).unwrap();
        assert_eq!(predicate, Predicate::Eq("id".into(), Value::BigInt(7)));
        assert!(guard.is_none());
    }

    #[test]
    fn subject_error_wraps_driver_errors_only() {
        let doc = subject(None);
        let wrapped = subject_error(&doc, WriteKind::Update, Error::constraint("UPDATE docs", "boom"));
        assert!(matches!(
            &wrapped,
            Error::SubjectExecution(e) if e.entity == "Doc" && e.identifier == "id=7"
        ));

        let lock = optimistic_lock(&doc, &Value::BigInt(1));
        assert!(matches!(subject_error(&doc, WriteKind::Update, lock), Error::OptimisticLock(_)));

        let batch = batch_error(&doc, WriteKind::Delete, 40, Error::constraint("DELETE docs", "boom"));
        assert!(matches!(&batch, Error::SubjectExecution(e) if e.rows == 40));
        assert!(batch.to_string().contains("batch of 40 Doc rows"));
    }

    #[test]
    fn undo_log_restores_previous_state() {
        let entity = EntityRef::new(Entity::new("Doc").with("title", "draft"));
        let mut undo = UndoLog::default();
        undo.record(entity.clone(), "id".into(), None);
        entity.set("id", 5_i64);
        undo.record(
            entity.clone(),
            "title".into(),
            entity.read().property("title").cloned(),
        );
        entity.set("title", "final");

        assert_eq!(undo.len(), 2);
        assert_eq!(undo.revert(), 2);
        assert_eq!(entity.get("id"), None);
        assert_eq!(entity.get("title"), Some(Value::Text("draft".into())));
    }

    #[test]
    fn report_totals() {
        let mut report = PersistReport {
            inserted: 2,
            junction_inserted: 3,
            ..PersistReport::default()
        };
        report.record("INSERT posts (2 rows)".into());
        assert_eq!(report.total(), 5);
        assert_eq!(report.statements, 1);
        assert!(!report.is_empty());
        assert!(PersistReport::default().is_empty());

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["inserted"], 2);
        assert_eq!(json["plan"][0], "INSERT posts (2 rows)");
    }
}
