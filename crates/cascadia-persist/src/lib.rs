//! Persistence orchestration for Cascadia.
//!
//! `cascadia-persist` turns object graphs into ordered, transactional
//! sequences of primitive writes. A call goes through five stages:
//!
//! 1. [`GraphWalker`] collects one [`Subject`] per reachable entity,
//!    following the relations whose cascade rules allow the operation.
//! 2. [`ChangeSetComputer`] classifies each subject and computes its column
//!    changes, foreign-key bindings and junction rows, after an optional
//!    lookup of the persisted state ([`prefetch`]).
//! 3. [`DependencyOrderer`] sorts the resulting writes into an
//!    [`ExecutionPlan`], breaking cycles through nullable foreign keys.
//! 4. The executor runs the plan against a [`Driver`], coalescing
//!    neighbouring writes into multi-row statements and firing lifecycle
//!    hooks around each subject.
//! 5. Generated values are written back onto the entities and their
//!    baselines refreshed, so a repeated save writes nothing.
//!
//! Stages 1 to 3 are synchronous and free of side effects. Every error they
//! raise aborts the call before any statement is issued. A failure during
//! execution rolls back the call's transaction and restores the values that
//! had been written back onto the entities.
//!
//! # Example
//!
//! ```ignore
//! let persister = Persister::new(registry, driver);
//!
//! let category = EntityRef::new(Entity::new("Category").with("name", "news"));
//! let post = EntityRef::new(
//!     Entity::new("Post")
//!         .with("title", "Hello")
//!         .with_ref("category", Some(category.clone())),
//! );
//!
//! let report = persister.save(&cx, &[post.clone()]).await?;
//! assert_eq!(report.inserted, 2);
//! assert!(post.get("id").is_some());
//! ```

pub mod change_set;
pub mod config;
mod executor;
mod find;
mod hooks;
pub mod orderer;
pub mod subject;
pub mod walker;

#[cfg(test)]
mod test_support;

pub use change_set::{ChangeSetComputer, prefetch};
pub use config::{Clock, FindOptions, PREFETCH_CHUNK, PersistOptions, PersisterConfig};
pub use executor::PersistReport;
pub use orderer::{DependencyOrderer, ExecutionPlan, Step};
pub use subject::{
    Endpoint, FkBinding, JunctionLink, JunctionRemoval, Operation, OperationKind, RelationUpdate,
    Subject, SubjectGraph, SubjectId, identifier_of,
};
pub use walker::GraphWalker;

use asupersync::{Cx, Outcome};
use cascadia_core::{Baseline, Driver, EntityRef, Error, Identifier, Registry, RelationKind, Result};
use executor::{Executor, UndoLog};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Transaction opened by one call, on first use.
struct CallTransaction {
    owned: bool,
    open: bool,
}

impl CallTransaction {
    fn new<D: Driver>(driver: &D, options: &PersistOptions) -> Self {
        Self {
            owned: options.transaction && !driver.in_transaction(),
            open: false,
        }
    }

    async fn ensure<D: Driver>(&mut self, cx: &Cx, driver: &D, report: &mut PersistReport) -> Outcome<(), Error> {
        if !self.owned || self.open {
            return Outcome::Ok(());
        }
        match driver.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.open = true;
        report.record("BEGIN".to_string());
        Outcome::Ok(())
    }

    async fn commit<D: Driver>(&mut self, cx: &Cx, driver: &D, report: &mut PersistReport) -> Outcome<(), Error> {
        if !self.open {
            return Outcome::Ok(());
        }
        match driver.commit(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.open = false;
        report.record("COMMIT".to_string());
        Outcome::Ok(())
    }

    /// Roll back after a failure. Returns whether a transaction was open.
    ///
    /// A failing rollback is logged; the caller sees the original failure.
    async fn abort<D: Driver>(&mut self, cx: &Cx, driver: &D) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        match driver.rollback(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => tracing::warn!(error = %e, "Rollback failed"),
            Outcome::Cancelled(_) => tracing::warn!("Rollback cancelled"),
            Outcome::Panicked(_) => tracing::warn!("Rollback panicked"),
        }
        true
    }
}

/// Saves and removes entity graphs through a [`Driver`].
///
/// A persister is cheap to share: it holds the read-only registry, the
/// driver and its configuration, and keeps no state between calls.
pub struct Persister<D: Driver> {
    registry: Arc<Registry>,
    driver: D,
    config: PersisterConfig,
}

impl<D: Driver> std::fmt::Debug for Persister<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Persister<D> {
    pub fn new(registry: Arc<Registry>, driver: D) -> Self {
        Self::with_config(registry, driver, PersisterConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, driver: D, config: PersisterConfig) -> Self {
        Self {
            registry,
            driver,
            config,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &PersisterConfig {
        &self.config
    }

    /// Insert or update the given entities and everything their cascading
    /// relations reach.
    pub async fn save(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::Save, entities, &self.config.defaults)
            .await
    }

    pub async fn save_with(
        &self,
        cx: &Cx,
        entities: &[EntityRef],
        options: &PersistOptions,
    ) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::Save, entities, options).await
    }

    /// Delete the given entities and everything reached through relations
    /// cascading removal. Soft-deletable types are stamped instead unless
    /// [`PersistOptions::permanent`] is set.
    pub async fn remove(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::Remove, entities, &self.config.defaults)
            .await
    }

    pub async fn remove_with(
        &self,
        cx: &Cx,
        entities: &[EntityRef],
        options: &PersistOptions,
    ) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::Remove, entities, options).await
    }

    /// Stamp the delete date of the given entities. Every type involved
    /// must declare a delete date column.
    pub async fn soft_remove(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::SoftRemove, entities, &self.config.defaults)
            .await
    }

    pub async fn soft_remove_with(
        &self,
        cx: &Cx,
        entities: &[EntityRef],
        options: &PersistOptions,
    ) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::SoftRemove, entities, options)
            .await
    }

    /// Clear the delete date of soft-removed entities.
    pub async fn recover(&self, cx: &Cx, entities: &[EntityRef]) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::Recover, entities, &self.config.defaults)
            .await
    }

    pub async fn recover_with(
        &self,
        cx: &Cx,
        entities: &[EntityRef],
        options: &PersistOptions,
    ) -> Outcome<PersistReport, Error> {
        self.persist(cx, Operation::Recover, entities, options).await
    }

    /// Load one entity by primary key. Soft-deleted rows are skipped unless
    /// [`FindOptions::with_deleted`] is set.
    pub async fn find_by_id(
        &self,
        cx: &Cx,
        type_name: &str,
        identifier: &Identifier,
        options: &FindOptions,
    ) -> Outcome<Option<EntityRef>, Error> {
        find::find_by_id(cx, &self.driver, &self.registry, type_name, identifier, options).await
    }

    /// Compute what a call would write without touching the database.
    ///
    /// Nothing is looked up: identified entities without a baseline count
    /// as updates of every set column.
    pub fn plan(
        &self,
        operation: Operation,
        entities: &[EntityRef],
        options: &PersistOptions,
    ) -> Result<(SubjectGraph, ExecutionPlan)> {
        let registry = self.registry.as_ref();
        let mut graph = GraphWalker::new(registry, operation).walk(entities)?;
        let changes = ChangeSetComputer::new(registry, operation, options, (self.config.clock)());
        changes.resolve(&mut graph);
        changes.compute(&mut graph)?;
        let plan = DependencyOrderer::new(registry).order(&mut graph)?;
        Ok((graph, plan))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(roots = roots.len()))]
    async fn persist(
        &self,
        cx: &Cx,
        operation: Operation,
        roots: &[EntityRef],
        options: &PersistOptions,
    ) -> Outcome<PersistReport, Error> {
        let start = Instant::now();
        let registry = self.registry.as_ref();
        tracing::debug!(operation = operation.as_str(), "Persisting");

        let mut graph = match GraphWalker::new(registry, operation).walk(roots) {
            Ok(graph) => graph,
            Err(e) => return Outcome::Err(e),
        };
        let changes = ChangeSetComputer::new(registry, operation, options, (self.config.clock)());
        changes.resolve(&mut graph);

        let mut report = PersistReport::default();
        let mut transaction = CallTransaction::new(&self.driver, options);

        if changes.needs_prefetch(&graph) {
            match transaction.ensure(cx, &self.driver, &mut report).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            let failure = match prefetch(cx, &self.driver, &mut graph).await {
                Outcome::Ok(lines) => {
                    for line in lines {
                        report.record(line);
                    }
                    None
                }
                Outcome::Err(e) => Some(Outcome::Err(e)),
                Outcome::Cancelled(r) => Some(Outcome::Cancelled(r)),
                Outcome::Panicked(p) => Some(Outcome::Panicked(p)),
            };
            if let Some(failure) = failure {
                transaction.abort(cx, &self.driver).await;
                return failure;
            }
        }

        let planned = match changes.compute(&mut graph) {
            Ok(()) => DependencyOrderer::new(registry).order(&mut graph),
            Err(e) => Err(e),
        };
        let plan = match planned {
            Ok(plan) => plan,
            Err(e) => {
                transaction.abort(cx, &self.driver).await;
                return Outcome::Err(e);
            }
        };

        let mut undo = UndoLog::default();
        if !plan.is_empty() {
            match transaction.ensure(cx, &self.driver, &mut report).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }

            let mut executor = Executor::new(cx, &self.driver, registry, options, &changes, report);
            let outcome = executor.run(&mut graph, &plan).await;
            (report, undo) = executor.finish();

            let failure = match outcome {
                Outcome::Ok(()) => None,
                Outcome::Err(e) => Some(Outcome::Err(e)),
                Outcome::Cancelled(r) => Some(Outcome::Cancelled(r)),
                Outcome::Panicked(p) => Some(Outcome::Panicked(p)),
            };
            if let Some(failure) = failure {
                self.fail(cx, operation, &mut transaction, undo).await;
                return failure;
            }
        }

        let committed = match transaction.commit(cx, &self.driver, &mut report).await {
            Outcome::Ok(()) => None,
            Outcome::Err(e) => Some(Outcome::Err(e)),
            Outcome::Cancelled(r) => Some(Outcome::Cancelled(r)),
            Outcome::Panicked(p) => Some(Outcome::Panicked(p)),
        };
        if let Some(failure) = committed {
            self.fail(cx, operation, &mut transaction, undo).await;
            return failure;
        }

        if options.reload {
            self.refresh_baselines(&graph);
        }

        tracing::info!(
            operation = operation.as_str(),
            subjects = graph.len(),
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            soft_deleted = report.soft_deleted,
            recovered = report.recovered,
            junction_rows = report.junction_inserted + report.junction_removed,
            statements = report.statements,
            elapsed_ms = start.elapsed().as_millis(),
            "Persist complete"
        );
        Outcome::Ok(report)
    }

    /// Roll back and restore written-back values, unless the writes stay
    /// (no transaction at all).
    async fn fail(&self, cx: &Cx, operation: Operation, transaction: &mut CallTransaction, undo: UndoLog) {
        let rolled_back = transaction.abort(cx, &self.driver).await;
        let restored = if rolled_back || self.driver.in_transaction() {
            undo.revert()
        } else {
            0
        };
        tracing::warn!(
            operation = operation.as_str(),
            rolled_back,
            restored,
            "Persist failed"
        );
    }

    /// Make the entities' baselines match what is now stored.
    fn refresh_baselines(&self, graph: &SubjectGraph) {
        for subject in graph.iter().filter(|s| !s.orphan) {
            match subject.kind {
                OperationKind::Delete => {
                    let mut entity = subject.entity.write();
                    entity.set_baseline(None);
                    for column in subject.metadata.primary_columns().filter(|c| c.is_generated()) {
                        entity.unset(&column.property_path);
                    }
                }
                OperationKind::Unchanged if subject.database_entity.is_none() => {}
                _ => {
                    let mut columns = subject.database_entity.clone().unwrap_or_default();
                    columns.extend(subject.written.iter().map(|(c, v)| (c.clone(), v.clone())));
                    let relations = self.current_relations(graph, subject);
                    subject
                        .entity
                        .write()
                        .set_baseline(Some(Baseline { columns, relations }));
                }
            }
        }
    }

    /// To-many relation identifiers to keep as the new baseline.
    fn current_relations(&self, graph: &SubjectGraph, subject: &Subject) -> BTreeMap<String, Vec<Identifier>> {
        let mut relations = subject.loaded_relations.clone().unwrap_or_default();
        let inserted = subject.kind == OperationKind::Insert;
        if !inserted && !subject.can_update {
            return relations;
        }

        let collections: Vec<(String, String, Vec<EntityRef>)> = {
            let entity = subject.entity.read();
            subject
                .metadata
                .relations
                .iter()
                .filter(|r| r.kind.is_to_many())
                .filter(|r| {
                    inserted || r.kind == RelationKind::OneToMany || relations.contains_key(&r.property)
                })
                .filter_map(|r| {
                    entity
                        .references(&r.property)
                        .map(|items| (r.property.clone(), r.target.clone(), items.to_vec()))
                })
                .collect()
        };

        for (property, target, items) in collections {
            let Ok(target_meta) = self.registry.metadata(&target) else {
                continue;
            };
            let ids = items
                .iter()
                .filter_map(|item| {
                    graph
                        .find(item)
                        .and_then(|t| graph.get(t).identifier.clone())
                        .or_else(|| identifier_of(target_meta, item))
                })
                .collect();
            relations.insert(property, ids);
        }
        relations
    }
}
