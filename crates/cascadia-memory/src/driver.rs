//! In-memory [`Driver`] implementation.
//!
//! Rows live in per-table maps behind one mutex. Every primitive is
//! executed synchronously and its result wrapped in a ready future, the
//! way a blocking embedded database would be driven.
//!
//! Constraints checked per statement:
//!
//! - primary keys are unique
//! - NOT NULL columns hold a value
//! - foreign keys reference an existing row; on delete the declared
//!   referential action applies (`NO ACTION` and `RESTRICT` fail the
//!   statement, `CASCADE` deletes, `SET NULL` clears)
//!
//! A failing statement leaves the tables as they were.

#![allow(clippy::significant_drop_tightening)]

use crate::table::{StoredRow, Table, constraint, key_values, query_error, schemas};
use cascadia_core::{
    ColumnInfo, Cx, Driver, Error, Generation, Identifier, InsertBatch, Outcome, Predicate, QueryErrorKind,
    ReferentialAction, Registry, Row, StatementKind, TransactionError, TransactionErrorKind, Value,
    hash_values,
};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One statement as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedStatement {
    pub kind: StatementKind,
    /// Table touched; `None` for transaction control.
    pub table: Option<String>,
    /// Rows sent (insert) or affected (update, delete, select).
    pub rows: usize,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Table>,
    snapshot: Option<BTreeMap<String, Table>>,
    log: Vec<LoggedStatement>,
    failures: Vec<(Option<String>, StatementKind)>,
    uuids: u64,
}

impl State {
    fn table(&self, name: &str) -> Result<&Table, Error> {
        self.tables
            .get(name)
            .ok_or_else(|| query_error(QueryErrorKind::NotFound, name, format!("no such table: {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, Error> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| query_error(QueryErrorKind::NotFound, name, format!("no such table: {name}")))
    }

    /// Log a statement and consume a matching injected failure, if any.
    fn statement(&mut self, kind: StatementKind, table: Option<&str>, rows: usize) -> Result<(), Error> {
        self.log.push(LoggedStatement {
            kind,
            table: table.map(str::to_string),
            rows,
        });
        let position = self.failures.iter().position(|(t, k)| {
            *k == kind && (t.is_none() || t.as_deref() == table)
        });
        match position {
            Some(index) => {
                self.failures.remove(index);
                Err(query_error(
                    QueryErrorKind::Database,
                    table.unwrap_or(kind.as_str()),
                    format!("injected {} failure", kind.as_str()),
                ))
            }
            None => Ok(()),
        }
    }

    /// Whether a row with this primary key exists in `table`.
    fn references_existing(&self, table: &str, key: &[Value]) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.find_key(key).is_some())
    }

    fn check_references(&self, table: &Table, row: &StoredRow) -> Result<(), Error> {
        for reference in &table.schema.references {
            let Some(key) = key_values(row, &reference.columns) else {
                continue;
            };
            if !self.references_existing(&reference.table, &key) {
                return Err(constraint(
                    &table.schema.name,
                    format!(
                        "FOREIGN KEY constraint failed: {}({}) references missing {} row",
                        table.schema.name,
                        reference.columns.join(", "),
                        reference.table
                    ),
                ));
            }
        }
        Ok(())
    }

    fn insert(&mut self, name: &str, batch: &InsertBatch, multi_row: bool) -> Result<Vec<Row>, Error> {
        self.statement(StatementKind::Insert, Some(name), batch.len())?;
        if batch.len() > 1 && !multi_row {
            return Err(query_error(
                QueryErrorKind::Database,
                name,
                "multi-row INSERT is not supported",
            ));
        }
        self.table(name)?.check_columns(&batch.columns)?;

        let mut pushed = Vec::with_capacity(batch.len());
        let result = self.stage(name, batch, &mut pushed).and_then(|generated| {
            // Checked after staging: rows may reference rows of the same batch.
            let table = self.table(name)?;
            for row in pushed.iter().filter_map(|rowid| table.row(*rowid)) {
                self.check_references(table, row)?;
            }
            Ok(generated)
        });
        if result.is_err() {
            if let Some(table) = self.tables.get_mut(name) {
                for rowid in pushed {
                    table.remove(rowid);
                }
            }
        }
        result
    }

    /// Add the batch rows to `name`, recording their rowids in `pushed`.
    fn stage(&mut self, name: &str, batch: &InsertBatch, pushed: &mut Vec<u64>) -> Result<Vec<Row>, Error> {
        let uuids = &mut self.uuids;
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| query_error(QueryErrorKind::NotFound, name, format!("no such table: {name}")))?;
        let columns = table.schema.columns.clone();

        let mut generated = Vec::with_capacity(batch.len());
        for values in &batch.rows {
            let mut row = StoredRow::new();
            let mut filled_names = Vec::new();
            let mut filled_values = Vec::new();
            for column in &columns {
                let given = batch
                    .columns
                    .iter()
                    .position(|c| *c == column.name)
                    .and_then(|i| values.get(i))
                    .filter(|v| !matches!(v, Value::Default));
                let filled = match (given, column.generation) {
                    (Some(v), generation) => {
                        if generation == Some(Generation::Increment) {
                            table.observe_increment(v);
                        }
                        row.insert(column.name.clone(), v.clone());
                        continue;
                    }
                    (None, Some(Generation::Increment)) => Value::BigInt(table.next_increment()),
                    (None, Some(Generation::Uuid)) => next_uuid(uuids),
                    (None, None) => match &column.default {
                        Some(default) => default.clone(),
                        None => {
                            row.insert(column.name.clone(), Value::Null);
                            continue;
                        }
                    },
                };
                filled_names.push(column.name.clone());
                filled_values.push(filled.clone());
                row.insert(column.name.clone(), filled);
            }

            table.check_not_null(&row)?;
            let key: Vec<Value> = table
                .schema
                .primary
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            if table.find_key(&key).is_some() {
                return Err(constraint(
                    name,
                    format!("UNIQUE constraint failed: {}({})", name, table.schema.primary.join(", ")),
                ));
            }
            pushed.push(table.push(row));
            generated.push(Row::new(filled_names, filled_values));
        }
        Ok(generated)
    }

    fn matching(&self, name: &str, predicate: &Predicate) -> Result<Vec<u64>, Error> {
        let table = self.table(name)?;
        Ok(table
            .rows()
            .filter(|(_, row)| predicate.matches(&|column: &str| row.get(column)))
            .map(|(rowid, _)| rowid)
            .collect())
    }

    fn update(&mut self, name: &str, predicate: &Predicate, changes: &[(String, Value)]) -> Result<u64, Error> {
        let matched = self.matching(name, predicate)?;
        self.statement(StatementKind::Update, Some(name), matched.len())?;
        let table = self.table(name)?;
        table.check_columns(changes.iter().map(|(c, _)| c))?;

        let primary_changed = changes.iter().any(|(c, _)| table.schema.primary.contains(c));
        let mut keys = HashSet::new();
        let mut updated = Vec::with_capacity(matched.len());
        for &rowid in &matched {
            let Some(current) = table.row(rowid) else {
                continue;
            };
            let mut row = current.clone();
            for (column, value) in changes {
                row.insert(column.clone(), value.clone());
            }
            table.check_not_null(&row)?;
            self.check_references(table, &row)?;
            if primary_changed {
                let key = key_values(&row, &table.schema.primary).unwrap_or_default();
                let taken = table
                    .find_key(&key)
                    .is_some_and(|other| !matched.contains(&other));
                if taken || !keys.insert(hash_values(&key)) {
                    return Err(constraint(
                        name,
                        format!("UNIQUE constraint failed: {}({})", name, table.schema.primary.join(", ")),
                    ));
                }
            }
            updated.push((rowid, row));
        }

        let table = self.table_mut(name)?;
        for (rowid, row) in updated {
            table.replace(rowid, row);
        }
        Ok(matched.len() as u64)
    }

    fn delete(&mut self, name: &str, predicate: &Predicate) -> Result<u64, Error> {
        let matched = self.matching(name, predicate)?;
        self.statement(StatementKind::Delete, Some(name), matched.len())?;
        let before = self.tables.clone();
        match self.delete_rows(name, &matched) {
            Ok(()) => Ok(matched.len() as u64),
            Err(e) => {
                self.tables = before;
                Err(e)
            }
        }
    }

    /// Remove rows and apply referential actions of rows pointing at them.
    fn delete_rows(&mut self, name: &str, rowids: &[u64]) -> Result<(), Error> {
        let table = self.table_mut(name)?;
        let primary = table.schema.primary.clone();
        let mut removed = HashSet::new();
        for &rowid in rowids {
            if let Some(row) = table.remove(rowid) {
                if let Some(key) = key_values(&row, &primary) {
                    removed.insert(hash_values(&key));
                }
            }
        }
        if removed.is_empty() {
            return Ok(());
        }

        let dependents: Vec<(String, Vec<String>, ReferentialAction)> = self
            .tables
            .values()
            .flat_map(|t| {
                t.schema
                    .references
                    .iter()
                    .filter(|r| r.table == name)
                    .map(|r| (t.schema.name.clone(), r.columns.clone(), r.on_delete))
            })
            .collect();

        for (child, columns, action) in dependents {
            let hits: Vec<u64> = self
                .table(&child)?
                .rows()
                .filter(|(_, row)| key_values(row, &columns).is_some_and(|k| removed.contains(&hash_values(&k))))
                .map(|(rowid, _)| rowid)
                .collect();
            if hits.is_empty() {
                continue;
            }
            match action {
                ReferentialAction::NoAction | ReferentialAction::Restrict => {
                    return Err(constraint(
                        name,
                        format!(
                            "FOREIGN KEY constraint failed: {} row still referenced from {}({})",
                            name,
                            child,
                            columns.join(", ")
                        ),
                    ));
                }
                ReferentialAction::Cascade => {
                    tracing::trace!(table = %child, rows = hits.len(), "Cascading delete");
                    self.delete_rows(&child, &hits)?;
                }
                ReferentialAction::SetNull => {
                    let table = self.table_mut(&child)?;
                    for rowid in hits {
                        let Some(mut row) = table.row(rowid).cloned() else {
                            continue;
                        };
                        for column in &columns {
                            row.insert(column.clone(), Value::Null);
                        }
                        table.check_not_null(&row)?;
                        table.replace(rowid, row);
                    }
                }
            }
        }
        Ok(())
    }

    fn select(&mut self, name: &str, predicate: &Predicate) -> Result<Vec<Row>, Error> {
        let matched = self.matching(name, predicate)?;
        self.statement(StatementKind::Select, Some(name), matched.len())?;
        let table = self.table(name)?;
        let names = table.schema.column_names();
        let columns = Arc::new(ColumnInfo::new(names.clone()));
        Ok(matched
            .iter()
            .filter_map(|rowid| table.row(*rowid))
            .map(|row| {
                let values = names
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                Row::with_columns(Arc::clone(&columns), values)
            })
            .collect())
    }

    fn begin(&mut self) -> Result<(), Error> {
        if self.snapshot.is_some() {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "a transaction is already open".to_string(),
            }));
        }
        self.statement(StatementKind::Begin, None, 0)?;
        self.snapshot = Some(self.tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        if self.snapshot.is_none() {
            return Err(not_active());
        }
        self.statement(StatementKind::Commit, None, 0)?;
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let Some(snapshot) = self.snapshot.take() else {
            return Err(not_active());
        };
        self.tables = snapshot;
        self.statement(StatementKind::Rollback, None, 0)
    }
}

/// Sequential version-4 shaped UUIDs, so test runs are reproducible.
fn next_uuid(counter: &mut u64) -> Value {
    *counter += 1;
    let mut bytes = [0u8; 16];
    bytes[8..].copy_from_slice(&counter.to_be_bytes());
    bytes[6] = 0x40;
    bytes[8] = 0x80 | (bytes[8] & 0x3f);
    Value::Uuid(bytes)
}

fn not_active() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: "no transaction is open".to_string(),
    })
}

/// A shared in-memory database.
///
/// Clones share the same tables, transaction and statement log.
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<State>>,
    multi_row: bool,
}

impl MemoryDriver {
    /// Create empty tables for every entity and junction in the registry.
    pub fn new(registry: &Registry) -> Self {
        let tables = schemas(registry)
            .into_iter()
            .map(|schema| (schema.name.clone(), Table::new(schema)))
            .collect();
        tracing::debug!(tables = registry.entities().count(), "Memory database created");
        Self {
            state: Arc::new(Mutex::new(State {
                tables,
                ..State::default()
            })),
            multi_row: true,
        }
    }

    /// Accept only single-row inserts when `enabled` is false.
    #[must_use]
    pub fn with_multi_row_insert(mut self, enabled: bool) -> Self {
        self.multi_row = enabled;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next statement of `kind` on `table` fail.
    ///
    /// Transaction control statements match regardless of `table`.
    pub fn fail_next(&self, table: &str, kind: StatementKind) {
        let table = match kind {
            StatementKind::Begin | StatementKind::Commit | StatementKind::Rollback => None,
            _ => Some(table.to_string()),
        };
        self.lock().failures.push((table, kind));
    }

    /// Every statement issued so far, including failed ones.
    pub fn statements(&self) -> Vec<LoggedStatement> {
        self.lock().log.clone()
    }

    /// Number of statements issued so far.
    pub fn round_trips(&self) -> usize {
        self.lock().log.len()
    }

    pub fn count(&self, kind: StatementKind) -> usize {
        self.lock().log.iter().filter(|s| s.kind == kind).count()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// All rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows().map(|(_, row)| row.clone()).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Table::len)
    }

    /// The row with this primary key.
    pub fn fetch(&self, table: &str, identifier: &Identifier) -> Option<StoredRow> {
        let state = self.lock();
        let table = state.tables.get(table)?;
        let key: Vec<Value> = table
            .schema
            .primary
            .iter()
            .map(|c| identifier.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let rowid = table.find_key(&key)?;
        table.row(rowid).cloned()
    }

    pub fn insert_sync(&self, table: &str, batch: &InsertBatch) -> Result<Vec<Row>, Error> {
        let result = self.lock().insert(table, batch, self.multi_row);
        trace_result(StatementKind::Insert, table, &result);
        result
    }

    pub fn update_sync(&self, table: &str, predicate: &Predicate, changes: &[(String, Value)]) -> Result<u64, Error> {
        let result = self.lock().update(table, predicate, changes);
        trace_result(StatementKind::Update, table, &result);
        result
    }

    pub fn delete_sync(&self, table: &str, predicate: &Predicate) -> Result<u64, Error> {
        let result = self.lock().delete(table, predicate);
        trace_result(StatementKind::Delete, table, &result);
        result
    }

    pub fn select_sync(&self, table: &str, predicate: &Predicate) -> Result<Vec<Row>, Error> {
        self.lock().select(table, predicate)
    }

    pub fn begin_sync(&self) -> Result<(), Error> {
        self.lock().begin()
    }

    pub fn commit_sync(&self) -> Result<(), Error> {
        self.lock().commit()
    }

    pub fn rollback_sync(&self) -> Result<(), Error> {
        self.lock().rollback()
    }
}

fn trace_result<T>(kind: StatementKind, table: &str, result: &Result<T, Error>) {
    if let Err(e) = result {
        tracing::debug!(statement = kind.as_str(), table, error = %e, "Statement failed");
    }
}

impl Driver for MemoryDriver {
    fn insert_rows(
        &self,
        _cx: &Cx,
        table: &str,
        batch: &InsertBatch,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.insert_sync(table, batch);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn update_rows(
        &self,
        _cx: &Cx,
        table: &str,
        predicate: &Predicate,
        changes: &[(String, Value)],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.update_sync(table, predicate, changes);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn delete_rows(
        &self,
        _cx: &Cx,
        table: &str,
        predicate: &Predicate,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.delete_sync(table, predicate);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn select_rows(
        &self,
        _cx: &Cx,
        table: &str,
        predicate: &Predicate,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.select_sync(table, predicate);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn in_transaction(&self) -> bool {
        self.lock().snapshot.is_some()
    }

    fn supports_multi_row_insert(&self) -> bool {
        self.multi_row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascadia_core::{
        Cascade, ColumnMetadata, EntityMetadata, JunctionDescriptor, RelationMetadata, SqlType,
    };

    fn registry(on_delete: ReferentialAction) -> Registry {
        Registry::builder()
            .entity(
                EntityMetadata::new("Author", "authors")
                    .column(ColumnMetadata::increment_id("id"))
                    .column(ColumnMetadata::new("name", SqlType::Text))
                    .column(ColumnMetadata::new("token", SqlType::Uuid).generated(Generation::Uuid)),
            )
            .entity(
                EntityMetadata::new("Book", "books")
                    .column(ColumnMetadata::increment_id("id"))
                    .column(ColumnMetadata::new("title", SqlType::Text).nullable())
                    .column(ColumnMetadata::new("author_id", SqlType::BigInt).nullable())
                    .column(
                        ColumnMetadata::new("status", SqlType::Text)
                            .default_value(Value::Text("draft".into())),
                    )
                    .relation(
                        RelationMetadata::many_to_one("author", "Author", "author_id")
                            .cascade(Cascade::SAVE)
                            .on_delete(on_delete),
                    )
                    .relation(RelationMetadata::many_to_many(
                        "shelves",
                        "Shelf",
                        JunctionDescriptor::new("book_shelves", "book_id", "shelf_id"),
                    )),
            )
            .entity(EntityMetadata::new("Shelf", "shelves").column(ColumnMetadata::increment_id("id")))
            .build()
            .unwrap()
    }

    fn batch(columns: &[&str], rows: Vec<Vec<Value>>) -> InsertBatch {
        let mut batch = InsertBatch::new(columns.iter().map(|c| (*c).to_string()).collect());
        for row in rows {
            batch.push(row);
        }
        batch
    }

    fn author(driver: &MemoryDriver, name: &str) -> i64 {
        let rows = driver
            .insert_sync("authors", &batch(&["name"], vec![vec![Value::Text(name.into())]]))
            .unwrap();
        rows[0].get_by_name("id").and_then(Value::as_i64).unwrap()
    }

    #[test]
    fn insert_returns_generated_values_in_order() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        let rows = driver
            .insert_sync(
                "authors",
                &batch(
                    &["id", "name"],
                    vec![
                        vec![Value::Default, Value::Text("a".into())],
                        vec![Value::Default, Value::Text("b".into())],
                    ],
                ),
            )
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_by_name("id"), Some(&Value::BigInt(1)));
        assert_eq!(rows[1].get_by_name("id"), Some(&Value::BigInt(2)));
        assert!(matches!(rows[0].get_by_name("token"), Some(Value::Uuid(_))));
        assert_ne!(rows[0].get_by_name("token"), rows[1].get_by_name("token"));
        assert_eq!(rows[0].get_by_name("name"), None);
    }

    #[test]
    fn defaults_fill_omitted_columns() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        let rows = driver
            .insert_sync("books", &batch(&["title"], vec![vec![Value::Null]]))
            .unwrap();
        assert_eq!(rows[0].get_by_name("status"), Some(&Value::Text("draft".into())));
        assert_eq!(rows[0].get_by_name("title"), None);

        let stored = driver.fetch("books", &Identifier::single("id", 1_i64)).unwrap();
        assert_eq!(stored.get("title"), Some(&Value::Null));
        assert_eq!(stored.get("author_id"), Some(&Value::Null));
    }

    #[test]
    fn constraint_violations_leave_table_untouched() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        author(&driver, "a");

        let duplicate = driver.insert_sync(
            "authors",
            &batch(
                &["id", "name"],
                vec![
                    vec![Value::BigInt(5), Value::Text("b".into())],
                    vec![Value::BigInt(1), Value::Text("c".into())],
                ],
            ),
        );
        assert!(duplicate.unwrap_err().to_string().contains("UNIQUE"));
        assert_eq!(driver.row_count("authors"), 1);

        let missing_name = driver.insert_sync("authors", &batch(&["name"], vec![vec![Value::Null]]));
        assert!(missing_name.unwrap_err().to_string().contains("NOT NULL"));

        let dangling = driver.insert_sync("books", &batch(&["author_id"], vec![vec![Value::BigInt(9)]]));
        assert!(dangling.unwrap_err().to_string().contains("FOREIGN KEY"));
        assert_eq!(driver.row_count("books"), 0);
    }

    #[test]
    fn delete_applies_referential_actions() {
        let restrict = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        let id = author(&restrict, "a");
        restrict
            .insert_sync("books", &batch(&["author_id"], vec![vec![Value::BigInt(id)]]))
            .unwrap();
        let err = restrict
            .delete_sync("authors", &Predicate::Eq("id".into(), Value::BigInt(id)))
            .unwrap_err();
        assert!(err.to_string().contains("still referenced"));
        assert_eq!(restrict.row_count("authors"), 1);

        let cascade = MemoryDriver::new(&registry(ReferentialAction::Cascade));
        let id = author(&cascade, "a");
        cascade
            .insert_sync("books", &batch(&["author_id"], vec![vec![Value::BigInt(id)]]))
            .unwrap();
        assert_eq!(
            cascade
                .delete_sync("authors", &Predicate::Eq("id".into(), Value::BigInt(id)))
                .unwrap(),
            1
        );
        assert_eq!(cascade.row_count("books"), 0);

        let set_null = MemoryDriver::new(&registry(ReferentialAction::SetNull));
        let id = author(&set_null, "a");
        set_null
            .insert_sync("books", &batch(&["author_id"], vec![vec![Value::BigInt(id)]]))
            .unwrap();
        set_null
            .delete_sync("authors", &Predicate::Eq("id".into(), Value::BigInt(id)))
            .unwrap();
        assert_eq!(set_null.rows("books")[0].get("author_id"), Some(&Value::Null));
    }

    #[test]
    fn junction_rows_are_unique_and_checked() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        driver
            .insert_sync("books", &batch(&["title"], vec![vec![Value::Null]]))
            .unwrap();
        driver
            .insert_sync("shelves", &batch(&["id"], vec![vec![Value::Default]]))
            .unwrap();

        let link = batch(&["book_id", "shelf_id"], vec![vec![Value::BigInt(1), Value::BigInt(1)]]);
        driver.insert_sync("book_shelves", &link).unwrap();
        assert!(driver.insert_sync("book_shelves", &link).is_err());

        let err = driver
            .delete_sync("books", &Predicate::Eq("id".into(), Value::BigInt(1)))
            .unwrap_err();
        assert!(err.to_string().contains("book_shelves"));
    }

    #[test]
    fn update_counts_matches_and_checks_constraints() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        author(&driver, "a");
        author(&driver, "b");

        let all = Predicate::And(Vec::new());
        let changed = driver
            .update_sync("authors", &all, &[("name".into(), Value::Text("z".into()))])
            .unwrap();
        assert_eq!(changed, 2);

        let none = Predicate::Eq("id".into(), Value::BigInt(42));
        assert_eq!(
            driver
                .update_sync("authors", &none, &[("name".into(), Value::Text("y".into()))])
                .unwrap(),
            0
        );

        let err = driver
            .update_sync("authors", &all, &[("name".into(), Value::Null)])
            .unwrap_err();
        assert!(err.to_string().contains("NOT NULL"));
        assert!(driver
            .rows("authors")
            .iter()
            .all(|r| r.get("name") == Some(&Value::Text("z".into()))));
    }

    #[test]
    fn transactions_snapshot_and_restore() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        author(&driver, "kept");

        driver.begin_sync().unwrap();
        assert!(driver.in_transaction());
        assert!(matches!(
            driver.begin_sync(),
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                ..
            }))
        ));
        author(&driver, "dropped");
        driver.rollback_sync().unwrap();
        assert_eq!(driver.row_count("authors"), 1);

        driver.begin_sync().unwrap();
        author(&driver, "committed");
        driver.commit_sync().unwrap();
        assert_eq!(driver.row_count("authors"), 2);
        assert!(driver.commit_sync().is_err());
    }

    #[test]
    fn injected_failures_fire_once() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction));
        driver.fail_next("authors", StatementKind::Insert);

        assert!(driver.insert_sync("authors", &batch(&["name"], vec![vec![Value::Text("a".into())]])).is_err());
        assert_eq!(author(&driver, "b"), 1);
        assert_eq!(driver.count(StatementKind::Insert), 2);
        assert_eq!(driver.round_trips(), 2);
    }

    #[test]
    fn single_row_mode_rejects_batches() {
        let driver = MemoryDriver::new(&registry(ReferentialAction::NoAction)).with_multi_row_insert(false);
        assert!(!driver.supports_multi_row_insert());
        let rows = vec![vec![Value::Text("a".into())], vec![Value::Text("b".into())]];
        assert!(driver.insert_sync("authors", &batch(&["name"], rows)).is_err());
    }
}
