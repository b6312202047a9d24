//! Table storage and schema derived from a [`Registry`].

use cascadia_core::{
    Error, Generation, QueryError, QueryErrorKind, ReferentialAction, Registry, Value, hash_values,
};
use std::collections::{BTreeMap, HashMap};

/// One stored row, keyed by column name.
pub type StoredRow = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub nullable: bool,
    pub generation: Option<Generation>,
    pub default: Option<Value>,
}

/// A foreign key from `columns` to the primary key of `table`.
#[derive(Debug, Clone)]
pub struct Reference {
    pub columns: Vec<String>,
    pub table: String,
    pub on_delete: ReferentialAction,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary: Vec<String>,
    pub references: Vec<Reference>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Build the schema of every entity table and junction table.
pub fn schemas(registry: &Registry) -> Vec<TableSchema> {
    let mut tables: Vec<TableSchema> = Vec::new();

    for metadata in registry.entities() {
        let references = metadata
            .relations
            .iter()
            .filter(|r| r.is_owner() && !r.join_columns.is_empty())
            .filter_map(|r| {
                let target = registry.get(&r.target)?;
                Some(Reference {
                    columns: r.join_columns.clone(),
                    table: target.table.clone(),
                    on_delete: r.on_delete,
                })
            })
            .collect();
        tables.push(TableSchema {
            name: metadata.table.clone(),
            columns: metadata
                .columns
                .iter()
                .map(|c| ColumnSchema {
                    name: c.column_name.clone(),
                    nullable: c.nullable,
                    generation: c.generation,
                    default: c.default.clone(),
                })
                .collect(),
            primary: metadata
                .primary_columns()
                .map(|c| c.column_name.clone())
                .collect(),
            references,
        });
    }

    for junction in registry.junctions() {
        let descriptor = &junction.descriptor;
        if tables.iter().any(|t| t.name == descriptor.table) {
            continue;
        }
        let columns: Vec<String> = descriptor
            .owner_columns
            .iter()
            .chain(&descriptor.inverse_columns)
            .cloned()
            .collect();
        let mut references = Vec::new();
        for (entity, fk) in [
            (&junction.owner, &descriptor.owner_columns),
            (&junction.inverse, &descriptor.inverse_columns),
        ] {
            if let Some(target) = registry.get(entity) {
                references.push(Reference {
                    columns: fk.clone(),
                    table: target.table.clone(),
                    on_delete: ReferentialAction::NoAction,
                });
            }
        }
        tables.push(TableSchema {
            name: descriptor.table.clone(),
            columns: columns
                .iter()
                .map(|name| ColumnSchema {
                    name: name.clone(),
                    nullable: false,
                    generation: None,
                    default: None,
                })
                .collect(),
            primary: columns,
            references,
        });
    }

    tables
}

pub(crate) fn constraint(table: &str, message: impl Into<String>) -> Error {
    Error::constraint(table, message)
}

pub(crate) fn query_error(kind: QueryErrorKind, statement: &str, message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind,
        statement: Some(statement.to_string()),
        message: message.into(),
        source: None,
    })
}

/// Values of `columns` in `row`, `None` if any is NULL or missing.
pub(crate) fn key_values(row: &StoredRow, columns: &[String]) -> Option<Vec<Value>> {
    columns
        .iter()
        .map(|c| row.get(c).filter(|v| !v.is_null()).cloned())
        .collect()
}

/// Rows of one table plus its primary key index.
#[derive(Debug, Clone)]
pub struct Table {
    pub schema: TableSchema,
    rows: BTreeMap<u64, StoredRow>,
    next_rowid: u64,
    next_increment: i64,
    primary_index: HashMap<u64, Vec<u64>>,
}

impl Table {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_rowid: 1,
            next_increment: 1,
            primary_index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order.
    pub fn rows(&self) -> impl Iterator<Item = (u64, &StoredRow)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    pub fn row(&self, rowid: u64) -> Option<&StoredRow> {
        self.rows.get(&rowid)
    }

    pub(crate) fn next_increment(&mut self) -> i64 {
        let next = self.next_increment;
        self.next_increment += 1;
        next
    }

    /// Keep the counter ahead of explicitly supplied keys.
    pub(crate) fn observe_increment(&mut self, value: &Value) {
        if let Some(v) = value.as_i64() {
            self.next_increment = self.next_increment.max(v + 1);
        }
    }

    /// Rowid of the row with this primary key.
    pub fn find_key(&self, key: &[Value]) -> Option<u64> {
        let candidates = self.primary_index.get(&hash_values(key))?;
        candidates.iter().copied().find(|rowid| {
            self.rows.get(rowid).is_some_and(|row| {
                self.schema
                    .primary
                    .iter()
                    .zip(key)
                    .all(|(c, v)| row.get(c).is_some_and(|stored| stored.same_as(v)))
            })
        })
    }

    fn primary_key(&self, row: &StoredRow) -> Vec<Value> {
        self.schema
            .primary
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub(crate) fn push(&mut self, row: StoredRow) -> u64 {
        let rowid = self.next_rowid;
        self.next_rowid += 1;
        let key = self.primary_key(&row);
        self.primary_index
            .entry(hash_values(&key))
            .or_default()
            .push(rowid);
        self.rows.insert(rowid, row);
        rowid
    }

    pub(crate) fn remove(&mut self, rowid: u64) -> Option<StoredRow> {
        let row = self.rows.remove(&rowid)?;
        let hash = hash_values(&self.primary_key(&row));
        if let Some(ids) = self.primary_index.get_mut(&hash) {
            ids.retain(|id| *id != rowid);
            if ids.is_empty() {
                self.primary_index.remove(&hash);
            }
        }
        Some(row)
    }

    pub(crate) fn replace(&mut self, rowid: u64, row: StoredRow) {
        if self.remove(rowid).is_some() {
            let key = self.primary_key(&row);
            self.primary_index
                .entry(hash_values(&key))
                .or_default()
                .push(rowid);
            self.rows.insert(rowid, row);
        }
    }

    /// Check NOT NULL constraints of a complete row.
    pub(crate) fn check_not_null(&self, row: &StoredRow) -> Result<(), Error> {
        for column in &self.schema.columns {
            let null = row.get(&column.name).is_none_or(Value::is_null);
            if null && !column.nullable {
                return Err(constraint(
                    &self.schema.name,
                    format!("NOT NULL constraint failed: {}.{}", self.schema.name, column.name),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn check_columns<'a>(&self, columns: impl IntoIterator<Item = &'a String>) -> Result<(), Error> {
        for column in columns {
            if self.schema.column(column).is_none() {
                return Err(query_error(
                    QueryErrorKind::NotFound,
                    &self.schema.name,
                    format!("no such column: {}.{}", self.schema.name, column),
                ));
            }
        }
        Ok(())
    }
}
