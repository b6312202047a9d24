//! Primitive write interface consumed by the persistence engine.
//!
//! The engine never produces SQL text. It talks to a [`Driver`] in terms of
//! tables, column/value lists and [`Predicate`]s; translating those into a
//! dialect is the driver's business.
//!
//! - [`Driver`] - async primitives plus transaction control
//! - [`QueryRunner`] - object-safe subset handed to lifecycle hooks
//! - [`Predicate`] - row filters for update/delete/select
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::entity::Identifier;
use crate::error::Error;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// A row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column = value`
    Eq(String, Value),
    /// `column IS NULL`
    IsNull(String),
    /// `(c1, c2, ..) IN ((v1, v2, ..), ..)`
    In {
        columns: Vec<String>,
        tuples: Vec<Vec<Value>>,
    },
    /// Conjunction of all parts. An empty `And` matches every row.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Match a single row by primary key.
    pub fn identifier(id: &Identifier) -> Self {
        let mut parts: Vec<Predicate> = id
            .parts()
            .iter()
            .map(|(c, v)| Predicate::Eq(c.clone(), v.clone()))
            .collect();
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::And(parts)
        }
    }

    /// Match any of the given primary keys.
    pub fn any_identifier(ids: &[Identifier]) -> Self {
        let columns = ids
            .first()
            .map(|id| id.columns().map(str::to_string).collect())
            .unwrap_or_default();
        Predicate::In {
            columns,
            tuples: ids.iter().map(Identifier::values).collect(),
        }
    }

    /// Add another condition, flattening nested conjunctions.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Evaluate against a row, given a column lookup.
    ///
    /// Comparisons follow SQL: NULL never equals anything.
    pub fn matches<'a>(&self, lookup: &impl Fn(&str) -> Option<&'a Value>) -> bool {
        match self {
            Predicate::Eq(column, value) => match lookup(column) {
                Some(v) if !v.is_null() && !value.is_null() => v.same_as(value),
                _ => false,
            },
            Predicate::IsNull(column) => lookup(column).is_none_or(Value::is_null),
            Predicate::In { columns, tuples } => tuples.iter().any(|tuple| {
                columns.iter().zip(tuple).all(|(c, want)| {
                    lookup(c).is_some_and(|v| !v.is_null() && v.same_as(want))
                })
            }),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(lookup)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Eq(c, v) => write!(f, "{} = {}", c, v),
            Predicate::IsNull(c) => write!(f, "{} IS NULL", c),
            Predicate::In { columns, tuples } => {
                write!(f, "{} IN ({} keys)", columns.join(", "), tuples.len())
            }
            Predicate::And(parts) => {
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, " AND ")?;
                    }
                    write!(f, "{}", p)?;
                }
                Ok(())
            }
        }
    }
}

/// Rows for a single (possibly multi-row) insert.
///
/// Every row has one value per column. `Value::Default` asks the database to
/// fill in the column default or generated value.
#[derive(Debug, Clone, Default)]
pub struct InsertBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl InsertBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Kind of primitive statement, used by drivers for logging and by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    Select,
    Begin,
    Commit,
    Rollback,
}

impl StatementKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Select => "SELECT",
            StatementKind::Begin => "BEGIN",
            StatementKind::Commit => "COMMIT",
            StatementKind::Rollback => "ROLLBACK",
        }
    }
}

/// A database capable of executing the engine's primitive operations.
///
/// All operations are async and take a `Cx` context for cancellation/timeout
/// support. Implementations must be `Send + Sync`. Transaction state lives on
/// the driver: `begin` opens the ambient transaction that every following
/// primitive joins until `commit` or `rollback`.
pub trait Driver: Send + Sync {
    /// Insert rows and return, per inserted row, the values the database
    /// generated (identifiers, defaults). Rows come back in input order.
    fn insert_rows(
        &self,
        cx: &Cx,
        table: &str,
        batch: &InsertBatch,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Update matching rows and return how many matched.
    fn update_rows(
        &self,
        cx: &Cx,
        table: &str,
        predicate: &Predicate,
        changes: &[(String, Value)],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete matching rows and return how many were removed.
    fn delete_rows(
        &self,
        cx: &Cx,
        table: &str,
        predicate: &Predicate,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Read matching rows with all their columns.
    fn select_rows(
        &self,
        cx: &Cx,
        table: &str,
        predicate: &Predicate,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Open the ambient transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the ambient transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the ambient transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Whether a transaction is currently open.
    fn in_transaction(&self) -> bool;

    /// Whether `insert_rows` accepts more than one row per call.
    fn supports_multi_row_insert(&self) -> bool {
        true
    }
}

/// Boxed future returned by the object-safe [`QueryRunner`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe subset of [`Driver`] for use inside lifecycle hooks.
///
/// Statements issued through it join the engine's ambient transaction.
pub trait QueryRunner: Send + Sync {
    fn select<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        predicate: &'a Predicate,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;

    fn insert<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        batch: &'a InsertBatch,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;

    fn update<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        predicate: &'a Predicate,
        changes: &'a [(String, Value)],
    ) -> BoxFuture<'a, Outcome<u64, Error>>;

    fn delete<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        predicate: &'a Predicate,
    ) -> BoxFuture<'a, Outcome<u64, Error>>;
}

impl<D: Driver> QueryRunner for D {
    fn select<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        predicate: &'a Predicate,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(self.select_rows(cx, table, predicate))
    }

    fn insert<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        batch: &'a InsertBatch,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(self.insert_rows(cx, table, batch))
    }

    fn update<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        predicate: &'a Predicate,
        changes: &'a [(String, Value)],
    ) -> BoxFuture<'a, Outcome<u64, Error>> {
        Box::pin(self.update_rows(cx, table, predicate, changes))
    }

    fn delete<'a>(
        &'a self,
        cx: &'a Cx,
        table: &'a str,
        predicate: &'a Predicate,
    ) -> BoxFuture<'a, Outcome<u64, Error>> {
        Box::pin(self.delete_rows(cx, table, predicate))
    }
}
