//! In-memory reference driver for Cascadia.
//!
//! [`MemoryDriver`] stores rows in process memory and enforces the
//! constraints a relational database would: primary key uniqueness,
//! NOT NULL columns and foreign keys with their `ON DELETE` actions. Tables
//! are derived from a [`Registry`](cascadia_core::Registry), junction tables
//! included.
//!
//! It is meant for tests and examples, so it also records every statement
//! and can be told to fail the next statement of a given kind.
//!
//! # Example
//!
//! ```rust,ignore
//! use cascadia_memory::MemoryDriver;
//! use cascadia_core::StatementKind;
//!
//! let driver = MemoryDriver::new(&registry);
//! driver.fail_next("posts", StatementKind::Insert);
//!
//! // ... run a save through a Persister ...
//!
//! assert_eq!(driver.row_count("posts"), 0);
//! println!("{} round trips", driver.round_trips());
//! ```
//!
//! # Transactions
//!
//! `begin` snapshots every table and `rollback` restores the snapshot.
//! Only one transaction can be open at a time; nested `begin` fails with
//! [`TransactionErrorKind::AlreadyActive`](cascadia_core::TransactionErrorKind::AlreadyActive).

pub mod driver;
pub mod table;

pub use driver::{LoggedStatement, MemoryDriver};
pub use table::{ColumnSchema, Reference, StoredRow, TableSchema};
