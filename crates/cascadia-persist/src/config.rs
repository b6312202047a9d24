//! Per-call options and persister configuration.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Rows per lookup statement when prefetching persisted state.
pub const PREFETCH_CHUNK: usize = 500;

/// Options for one `save` / `remove` / `soft_remove` / `recover` call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct PersistOptions {
    /// Run entity listeners and subscribers.
    pub listeners: bool,
    /// Wrap the call in its own transaction unless one is already open.
    pub transaction: bool,
    /// Write generated values back onto the entities and refresh their
    /// baselines afterwards.
    pub reload: bool,
    /// Maximum rows per multi-row insert or delete. `None` means no limit.
    pub chunk: Option<usize>,
    /// Look up the persisted state of identified entities that carry no
    /// baseline before computing changes.
    pub prefetch: bool,
    /// Delete rows of soft-deletable types instead of stamping them.
    pub permanent: bool,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            listeners: true,
            transaction: true,
            reload: true,
            chunk: None,
            prefetch: true,
            permanent: false,
        }
    }
}

impl PersistOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn listeners(mut self, value: bool) -> Self {
        self.listeners = value;
        self
    }

    #[must_use]
    pub fn transaction(mut self, value: bool) -> Self {
        self.transaction = value;
        self
    }

    #[must_use]
    pub fn reload(mut self, value: bool) -> Self {
        self.reload = value;
        self
    }

    /// Limit multi-row statements to `rows` rows. Zero is treated as one.
    #[must_use]
    pub fn chunk(mut self, rows: usize) -> Self {
        self.chunk = Some(rows.max(1));
        self
    }

    #[must_use]
    pub fn prefetch(mut self, value: bool) -> Self {
        self.prefetch = value;
        self
    }

    #[must_use]
    pub fn permanent(mut self, value: bool) -> Self {
        self.permanent = value;
        self
    }
}

/// Options for [`Persister::find_by_id`](crate::Persister::find_by_id).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    /// Include soft-deleted rows.
    pub with_deleted: bool,
    /// Relations to load along with the entity. Loaded to-many relations
    /// become part of the baseline, so removals from them are persisted.
    pub relations: Vec<String>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deleted(mut self, value: bool) -> Self {
        self.with_deleted = value;
        self
    }

    #[must_use]
    pub fn relation(mut self, name: impl Into<String>) -> Self {
        self.relations.push(name.into());
        self
    }
}

/// Source of timestamps, in microseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Configuration shared by every call on a persister.
#[derive(Clone)]
pub struct PersisterConfig {
    /// Options used by the calls that take none.
    pub defaults: PersistOptions,
    /// Clock for create/update/delete date columns.
    pub clock: Clock,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            defaults: PersistOptions::default(),
            clock: Arc::new(system_clock),
        }
    }
}

impl PersisterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn defaults(mut self, options: PersistOptions) -> Self {
        self.defaults = options;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl fmt::Debug for PersisterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersisterConfig")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

fn system_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = PersistOptions::default();
        assert!(options.listeners);
        assert!(options.transaction);
        assert!(options.reload);
        assert!(options.prefetch);
        assert!(!options.permanent);
        assert_eq!(options.chunk, None);
    }

    #[test]
    fn builder_setters() {
        let options = PersistOptions::new().listeners(false).chunk(0).permanent(true);
        assert!(!options.listeners);
        assert_eq!(options.chunk, Some(1));
        assert!(options.permanent);

        let find = FindOptions::new().with_deleted(true).relation("tags");
        assert!(find.with_deleted);
        assert_eq!(find.relations, vec!["tags".to_string()]);
    }

    #[test]
    fn custom_clock() {
        let config = PersisterConfig::new().clock(|| 42);
        assert_eq!((config.clock)(), 42);
        assert!((PersisterConfig::default().clock)() > 0);
    }
}
