//! Entity metadata: columns, relations and junction tables.
//!
//! Metadata is built at startup with the builder methods below and frozen
//! inside a [`Registry`](crate::registry::Registry). The persistence engine
//! only ever reads it.

use crate::events::EntityListener;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Column storage types, used to check bound values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    BigInt,
    Double,
    Decimal,
    Boolean,
    Text,
    Blob,
    Timestamp,
    Uuid,
    Json,
}

impl SqlType {
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Decimal => "DECIMAL",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Uuid => "UUID",
            SqlType::Json => "JSON",
        }
    }

    /// Whether a value can be stored in a column of this type.
    ///
    /// NULL and DEFAULT are accepted everywhere; nullability is checked
    /// separately.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null | Value::Default) => true,
            (SqlType::Integer | SqlType::BigInt, Value::Int(_) | Value::BigInt(_)) => true,
            (SqlType::Double, Value::Double(_) | Value::Int(_) | Value::BigInt(_)) => true,
            (SqlType::Decimal, Value::Decimal(_) | Value::Int(_) | Value::BigInt(_)) => true,
            (SqlType::Boolean, Value::Bool(_)) => true,
            (SqlType::Text, Value::Text(_)) => true,
            (SqlType::Blob, Value::Bytes(_)) => true,
            (SqlType::Timestamp, Value::Timestamp(_) | Value::BigInt(_)) => true,
            (SqlType::Uuid, Value::Uuid(_)) => true,
            (SqlType::Json, _) => true,
            _ => false,
        }
    }

    /// Convert a loosely typed value (e.g. parsed from JSON) to this type.
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (SqlType::Timestamp, Value::BigInt(v)) => Value::Timestamp(v),
            (SqlType::Integer, Value::BigInt(v)) => {
                i32::try_from(v).map_or(Value::BigInt(v), Value::Int)
            }
            (SqlType::Decimal, Value::Text(s)) => Value::Decimal(s),
            (SqlType::Uuid, Value::Text(s)) => parse_uuid(&s).map_or(Value::Text(s), Value::Uuid),
            (SqlType::Json, v @ (Value::Text(_) | Value::BigInt(_) | Value::Bool(_))) => {
                Value::Json(match v {
                    Value::Text(s) => serde_json::Value::String(s),
                    Value::BigInt(i) => serde_json::Value::from(i),
                    Value::Bool(b) => serde_json::Value::Bool(b),
                    _ => serde_json::Value::Null,
                })
            }
            (_, v) => v,
        }
    }
}

fn parse_uuid(s: &str) -> Option<[u8; 16]> {
    let hex: Vec<u8> = s.bytes().filter(|b| *b != b'-').collect();
    if hex.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, pair) in hex.chunks(2).enumerate() {
        let text = std::str::from_utf8(pair).ok()?;
        out[i] = u8::from_str_radix(text, 16).ok()?;
    }
    Some(out)
}

/// How a column value is produced when the entity does not set one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Database auto-increment.
    Increment,
    /// Database-generated UUID.
    Uuid,
}

/// Special role a column plays for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    /// Optimistic-lock counter.
    Version,
    /// Set from the clock on insert.
    CreateDate,
    /// Set from the clock on insert and every update.
    UpdateDate,
    /// Soft-delete marker; NULL means live.
    DeleteDate,
}

/// Metadata about one mapped column.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    /// Property path on the entity, dotted for embedded groups (`address.city`).
    pub property_path: String,
    /// Database column name.
    pub column_name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary: bool,
    pub generation: Option<Generation>,
    /// Value the database uses when the column is omitted.
    pub default: Option<Value>,
    pub role: Option<ColumnRole>,
}

impl ColumnMetadata {
    /// A non-null column. The column name defaults to the property path
    /// with dots replaced by underscores.
    pub fn new(property_path: impl Into<String>, sql_type: SqlType) -> Self {
        let property_path = property_path.into();
        let column_name = property_path.replace('.', "_");
        Self {
            property_path,
            column_name,
            sql_type,
            nullable: false,
            primary: false,
            generation: None,
            default: None,
            role: None,
        }
    }

    /// Auto-increment integer primary key.
    pub fn increment_id(property_path: impl Into<String>) -> Self {
        Self::new(property_path, SqlType::BigInt)
            .primary()
            .generated(Generation::Increment)
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column_name = name.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn generated(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn version(mut self) -> Self {
        self.role = Some(ColumnRole::Version);
        self
    }

    pub fn create_date(mut self) -> Self {
        self.role = Some(ColumnRole::CreateDate);
        self
    }

    pub fn update_date(mut self) -> Self {
        self.role = Some(ColumnRole::UpdateDate);
        self
    }

    /// Soft-delete column; always nullable.
    pub fn delete_date(mut self) -> Self {
        self.role = Some(ColumnRole::DeleteDate);
        self.nullable = true;
        self
    }

    pub fn is_generated(&self) -> bool {
        self.generation.is_some()
    }
}

/// The type of relationship between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Many `Post`s belong to one `Category`; the owner holds the foreign key.
    ManyToOne,
    /// One `User` has one `Profile`; the side with join columns owns it.
    OneToOne,
    /// One `Category` has many `Post`s; always the inverse side.
    OneToMany,
    /// `Post`s have many `Tag`s via a junction table.
    ManyToMany,
}

impl RelationKind {
    pub const fn is_to_many(&self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// Which operations propagate through a relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cascade {
    pub insert: bool,
    pub update: bool,
    pub remove: bool,
    pub soft_remove: bool,
    pub recover: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        insert: false,
        update: false,
        remove: false,
        soft_remove: false,
        recover: false,
    };

    pub const ALL: Cascade = Cascade {
        insert: true,
        update: true,
        remove: true,
        soft_remove: true,
        recover: true,
    };

    /// `insert` + `update`: the usual "save the graph" cascade.
    pub const SAVE: Cascade = Cascade {
        insert: true,
        update: true,
        remove: false,
        soft_remove: false,
        recover: false,
    };

    /// Parse a comma separated list (`"insert, update"`, `"all"`).
    ///
    /// Returns `None` for an unknown option.
    pub fn parse(options: &str) -> Option<Cascade> {
        let mut cascade = Cascade::NONE;
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match option.to_lowercase().as_str() {
                "all" | "true" => cascade = Cascade::ALL,
                "insert" => cascade.insert = true,
                "update" => cascade.update = true,
                "remove" => cascade.remove = true,
                "soft-remove" | "soft_remove" => cascade.soft_remove = true,
                "recover" => cascade.recover = true,
                _ => return None,
            }
        }
        Some(cascade)
    }

    pub const fn any(&self) -> bool {
        self.insert || self.update || self.remove || self.soft_remove || self.recover
    }
}

/// Referential action taken by the database when a referenced row is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReferentialAction {
    /// Raise an error if any references exist.
    #[default]
    NoAction,
    /// Same as NO ACTION.
    Restrict,
    /// Delete referencing rows.
    Cascade,
    /// Set referencing columns to NULL.
    SetNull,
}

impl ReferentialAction {
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
        }
    }
}

/// What happens to children removed from a loaded one-to-many collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrphanAction {
    /// Set the child's foreign key to NULL.
    #[default]
    Nullify,
    /// Delete the child row.
    Delete,
    /// Leave the child untouched.
    Disable,
}

/// A many-to-many junction table.
///
/// `owner_columns` reference the owning entity's primary key columns and
/// `inverse_columns` the target's, both positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionDescriptor {
    pub table: String,
    pub owner_columns: Vec<String>,
    pub inverse_columns: Vec<String>,
}

impl JunctionDescriptor {
    pub fn new(
        table: impl Into<String>,
        owner_column: impl Into<String>,
        inverse_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_columns: vec![owner_column.into()],
            inverse_columns: vec![inverse_column.into()],
        }
    }

    /// Junction between composite keys. Column order must match key order.
    pub fn composite(
        table: impl Into<String>,
        owner_columns: &[&str],
        inverse_columns: &[&str],
    ) -> Self {
        Self {
            table: table.into(),
            owner_columns: owner_columns.iter().map(|c| (*c).to_string()).collect(),
            inverse_columns: inverse_columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }
}

/// Metadata about a relation property.
#[derive(Debug, Clone)]
pub struct RelationMetadata {
    pub property: String,
    pub kind: RelationKind,
    /// Target entity type name.
    pub target: String,
    pub cascade: Cascade,
    /// Foreign key columns on this entity, positionally referencing the
    /// target's primary key. Only set on owning to-one sides.
    pub join_columns: Vec<String>,
    /// Property on the target pointing back at this relation.
    pub inverse: Option<String>,
    /// Junction table; only on the owning side of a many-to-many.
    pub junction: Option<JunctionDescriptor>,
    pub on_delete: ReferentialAction,
    pub orphan: OrphanAction,
    /// Filled in by the registry: all join columns nullable.
    pub nullable: bool,
}

impl RelationMetadata {
    fn new(property: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            kind,
            target: target.into(),
            cascade: Cascade::NONE,
            join_columns: Vec::new(),
            inverse: None,
            junction: None,
            on_delete: ReferentialAction::NoAction,
            orphan: OrphanAction::Nullify,
            nullable: true,
        }
    }

    pub fn many_to_one(
        property: impl Into<String>,
        target: impl Into<String>,
        join_column: impl Into<String>,
    ) -> Self {
        let mut rel = Self::new(property, RelationKind::ManyToOne, target);
        rel.join_columns.push(join_column.into());
        rel
    }

    /// One-to-one. Add [`join_columns`](Self::join_columns) on the owning side.
    pub fn one_to_one(property: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(property, RelationKind::OneToOne, target)
    }

    /// One-to-many, mirrored by the many-to-one `inverse` on the target.
    pub fn one_to_many(
        property: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        let mut rel = Self::new(property, RelationKind::OneToMany, target);
        rel.inverse = Some(inverse.into());
        rel
    }

    /// Owning side of a many-to-many.
    pub fn many_to_many(
        property: impl Into<String>,
        target: impl Into<String>,
        junction: JunctionDescriptor,
    ) -> Self {
        let mut rel = Self::new(property, RelationKind::ManyToMany, target);
        rel.junction = Some(junction);
        rel
    }

    /// Inverse side of a many-to-many owned by `inverse` on the target.
    pub fn many_to_many_inverse(
        property: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        let mut rel = Self::new(property, RelationKind::ManyToMany, target);
        rel.inverse = Some(inverse.into());
        rel
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn join_columns(mut self, columns: &[&str]) -> Self {
        self.join_columns = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn inverse(mut self, property: impl Into<String>) -> Self {
        self.inverse = Some(property.into());
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn orphan(mut self, action: OrphanAction) -> Self {
        self.orphan = action;
        self
    }

    /// Whether this side holds the foreign key or the junction.
    pub fn is_owner(&self) -> bool {
        match self.kind {
            RelationKind::ManyToOne => true,
            RelationKind::OneToOne => !self.join_columns.is_empty(),
            RelationKind::OneToMany => false,
            RelationKind::ManyToMany => self.junction.is_some(),
        }
    }
}

/// Metadata about an entity type.
#[derive(Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnMetadata>,
    pub relations: Vec<RelationMetadata>,
    pub listeners: Vec<Arc<dyn EntityListener>>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            relations: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, relation: RelationMetadata) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| c.primary)
    }

    pub fn column_named(&self, column_name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.column_name == column_name)
    }

    pub fn column_at(&self, property_path: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.property_path == property_path)
    }

    pub fn relation_named(&self, property: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.property == property)
    }

    pub fn column_with_role(&self, role: ColumnRole) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.role == Some(role))
    }

    pub fn version_column(&self) -> Option<&ColumnMetadata> {
        self.column_with_role(ColumnRole::Version)
    }

    pub fn delete_date_column(&self) -> Option<&ColumnMetadata> {
        self.column_with_role(ColumnRole::DeleteDate)
    }

    /// The owning to-one relation whose join columns include `column_name`.
    pub fn relation_for_join_column(&self, column_name: &str) -> Option<&RelationMetadata> {
        self.relations
            .iter()
            .find(|r| r.is_owner() && r.join_columns.iter().any(|c| c == column_name))
    }

    /// Whether any embedded group is rooted at `property`.
    pub fn has_embedded(&self, property: &str) -> bool {
        self.columns.iter().any(|c| {
            c.property_path
                .strip_prefix(property)
                .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("relations", &self.relations)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_defaults_and_embedded_names() {
        let col = ColumnMetadata::new("address.city", SqlType::Text);
        assert_eq!(col.column_name, "address_city");
        assert!(!col.nullable);

        let deleted = ColumnMetadata::new("deleted_at", SqlType::Timestamp).delete_date();
        assert!(deleted.nullable);
        assert_eq!(deleted.role, Some(ColumnRole::DeleteDate));
    }

    #[test]
    fn cascade_parse() {
        assert_eq!(Cascade::parse("all"), Some(Cascade::ALL));
        assert_eq!(Cascade::parse("insert, update"), Some(Cascade::SAVE));
        assert_eq!(Cascade::parse(""), Some(Cascade::NONE));
        assert!(Cascade::parse("explode").is_none());
        assert!(!Cascade::NONE.any());
    }

    #[test]
    fn ownership_by_kind() {
        assert!(RelationMetadata::many_to_one("category", "Category", "category_id").is_owner());
        assert!(!RelationMetadata::one_to_many("posts", "Post", "category").is_owner());
        assert!(!RelationMetadata::one_to_one("profile", "Profile").is_owner());
        assert!(
            RelationMetadata::one_to_one("profile", "Profile")
                .join_columns(&["profile_id"])
                .is_owner()
        );
        let junction = JunctionDescriptor::new("post_tags", "post_id", "tag_id");
        assert!(RelationMetadata::many_to_many("tags", "Tag", junction).is_owner());
        assert!(!RelationMetadata::many_to_many_inverse("posts", "Post", "tags").is_owner());
    }

    #[test]
    fn sql_type_acceptance_and_coercion() {
        assert!(SqlType::BigInt.accepts(&Value::Int(3)));
        assert!(!SqlType::Text.accepts(&Value::Int(3)));
        assert!(SqlType::Text.accepts(&Value::Null));
        assert_eq!(SqlType::Timestamp.coerce(Value::BigInt(5)), Value::Timestamp(5));
        assert_eq!(
            SqlType::Uuid.coerce(Value::Text("00000000-0000-0000-0000-0000000000ff".into())),
            Value::Uuid([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff])
        );
    }

    #[test]
    fn embedded_lookup() {
        let meta = EntityMetadata::new("User", "users")
            .column(ColumnMetadata::increment_id("id"))
            .column(ColumnMetadata::new("address.city", SqlType::Text));
        assert!(meta.has_embedded("address"));
        assert!(!meta.has_embedded("addr"));
        assert_eq!(meta.primary_columns().count(), 1);
        assert!(meta.column_named("address_city").is_some());
    }
}
