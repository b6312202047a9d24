//! Loading entities by primary key.
//!
//! Loaded entities carry a [`Baseline`], so a later save diffs against what
//! was read instead of looking the row up again. To-many relations named in
//! [`FindOptions::relations`] have their target identifiers recorded in the
//! baseline, which makes removals from those collections persistable.

use crate::config::FindOptions;
use crate::subject::identifier_of;
use cascadia_core::{
    Baseline, ConfigError, Driver, Entity, EntityMetadata, EntityRef, Error, Identifier,
    JunctionSide, Predicate, RelationKind, RelationMetadata, Registry, Row, Value,
};
use asupersync::{Cx, Outcome};
use std::collections::BTreeMap;

/// Build an entity from a full row, with the row as its baseline.
pub(crate) fn entity_from_row(metadata: &EntityMetadata, row: &Row) -> Entity {
    let mut entity = Entity::new(metadata.name.as_str());
    let mut columns = BTreeMap::new();
    for column in &metadata.columns {
        if let Some(value) = row.get_by_name(&column.column_name) {
            entity.set(&column.property_path, value.clone());
            columns.insert(column.column_name.clone(), value.clone());
        }
    }
    entity.set_baseline(Some(Baseline {
        columns,
        relations: BTreeMap::new(),
    }));
    entity
}

fn key_of(metadata: &EntityMetadata, values: Vec<Value>) -> Option<Identifier> {
    if values.iter().any(Value::is_null) {
        return None;
    }
    let columns: Vec<String> = metadata
        .primary_columns()
        .map(|c| c.column_name.clone())
        .collect();
    if columns.len() != values.len() {
        return None;
    }
    Some(Identifier::new(columns.into_iter().zip(values).collect()))
}

fn equals(columns: &[String], values: Vec<Value>) -> Predicate {
    Predicate::And(
        columns
            .iter()
            .cloned()
            .zip(values)
            .map(|(c, v)| Predicate::Eq(c, v))
            .collect(),
    )
}

#[tracing::instrument(level = "debug", skip_all, fields(entity = type_name))]
pub(crate) async fn find_by_id<D: Driver>(
    cx: &Cx,
    driver: &D,
    registry: &Registry,
    type_name: &str,
    identifier: &Identifier,
    options: &FindOptions,
) -> Outcome<Option<EntityRef>, Error> {
    let metadata = match registry.metadata(type_name) {
        Ok(metadata) => metadata.clone(),
        Err(e) => return Outcome::Err(e),
    };

    let mut predicate = Predicate::identifier(identifier);
    if !options.with_deleted {
        if let Some(column) = metadata.delete_date_column() {
            predicate = predicate.and(Predicate::IsNull(column.column_name.clone()));
        }
    }

    let rows = match driver.select_rows(cx, &metadata.table, &predicate).await {
        Outcome::Ok(rows) => rows,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    let Some(row) = rows.first() else {
        tracing::debug!(identifier = %identifier, "Not found");
        return Outcome::Ok(None);
    };
    let entity = EntityRef::new(entity_from_row(&metadata, row));

    for name in &options.relations {
        let Some(relation) = metadata.relation_named(name) else {
            return Outcome::Err(Error::Config(ConfigError::new(format!(
                "{} has no relation named {}",
                metadata.name, name
            ))));
        };
        match load_relation(cx, driver, registry, &metadata, &entity, row, relation).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    }

    Outcome::Ok(Some(entity))
}

async fn load_relation<D: Driver>(
    cx: &Cx,
    driver: &D,
    registry: &Registry,
    metadata: &EntityMetadata,
    entity: &EntityRef,
    row: &Row,
    relation: &RelationMetadata,
) -> Outcome<(), Error> {
    let target_meta = match registry.metadata(&relation.target) {
        Ok(target) => target.clone(),
        Err(e) => return Outcome::Err(e),
    };
    let own_key: Vec<Value> = metadata
        .primary_columns()
        .map(|c| row.get_by_name(&c.column_name).cloned().unwrap_or(Value::Null))
        .collect();

    let predicate = match relation.kind {
        RelationKind::ManyToOne | RelationKind::OneToOne if relation.is_owner() => {
            let values: Vec<Value> = relation
                .join_columns
                .iter()
                .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                .collect();
            match key_of(&target_meta, values) {
                Some(key) => Predicate::identifier(&key),
                None => {
                    entity.write().set_ref(&relation.property, None);
                    return Outcome::Ok(());
                }
            }
        }
        RelationKind::ManyToOne | RelationKind::OneToOne | RelationKind::OneToMany => {
            let join_columns = relation
                .inverse
                .as_deref()
                .and_then(|inverse| target_meta.relation_named(inverse))
                .map(|r| r.join_columns.clone())
                .unwrap_or_default();
            equals(&join_columns, own_key)
        }
        RelationKind::ManyToMany => {
            let Some((info, side)) = registry.junction_for(&metadata.name, &relation.property) else {
                return Outcome::Err(Error::Config(ConfigError::new(format!(
                    "no junction behind {}.{}",
                    metadata.name, relation.property
                ))));
            };
            let other = match side {
                JunctionSide::Owner => JunctionSide::Inverse,
                JunctionSide::Inverse => JunctionSide::Owner,
            };
            let links = match driver
                .select_rows(cx, &info.descriptor.table, &equals(info.columns(side), own_key))
                .await
            {
                Outcome::Ok(links) => links,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let keys: Vec<Identifier> = links
                .iter()
                .filter_map(|link| {
                    let values = info
                        .columns(other)
                        .iter()
                        .map(|c| link.get_by_name(c).cloned().unwrap_or(Value::Null))
                        .collect();
                    key_of(&target_meta, values)
                })
                .collect();
            if keys.is_empty() {
                let mut guard = entity.write();
                guard.set_refs(&relation.property, Vec::new());
                record_loaded(&mut guard, &relation.property, Vec::new());
                return Outcome::Ok(());
            }
            Predicate::any_identifier(&keys)
        }
    };

    let rows = match driver.select_rows(cx, &target_meta.table, &predicate).await {
        Outcome::Ok(rows) => rows,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };
    let targets: Vec<EntityRef> = rows
        .iter()
        .map(|r| EntityRef::new(entity_from_row(&target_meta, r)))
        .collect();
    tracing::trace!(relation = %relation.property, loaded = targets.len(), "Relation loaded");

    let mut guard = entity.write();
    if relation.kind.is_to_many() {
        let ids = targets
            .iter()
            .filter_map(|t| identifier_of(&target_meta, t))
            .collect();
        guard.set_refs(&relation.property, targets);
        record_loaded(&mut guard, &relation.property, ids);
    } else {
        guard.set_ref(&relation.property, targets.into_iter().next());
    }
    Outcome::Ok(())
}

fn record_loaded(entity: &mut Entity, relation: &str, ids: Vec<Identifier>) {
    let mut baseline = entity.baseline().cloned().unwrap_or_default();
    baseline.relations.insert(relation.to_string(), ids);
    entity.set_baseline(Some(baseline));
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascadia_core::{ColumnMetadata, SqlType};

    #[test]
    fn row_becomes_entity_with_baseline() {
        let metadata = EntityMetadata::new("User", "users")
            .column(ColumnMetadata::increment_id("id"))
            .column(ColumnMetadata::new("address.city", SqlType::Text).column("city").nullable());
        let row = Row::new(
            vec!["id".into(), "city".into()],
            vec![Value::BigInt(4), Value::Null],
        );

        let entity = entity_from_row(&metadata, &row);
        assert_eq!(entity.value("id"), Some(&Value::BigInt(4)));
        assert_eq!(entity.value("address.city"), Some(&Value::Null));
        let baseline = entity.baseline().unwrap();
        assert_eq!(baseline.columns.get("city"), Some(&Value::Null));
        assert!(baseline.relations.is_empty());
    }

    #[test]
    fn null_foreign_key_has_no_target() {
        let target = EntityMetadata::new("Category", "categories")
            .column(ColumnMetadata::increment_id("id"));
        assert!(key_of(&target, vec![Value::Null]).is_none());
        assert!(key_of(&target, vec![]).is_none());
        assert_eq!(
            key_of(&target, vec![Value::BigInt(2)]).map(|k| k.to_string()),
            Some("id=2".to_string())
        );
    }
}
