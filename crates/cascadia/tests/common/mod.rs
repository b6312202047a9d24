#![allow(dead_code)]

use cascadia::prelude::*;
use cascadia_memory::MemoryDriver;
use std::sync::Arc;

pub const NOW: i64 = 1_700_000_000_000_000;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

fn category() -> EntityMetadata {
    EntityMetadata::new("Category", "categories")
        .column(ColumnMetadata::increment_id("id"))
        .column(ColumnMetadata::new("name", SqlType::Text).nullable())
        .relation(RelationMetadata::one_to_many("posts", "Post", "category").cascade(Cascade::SAVE))
}

/// Posts belong to a category, carry tags and own their comments.
pub fn post() -> EntityMetadata {
    EntityMetadata::new("Post", "posts")
        .column(ColumnMetadata::increment_id("id"))
        .column(ColumnMetadata::new("title", SqlType::Text).nullable())
        .column(ColumnMetadata::new("version", SqlType::BigInt).version())
        .column(ColumnMetadata::new("category_id", SqlType::BigInt).nullable())
        .relation(RelationMetadata::many_to_one("category", "Category", "category_id").cascade(Cascade::SAVE))
        .relation(RelationMetadata::many_to_many(
            "tags",
            "Tag",
            cascadia::JunctionDescriptor::new("post_tags", "post_id", "tag_id"),
        ))
        .relation(
            RelationMetadata::one_to_many("comments", "Comment", "post")
                .cascade(Cascade::ALL)
                .orphan(OrphanAction::Delete),
        )
}

fn tag() -> EntityMetadata {
    EntityMetadata::new("Tag", "tags")
        .column(ColumnMetadata::increment_id("id"))
        .column(ColumnMetadata::new("label", SqlType::Text).nullable())
        .relation(RelationMetadata::many_to_many_inverse("posts", "Post", "tags"))
}

fn comment() -> EntityMetadata {
    EntityMetadata::new("Comment", "comments")
        .column(ColumnMetadata::increment_id("id"))
        .column(ColumnMetadata::new("body", SqlType::Text).nullable())
        .column(ColumnMetadata::new("post_id", SqlType::BigInt).nullable())
        .relation(RelationMetadata::many_to_one("post", "Post", "post_id"))
}

/// Documents are soft-deletable.
fn document() -> EntityMetadata {
    EntityMetadata::new("Document", "documents")
        .column(ColumnMetadata::increment_id("id"))
        .column(ColumnMetadata::new("title", SqlType::Text))
        .column(ColumnMetadata::new("theme", SqlType::Text).nullable().default_value("light"))
        .column(ColumnMetadata::new("created_at", SqlType::Timestamp).create_date())
        .column(ColumnMetadata::new("deleted_at", SqlType::Timestamp).delete_date())
}

pub fn blog_with(post: EntityMetadata, subscribers: Vec<Arc<dyn EntitySubscriber>>) -> Arc<Registry> {
    let mut builder = Registry::builder()
        .entity(category())
        .entity(post)
        .entity(tag())
        .entity(comment())
        .entity(document());
    for subscriber in subscribers {
        builder = builder.subscriber(subscriber);
    }
    Arc::new(builder.build().expect("blog registry is valid"))
}

pub fn blog() -> Arc<Registry> {
    blog_with(post(), Vec::new())
}

pub fn persister_for(registry: Arc<Registry>) -> Persister<MemoryDriver> {
    let driver = MemoryDriver::new(&registry);
    Persister::with_config(registry, driver, PersisterConfig::new().clock(|| NOW))
}

pub fn persister() -> Persister<MemoryDriver> {
    persister_for(blog())
}

pub fn id_of(entity: &EntityRef) -> i64 {
    match entity.get("id") {
        Some(Value::BigInt(id)) => id,
        other => panic!("{} has no generated id: {other:?}", entity.type_name()),
    }
}

/// Index of the first report line starting with `prefix`.
pub fn line_index(report: &PersistReport, prefix: &str) -> usize {
    report
        .plan
        .iter()
        .position(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("no `{prefix}` line in {:?}", report.plan))
}

/// Index of the last report line starting with `prefix`.
pub fn last_line_index(report: &PersistReport, prefix: &str) -> usize {
    report
        .plan
        .iter()
        .rposition(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("no `{prefix}` line in {:?}", report.plan))
}
