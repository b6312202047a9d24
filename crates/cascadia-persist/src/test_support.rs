//! Shared fixtures for unit tests.

use cascadia_core::{
    Cascade, ColumnMetadata, EntityMetadata, JunctionDescriptor, OrphanAction, Registry,
    RelationMetadata, SqlType,
};
use std::sync::Arc;

/// Category -< Post >-< Tag, Post -< Comment.
pub fn blog_registry() -> Registry {
    Registry::builder()
        .entity(
            EntityMetadata::new("Category", "categories")
                .column(ColumnMetadata::increment_id("id"))
                .column(ColumnMetadata::new("name", SqlType::Text).nullable())
                .relation(
                    RelationMetadata::one_to_many("posts", "Post", "category")
                        .cascade(Cascade::SAVE),
                ),
        )
        .entity(
            EntityMetadata::new("Post", "posts")
                .column(ColumnMetadata::increment_id("id"))
                .column(ColumnMetadata::new("title", SqlType::Text).nullable())
                .column(ColumnMetadata::new("version", SqlType::BigInt).version())
                .column(ColumnMetadata::new("category_id", SqlType::BigInt).nullable())
                .relation(
                    RelationMetadata::many_to_one("category", "Category", "category_id")
                        .cascade(Cascade::SAVE),
                )
                .relation(RelationMetadata::many_to_many(
                    "tags",
                    "Tag",
                    JunctionDescriptor::new("post_tags", "post_id", "tag_id"),
                ))
                .relation(
                    RelationMetadata::one_to_many("comments", "Comment", "post")
                        .cascade(Cascade::ALL)
                        .orphan(OrphanAction::Delete),
                ),
        )
        .entity(
            EntityMetadata::new("Tag", "tags")
                .column(ColumnMetadata::increment_id("id"))
                .column(ColumnMetadata::new("label", SqlType::Text).nullable())
                .relation(RelationMetadata::many_to_many_inverse("posts", "Post", "tags")),
        )
        .entity(
            EntityMetadata::new("Comment", "comments")
                .column(ColumnMetadata::increment_id("id"))
                .column(ColumnMetadata::new("body", SqlType::Text).nullable())
                .column(ColumnMetadata::new("post_id", SqlType::BigInt).nullable())
                .relation(RelationMetadata::many_to_one("post", "Post", "post_id")),
        )
        .build()
        .expect("blog registry is valid")
}

pub fn blog() -> Arc<Registry> {
    Arc::new(blog_registry())
}

/// Fixed clock for deterministic timestamps.
pub fn fixed_clock() -> i64 {
    1_700_000_000_000_000
}
