mod common;

use asupersync::runtime::RuntimeBuilder;
use cascadia::StatementKind;
use cascadia::prelude::*;
use common::{NOW, expect_err, id_of, last_line_index, line_index, persister, persister_for, unwrap_outcome};
use std::sync::Arc;

/// Articles filed under any number of categories.
fn catalog() -> Arc<Registry> {
    let registry = Registry::builder()
        .entity(
            EntityMetadata::new("Category", "categories")
                .column(ColumnMetadata::increment_id("id"))
                .column(ColumnMetadata::new("name", SqlType::Text))
                .relation(RelationMetadata::many_to_many_inverse("articles", "Article", "categories")),
        )
        .entity(
            EntityMetadata::new("Article", "articles")
                .column(ColumnMetadata::increment_id("id"))
                .column(ColumnMetadata::new("title", SqlType::Text))
                .relation(RelationMetadata::many_to_many(
                    "categories",
                    "Category",
                    cascadia::JunctionDescriptor::new("article_categories", "article_id", "category_id"),
                )),
        )
        .build()
        .expect("catalog registry is valid");
    Arc::new(registry)
}

#[test]
fn removal_deletes_referencing_rows_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let first = EntityRef::new(Entity::new("Category").with("name", "First"));
        let second = EntityRef::new(Entity::new("Category").with("name", "Second"));
        let tag = EntityRef::new(Entity::new("Tag").with("label", "shared"));
        let post = EntityRef::new(
            Entity::new("Post")
                .with("title", "Linked")
                .with_ref("category", Some(first.clone()))
                .with_refs("tags", vec![tag.clone()]),
        );
        unwrap_outcome(persister.save(&cx, &[second.clone(), tag.clone(), post.clone()]).await);
        assert_eq!(persister.driver().row_count("post_tags"), 1);

        // Input order deliberately lists the referenced category last.
        let report = unwrap_outcome(persister.remove(&cx, &[second.clone(), post.clone(), first.clone()]).await);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.junction_removed, 1);
        assert!(line_index(&report, "DELETE post_tags") < line_index(&report, "DELETE posts"));
        assert!(line_index(&report, "DELETE posts") < last_line_index(&report, "DELETE categories"));

        assert_eq!(persister.driver().row_count("categories"), 0);
        assert_eq!(persister.driver().row_count("posts"), 0);
        assert_eq!(persister.driver().row_count("post_tags"), 0);
        assert_eq!(persister.driver().row_count("tags"), 1);
        assert!(post.read().baseline().is_none());
        assert_eq!(post.get("id"), None);
    });
}

#[test]
fn junction_rows_go_before_the_rows_they_link() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister_for(catalog());

    rt.block_on(async {
        let first = EntityRef::new(Entity::new("Category").with("name", "first"));
        let second = EntityRef::new(Entity::new("Category").with("name", "second"));
        unwrap_outcome(persister.save(&cx, &[first.clone(), second.clone()]).await);
        let article = EntityRef::new(
            Entity::new("Article")
                .with("title", "Filed twice")
                .with_refs("categories", vec![first.clone(), second.clone()]),
        );
        unwrap_outcome(persister.save(&cx, &[article.clone()]).await);
        assert_eq!(persister.driver().row_count("article_categories"), 2);

        let report = unwrap_outcome(persister.remove(&cx, &[second, article, first]).await);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.junction_removed, 2);
        assert!(last_line_index(&report, "DELETE article_categories") < line_index(&report, "DELETE categories"));
        assert!(last_line_index(&report, "DELETE article_categories") < line_index(&report, "DELETE articles"));
        assert_eq!(persister.driver().row_count("article_categories"), 0);
        assert_eq!(persister.driver().row_count("categories"), 0);
        assert_eq!(persister.driver().row_count("articles"), 0);
    });
}

#[test]
fn stale_copy_fails_optimistic_lock() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let post = EntityRef::new(Entity::new("Post").with("title", "Shared"));
        unwrap_outcome(persister.save(&cx, &[post.clone()]).await);
        let key = Identifier::single("id", id_of(&post));

        let options = FindOptions::new();
        let fresh = unwrap_outcome(persister.find_by_id(&cx, "Post", &key, &options).await).expect("first copy");
        let stale = unwrap_outcome(persister.find_by_id(&cx, "Post", &key, &options).await).expect("second copy");

        fresh.set("title", "First writer");
        unwrap_outcome(persister.save(&cx, &[fresh.clone()]).await);
        assert_eq!(fresh.get("version"), Some(Value::BigInt(2)));

        stale.set("title", "Second writer");
        let err = expect_err(persister.save(&cx, &[stale.clone()]).await);
        let Error::OptimisticLock(lock) = &err else {
            panic!("expected optimistic lock error, got {err:?}");
        };
        assert_eq!(lock.entity, "Post");
        assert!(err.is_retryable());

        let stored = persister.driver().fetch("posts", &key).expect("post row");
        assert_eq!(stored.get("version"), Some(&Value::BigInt(2)));
        assert_eq!(stored.get("title"), Some(&Value::Text("First writer".into())));
        assert_eq!(stale.get("version"), Some(Value::BigInt(1)));

        let err = expect_err(persister.remove(&cx, &[stale]).await);
        assert!(matches!(err, Error::OptimisticLock(_)), "got {err:?}");
        assert_eq!(persister.driver().row_count("posts"), 1);
    });
}

#[test]
fn soft_removed_rows_are_hidden_until_recovered() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let document = EntityRef::new(Entity::new("Document").with("title", "Quarterly"));
        unwrap_outcome(persister.save(&cx, &[document.clone()]).await);
        let key = Identifier::single("id", id_of(&document));

        let report = unwrap_outcome(persister.soft_remove(&cx, &[document.clone()]).await);
        assert_eq!(report.soft_deleted, 1);
        assert_eq!(document.get("deleted_at"), Some(Value::Timestamp(NOW)));
        assert_eq!(persister.driver().row_count("documents"), 1);

        let hidden = unwrap_outcome(persister.find_by_id(&cx, "Document", &key, &FindOptions::new()).await);
        assert!(hidden.is_none());
        let visible = FindOptions::new().with_deleted(true);
        let found = unwrap_outcome(persister.find_by_id(&cx, "Document", &key, &visible).await);
        assert!(found.is_some());

        let report = unwrap_outcome(persister.recover(&cx, &[document.clone()]).await);
        assert_eq!(report.recovered, 1);
        assert_eq!(document.get("deleted_at"), Some(Value::Null));
        let found = unwrap_outcome(persister.find_by_id(&cx, "Document", &key, &FindOptions::new()).await);
        assert!(found.is_some());
    });
}

#[test]
fn remove_soft_deletes_unless_permanent() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let document = EntityRef::new(Entity::new("Document").with("title", "Archive"));
        unwrap_outcome(persister.save(&cx, &[document.clone()]).await);

        let report = unwrap_outcome(persister.remove(&cx, &[document.clone()]).await);
        assert_eq!(report.soft_deleted, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(persister.driver().row_count("documents"), 1);

        let permanent = PersistOptions::default().permanent(true);
        let report = unwrap_outcome(persister.remove_with(&cx, &[document], &permanent).await);
        assert_eq!(report.deleted, 1);
        assert_eq!(persister.driver().row_count("documents"), 0);
    });
}

#[test]
fn soft_remove_needs_a_delete_date_column() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let tag = EntityRef::new(Entity::new("Tag").with("label", "permanent"));
        unwrap_outcome(persister.save(&cx, &[tag.clone()]).await);
        let before = persister.driver().round_trips();

        let err = expect_err(persister.soft_remove(&cx, &[tag.clone()]).await);
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        let err = expect_err(persister.recover(&cx, &[tag]).await);
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert_eq!(persister.driver().round_trips(), before);
    });
}

#[test]
fn removing_an_unsaved_entity_is_a_validation_error() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let tag = EntityRef::new(Entity::new("Tag").with("label", "ghost"));
        let err = expect_err(persister.remove(&cx, &[tag]).await);
        assert!(matches!(err, Error::Validation(_)), "got {err:?}");
        assert_eq!(persister.driver().round_trips(), 0);
    });
}

#[test]
fn cascaded_removal_takes_children_along() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let comments: Vec<EntityRef> = ["first", "second"]
            .iter()
            .map(|body| EntityRef::new(Entity::new("Comment").with("body", *body)))
            .collect();
        let post = EntityRef::new(
            Entity::new("Post")
                .with("title", "Discussed")
                .with_refs("comments", comments.clone()),
        );
        unwrap_outcome(persister.save(&cx, &[post.clone()]).await);
        assert_eq!(persister.driver().row_count("comments"), 2);
        let post_id = id_of(&post);
        for comment in &comments {
            assert_eq!(comment.get("post_id"), Some(Value::BigInt(post_id)));
        }

        let report = unwrap_outcome(persister.remove(&cx, &[post]).await);
        assert_eq!(report.deleted, 3);
        assert!(last_line_index(&report, "DELETE comments") < line_index(&report, "DELETE posts"));
        assert_eq!(persister.driver().row_count("comments"), 0);
        assert_eq!(persister.driver().row_count("posts"), 0);
    });
}

#[test]
fn dropped_children_are_deleted_as_orphans() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let persister = persister();

    rt.block_on(async {
        let post = EntityRef::new(
            Entity::new("Post").with("title", "Pruned").with_refs(
                "comments",
                vec![
                    EntityRef::new(Entity::new("Comment").with("body", "keep")),
                    EntityRef::new(Entity::new("Comment").with("body", "drop")),
                ],
            ),
        );
        unwrap_outcome(persister.save(&cx, &[post.clone()]).await);

        let key = Identifier::single("id", id_of(&post));
        let loaded = unwrap_outcome(
            persister
                .find_by_id(&cx, "Post", &key, &FindOptions::new().relation("comments"))
                .await,
        )
        .expect("post row");
        let kept: Vec<EntityRef> = loaded
            .read()
            .references("comments")
            .unwrap_or_default()
            .iter()
            .filter(|c| c.get("body") == Some(Value::Text("keep".into())))
            .cloned()
            .collect();
        assert_eq!(kept.len(), 1);
        loaded.write().set_refs("comments", kept);
        persister.driver().clear_log();

        let report = unwrap_outcome(persister.save(&cx, &[loaded.clone()]).await);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.inserted, 0);
        assert_eq!(persister.driver().count(StatementKind::Delete), 1);
        let bodies: Vec<Value> = persister
            .driver()
            .rows("comments")
            .into_iter()
            .filter_map(|row| row.get("body").cloned())
            .collect();
        assert_eq!(bodies, vec![Value::Text("keep".into())]);

        let resaved = unwrap_outcome(persister.save(&cx, &[loaded]).await);
        assert!(resaved.is_empty());
    });
}
