mod common;

use asupersync::CancelReason;
use asupersync::runtime::RuntimeBuilder;
use cascadia::{BoxFuture, Predicate, StatementKind};
use cascadia::prelude::*;
use common::{blog_with, expect_err, id_of, persister_for, post, unwrap_outcome};
use std::sync::{Arc, Mutex, PoisonError};

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, line: String) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(line);
}

fn lines(log: &Log) -> Vec<String> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Upper-cases titles on insert and marks them on update.
struct TitleListener {
    log: Log,
}

impl EntityListener for TitleListener {
    fn before_insert(&self, entity: &mut Entity) -> Result<()> {
        push(&self.log, "listener:before_insert".to_string());
        let upper = entity.value("title").and_then(Value::as_str).map(str::to_uppercase);
        if let Some(upper) = upper {
            entity.set("title", upper);
        }
        Ok(())
    }

    fn after_insert(&self, entity: &mut Entity) -> Result<()> {
        let id = entity.value("id").and_then(Value::as_i64);
        push(&self.log, format!("listener:after_insert:{id:?}"));
        Ok(())
    }

    fn before_update(&self, entity: &mut Entity) -> Result<()> {
        push(&self.log, "listener:before_update".to_string());
        let edited = entity.value("title").and_then(Value::as_str).map(|t| format!("{t} (edited)"));
        if let Some(edited) = edited {
            entity.set("title", edited);
        }
        Ok(())
    }
}

/// Records every event and, after a post insert, how many categories the
/// transaction can already see.
struct Recorder {
    log: Log,
}

impl EntitySubscriber for Recorder {
    fn on_event<'a>(&'a self, event: &'a HookEvent<'a>) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            let type_name = event.entity.type_name();
            push(&self.log, format!("subscriber:{type_name}:{}", event.point.as_str()));
            if type_name == "Post" && event.point == HookPoint::AfterInsert {
                let all = Predicate::And(Vec::new());
                match event.queries.select(event.cx, "categories", &all).await {
                    Outcome::Ok(rows) => push(&self.log, format!("categories visible: {}", rows.len())),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Outcome::Ok(())
        })
    }
}

/// Refuses to let tags be removed.
struct Veto;

impl EntitySubscriber for Veto {
    fn listen_to(&self) -> Option<&str> {
        Some("Tag")
    }

    fn on_event<'a>(&'a self, event: &'a HookEvent<'a>) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            if event.point == HookPoint::BeforeRemove {
                return Outcome::Err(Error::Custom("tags are forever".to_string()));
            }
            Outcome::Ok(())
        })
    }
}

/// Cancels the call once a post has been written.
struct AbortAfterPost;

impl EntitySubscriber for AbortAfterPost {
    fn listen_to(&self) -> Option<&str> {
        Some("Post")
    }

    fn on_event<'a>(&'a self, event: &'a HookEvent<'a>) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            if event.point == HookPoint::AfterInsert {
                return Outcome::Cancelled(CancelReason::user("request aborted"));
            }
            Outcome::Ok(())
        })
    }
}

fn hooked(log: &Log) -> Persister<cascadia_memory::MemoryDriver> {
    let listener: Arc<dyn EntityListener> = Arc::new(TitleListener { log: log.clone() });
    let subscribers: Vec<Arc<dyn EntitySubscriber>> = vec![Arc::new(Recorder { log: log.clone() }), Arc::new(Veto)];
    persister_for(blog_with(post().listener(listener), subscribers))
}

#[test]
fn hooks_fire_in_execution_order() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let log = Log::default();
    let persister = hooked(&log);

    rt.block_on(async {
        let category = EntityRef::new(Entity::new("Category").with("name", "Hooks"));
        let post = EntityRef::new(
            Entity::new("Post")
                .with("title", "quiet")
                .with_ref("category", Some(category)),
        );
        unwrap_outcome(persister.save(&cx, &[post.clone()]).await);

        let id = id_of(&post);
        assert_eq!(
            lines(&log),
            vec![
                "subscriber:Category:before_insert".to_string(),
                "subscriber:Category:after_insert".to_string(),
                "listener:before_insert".to_string(),
                "subscriber:Post:before_insert".to_string(),
                format!("listener:after_insert:{:?}", Some(id)),
                "subscriber:Post:after_insert".to_string(),
                "categories visible: 1".to_string(),
            ]
        );
    });
}

#[test]
fn before_hooks_can_change_what_is_written() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let log = Log::default();
    let persister = hooked(&log);

    rt.block_on(async {
        let post = EntityRef::new(Entity::new("Post").with("title", "shout"));
        unwrap_outcome(persister.save(&cx, &[post.clone()]).await);
        let key = Identifier::single("id", id_of(&post));
        let stored = persister.driver().fetch("posts", &key).expect("post row");
        assert_eq!(stored.get("title"), Some(&Value::Text("SHOUT".into())));

        post.set("title", "Calm");
        unwrap_outcome(persister.save(&cx, &[post.clone()]).await);
        let stored = persister.driver().fetch("posts", &key).expect("post row");
        assert_eq!(stored.get("title"), Some(&Value::Text("Calm (edited)".into())));
        assert_eq!(post.get("title"), Some(Value::Text("Calm (edited)".into())));

        // Nothing changed, so no update and no update hooks.
        log.lock().unwrap_or_else(PoisonError::into_inner).clear();
        let report = unwrap_outcome(persister.save(&cx, &[post]).await);
        assert!(report.is_empty());
        assert!(lines(&log).is_empty());
    });
}

#[test]
fn disabled_listeners_are_skipped() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let log = Log::default();
    let persister = hooked(&log);

    rt.block_on(async {
        let post = EntityRef::new(Entity::new("Post").with("title", "as is"));
        let options = PersistOptions::default().listeners(false);
        unwrap_outcome(persister.save_with(&cx, &[post.clone()], &options).await);

        assert!(lines(&log).is_empty());
        let stored = persister
            .driver()
            .fetch("posts", &Identifier::single("id", id_of(&post)))
            .expect("post row");
        assert_eq!(stored.get("title"), Some(&Value::Text("as is".into())));
    });
}

#[test]
fn failing_hook_aborts_the_call() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let log = Log::default();
    let persister = hooked(&log);

    rt.block_on(async {
        let tag = EntityRef::new(Entity::new("Tag").with("label", "sticky"));
        unwrap_outcome(persister.save(&cx, &[tag.clone()]).await);

        let err = expect_err(persister.remove(&cx, &[tag.clone()]).await);
        assert!(matches!(&err, Error::Custom(message) if message == "tags are forever"), "got {err:?}");
        assert_eq!(persister.driver().row_count("tags"), 1);
        assert!(!persister.driver().in_transaction());
        assert!(tag.get("id").is_some());

        let options = PersistOptions::default().listeners(false);
        unwrap_outcome(persister.remove_with(&cx, &[tag], &options).await);
        assert_eq!(persister.driver().row_count("tags"), 0);
    });
}

#[test]
fn cancellation_rolls_back_like_a_failure() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let subscribers: Vec<Arc<dyn EntitySubscriber>> = vec![Arc::new(AbortAfterPost)];
    let persister = persister_for(blog_with(post(), subscribers));

    rt.block_on(async {
        let category = EntityRef::new(Entity::new("Category").with("name", "Drafts"));
        let post = EntityRef::new(
            Entity::new("Post")
                .with("title", "unfinished")
                .with_ref("category", Some(category.clone())),
        );
        let outcome = persister.save(&cx, &[post.clone()]).await;
        assert!(outcome.is_cancelled(), "got {outcome:?}");

        assert_eq!(category.get("id"), None);
        assert_eq!(post.get("id"), None);
        assert_eq!(persister.driver().row_count("categories"), 0);
        assert_eq!(persister.driver().row_count("posts"), 0);
        assert!(!persister.driver().in_transaction());
        assert_eq!(persister.driver().count(StatementKind::Rollback), 1);
    });
}
