//! End-to-end scenarios through the facade.

mod common;

use aggrepo::{AggregateBlueprint, AggregateState, ContextConfig, Criteria, IdentityKey, Value};
use common::{Fixture, LogCapture, blueprint};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tracing::Level;

#[test]
fn a_child_without_a_relation_loads_empty_with_a_warning() {
    let fixture = Fixture::build(
        ContextConfig::default(),
        AggregateBlueprint::new("blog", "post").child("comment"),
    );
    fixture
        .store
        .insert_row(
            "post",
            [("id", Value::from(42_i64)), ("title", Value::from("Answer"))],
        )
        .unwrap();
    let post = fixture
        .posts()
        .get_or_create(&IdentityKey::single("post", "id", 42_i64))
        .unwrap();

    let logs = LogCapture::default();
    let state = logs.run(|| post.load()).unwrap();

    assert_eq!(state, AggregateState::Loaded);
    assert_eq!(post.state(), AggregateState::Loaded);
    assert!(post.child_keys("comment").unwrap().is_empty());
    let warnings = logs.with_message(Level::WARN, "child relation missing or malformed, skipping");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].fields["child"], "comment");
}

#[test]
fn a_declared_relation_with_no_rows_loads_without_a_warning() {
    let fixture = Fixture::new();
    let id = fixture.post("Quiet");
    let post = fixture
        .posts()
        .get_or_create(&IdentityKey::single("post", "id", id))
        .unwrap();

    let logs = LogCapture::default();
    let state = logs.run(|| post.load()).unwrap();

    assert_eq!(state, AggregateState::Loaded);
    assert!(post.child_keys("comment").unwrap().is_empty());
    assert!(logs
        .with_message(Level::WARN, "child relation missing or malformed, skipping")
        .is_empty());
}

#[test]
fn one_root_write_dirties_exactly_that_column() {
    let fixture = Fixture::new();
    let id = fixture.post("Before");
    let post = fixture.posts().find_by_id(id, None).unwrap().unwrap();
    assert_eq!(post.state(), AggregateState::Loaded);

    post.set_root_value("title", "After").unwrap();

    assert_eq!(post.state(), AggregateState::Dirty);
    let dirty = post.dirty_attributes();
    assert_eq!(dirty.len(), 1);
    let records = &dirty["post"];
    assert_eq!(records.len(), 1);
    let columns = &records[post.key_string()];
    assert_eq!(columns.len(), 1);
    assert_eq!(columns["title"], Value::from("After"));
}

#[test]
fn an_idle_dirty_aggregate_is_cancelled_with_one_lost_work_warning() {
    let fixture = Fixture::build(
        ContextConfig::default().dirty_age(Duration::from_secs(1)),
        blueprint().auto_commit(false),
    );
    let id = fixture.post("Original");
    let post = fixture.posts().find_by_id(id, None).unwrap().unwrap();
    post.set_root_value("title", "Unsaved").unwrap();

    fixture.clock.advance(Duration::from_secs(2));
    let logs = LogCapture::default();
    let report = logs.run(|| fixture.context.gc());

    assert_eq!(report.cancelled, 1);
    assert_eq!(post.state(), AggregateState::Loaded);
    assert!(post.dirty_attributes().is_empty());
    assert_eq!(post.root_value("title").unwrap(), Some(Value::from("Original")));

    let lost = logs.with_message(Level::WARN, "discarding pending changes of idle aggregate");
    assert_eq!(lost.len(), 1);
    assert!(lost[0].fields["dirty"].contains("Unsaved"));
}

#[test]
fn repeating_a_query_in_one_thread_skips_the_store() {
    let fixture = Fixture::new();
    fixture.post("One");
    fixture.post("Two");
    let criteria = Criteria::new().eq("post", "author", "ann");

    let first = fixture.posts().find_by_criteria(&criteria).unwrap();
    let before = fixture.store.stats().queries;
    let second = fixture.posts().find_by_criteria(&criteria).unwrap();

    assert_eq!(fixture.store.stats().queries, before);
    assert_eq!(first.len(), 2);
    assert!(first.iter().zip(&second).all(|(a, b)| Arc::ptr_eq(a, b)));
}

#[test]
fn two_threads_resolving_one_row_leave_one_cached_instance() {
    let fixture = Fixture::new();
    let id = fixture.post("Contended");
    let row = fixture
        .posts()
        .find_raw(&Criteria::new().eq("post", "id", id))
        .unwrap()
        .remove(0);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let posts = Arc::clone(fixture.posts());
            let row = row.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                posts.resolver().resolve(&row).unwrap().unwrap()
            })
        })
        .collect();
    let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(fixture.posts().len(), 1);
    let cached = fixture.posts().get(resolved[0].key_string()).unwrap();
    assert!(resolved.iter().any(|a| Arc::ptr_eq(a, &cached)));
    let found = fixture.posts().find_by_id(id, None).unwrap().unwrap();
    assert!(Arc::ptr_eq(&found, &cached));
}
