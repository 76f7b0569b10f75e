//! Identity map, query memoization and finders.

mod common;

use aggrepo_core::{IdentityKey, SchemaErrorKind, Value};
use aggrepo_query::{Criteria, OrderBy};
use aggrepo_session::{AggregateState, ContextConfig};
use common::Blog;
use std::sync::Arc;
use std::thread;

fn by_author(author: &str) -> Criteria {
    Criteria::new().eq("post", "author", author)
}

#[test]
fn one_instance_per_identity() {
    let blog = Blog::new();
    let id = blog.insert_post("Shared", "ann");

    let a = blog.posts().find_by_id(id, None).unwrap().unwrap();
    let b = blog.posts().find_by_id(id, None).unwrap().unwrap();
    let c = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c[0]));
    assert_eq!(blog.posts().len(), 1);
}

#[test]
fn cached_keys_are_served_without_a_query() {
    let blog = Blog::new();
    let id = blog.insert_post("Cached", "ann");
    blog.posts().find_by_id(id, None).unwrap().unwrap();
    blog.store.reset_stats();

    blog.posts().find_by_id(id, None).unwrap().unwrap();
    assert_eq!(blog.store.stats().queries, 0);
}

#[test]
fn memoized_results_skip_the_store() {
    let blog = Blog::new();
    blog.insert_post("One", "ann");
    blog.insert_post("Two", "ann");
    blog.insert_post("Three", "bob");

    let first = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(blog.posts().thread_session_count(), 1);
    blog.store.reset_stats();

    let second = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    assert_eq!(blog.store.stats().queries, 0);
    assert_eq!(second.len(), 2);
    for (a, b) in first.iter().zip(&second) {
        assert!(Arc::ptr_eq(a, b));
    }
}

#[test]
fn a_memo_naming_an_evicted_aggregate_is_dropped() {
    let blog = Blog::new();
    blog.insert_post("One", "ann");
    blog.insert_post("Two", "ann");
    let first = blog.posts().find_by_criteria(&by_author("ann")).unwrap();

    blog.posts().remove_key(first[0].key_string());
    blog.store.reset_stats();

    let again = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    assert!(blog.store.stats().queries > 0);
    assert_eq!(again.len(), 2);
    assert!(!Arc::ptr_eq(&first[0], &again[0]));
    assert!(Arc::ptr_eq(&first[1], &again[1]));
}

#[test]
fn memos_are_per_thread() {
    let blog = Blog::new();
    blog.insert_post("One", "ann");
    let mine = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    blog.store.reset_stats();

    let posts = Arc::clone(blog.posts());
    let theirs = thread::spawn(move || posts.find_by_criteria(&by_author("ann")).unwrap())
        .join()
        .unwrap();

    assert!(blog.store.stats().queries > 0);
    assert!(Arc::ptr_eq(&mine[0], &theirs[0]));
    assert_eq!(blog.posts().thread_session_count(), 2);

    assert!(blog.posts().remove_thread_session(thread::current().id()));
    assert_eq!(blog.posts().thread_session_count(), 1);
}

#[test]
fn a_newer_row_replaces_the_cached_aggregate() {
    let blog = Blog::new();
    let id = blog.insert_post("Old", "ann");
    let cached = blog.posts().find_by_id(id, None).unwrap().unwrap();

    blog.store
        .update_rows(
            "post",
            [("title", Value::from("New"))],
            &Criteria::new().eq("post", "id", id),
        )
        .unwrap();

    let fresh = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    assert!(!Arc::ptr_eq(&cached, &fresh[0]));
    assert_eq!(fresh[0].root_value("title").unwrap(), Some(Value::from("New")));
    assert!(Arc::ptr_eq(
        &fresh[0],
        &blog.posts().get(fresh[0].key_string()).unwrap()
    ));
}

#[test]
fn an_equal_marker_keeps_the_cached_aggregate() {
    let blog = Blog::new();
    let id = blog.insert_post("Steady", "ann");
    let cached = blog.posts().find_by_id(id, None).unwrap().unwrap();
    cached.set_root_value("title", "Unsaved").unwrap();

    let again = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    assert!(Arc::ptr_eq(&cached, &again[0]));
    assert_eq!(again[0].state(), AggregateState::Dirty);
}

#[test]
fn a_lazily_loaded_root_records_its_marker() {
    let blog = Blog::new();
    let id = blog.insert_post("Lazy", "ann");
    let key = IdentityKey::single("post", "id", id);
    let post = blog.posts().get_or_create(&key).unwrap();
    assert!(blog.posts().marker(&key.render()).is_none());

    post.root_value("title").unwrap();
    assert!(blog.posts().marker(&key.render()).is_some());

    let found = blog.posts().find_by_criteria(&by_author("ann")).unwrap();
    assert!(Arc::ptr_eq(&post, &found[0]));
}

#[test]
fn the_last_added_instance_wins() {
    let blog = Blog::new();
    let id = blog.insert_post("Twice", "ann");
    let first = blog.posts().find_by_id(id, None).unwrap().unwrap();

    let second = blog.posts().restore(&first.snapshot()).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(
        &second,
        &blog.posts().get(first.key_string()).unwrap()
    ));

    assert!(!blog.posts().remove_instance(&first));
    assert!(blog.posts().contains(first.key_string()));
    assert!(blog.posts().remove(&second).is_some());
    assert!(blog.posts().is_empty());
}

#[test]
fn finders_check_the_key_shape() {
    let blog = Blog::new();
    let err = blog
        .posts()
        .find_by_key(&IdentityKey::single("comment", "id", 1_i64))
        .unwrap_err();
    assert_eq!(err.schema_kind(), Some(SchemaErrorKind::Invalid));

    let err = blog.posts().find_by_id(1_i64, Some("title")).unwrap_err();
    assert_eq!(err.schema_kind(), Some(SchemaErrorKind::Invalid));

    assert!(blog.posts().find_by_id(1_i64, Some("id")).unwrap().is_none());
}

#[test]
fn find_all_stops_at_the_limit() {
    let blog = Blog::with_config(ContextConfig::default().select_all_limit(2));
    for title in ["c", "a", "b"] {
        blog.insert_post(title, "ann");
    }

    let all = blog.posts().find_all(&[OrderBy::asc("title")]).unwrap();
    let titles: Vec<_> = all
        .iter()
        .map(|post| post.root_value("title").unwrap().unwrap())
        .collect();
    assert_eq!(titles, vec![Value::from("a"), Value::from("b")]);
}

#[test]
fn counting_and_paging() {
    let blog = Blog::new();
    for i in 0..5 {
        blog.insert_post(&format!("post {i}"), if i % 2 == 0 { "ann" } else { "bob" });
    }

    assert_eq!(blog.posts().count(&Criteria::new()).unwrap(), 5);
    assert_eq!(blog.posts().count(&by_author("ann")).unwrap(), 3);

    let page = blog
        .posts()
        .find_page(&Criteria::new().asc("id"), 2, 2)
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.page, 2);
    assert_eq!(page.items.len(), 2);
    assert_eq!(
        page.items[0].root_value("title").unwrap(),
        Some(Value::from("post 2"))
    );

    let rows = blog.posts().find_raw(&by_author("bob")).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(blog.posts().len(), 2);
}

#[test]
fn find_one_takes_the_first_match() {
    let blog = Blog::new();
    blog.insert_post("first", "ann");
    blog.insert_post("second", "ann");

    let post = blog
        .posts()
        .find_one(&by_author("ann").asc("id"))
        .unwrap()
        .unwrap();
    assert_eq!(post.root_value("title").unwrap(), Some(Value::from("first")));
    assert!(blog.posts().find_one(&by_author("zed")).unwrap().is_none());
}

#[test]
fn create_inserts_and_caches() {
    let blog = Blog::new();
    let post = blog
        .posts()
        .create([("title", Value::from("Fresh")), ("author", Value::from("ann"))])
        .unwrap();

    assert_eq!(post.state(), AggregateState::Loaded);
    assert_eq!(blog.store.row_count("post"), 1);
    let id = post.root_value("id").unwrap().unwrap();
    let found = blog.posts().find_by_id(id, None).unwrap().unwrap();
    assert!(Arc::ptr_eq(&post, &found));
}
