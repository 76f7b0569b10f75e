//! Invariants that hold across operation sequences.

mod common;

use aggrepo::{AggregateState, ContextConfig, Criteria, IdentityKey, OrderBy, Value};
use common::{Fixture, blueprint, implied_state};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn state_always_matches_the_contents() {
    let fixture = Fixture::new();
    let id = fixture.post("Tracked");
    fixture.comment(id, "first");
    let post = fixture
        .posts()
        .get_or_create(&IdentityKey::single("post", "id", id))
        .unwrap();
    let check = |expected: AggregateState| {
        assert_eq!(post.state(), expected);
        assert_eq!(implied_state(&post.snapshot()), expected);
    };

    check(AggregateState::New);
    post.load().unwrap();
    check(AggregateState::Loaded);

    let comment = post.child_keys("comment").unwrap().remove(0);
    post.set_child_value("comment", &comment, "body", "edited")
        .unwrap();
    check(AggregateState::Dirty);
    post.commit().unwrap();
    check(AggregateState::Loaded);

    post.set_root_value("title", "Renamed").unwrap();
    check(AggregateState::Dirty);
    post.cancel();
    check(AggregateState::Loaded);

    post.unload();
    check(AggregateState::Unloaded);
    post.root_value("title").unwrap();
    check(AggregateState::Loaded);

    post.create_child("comment", [("body", Value::from("second"))])
        .unwrap();
    check(AggregateState::Loaded);
}

#[test]
fn commit_and_cancel_are_idempotent_outside_dirty() {
    let fixture = Fixture::new();
    let id = fixture.post("Idle");
    let post = fixture.posts().find_by_id(id, None).unwrap().unwrap();
    let before = fixture.store.stats();

    for _ in 0..3 {
        assert!(!post.commit().unwrap());
        assert!(!post.cancel());
        assert_eq!(post.state(), AggregateState::Loaded);
    }
    assert_eq!(fixture.store.stats(), before);
}

#[test]
fn concurrent_finders_never_duplicate_an_identity() {
    let fixture = Fixture::new();
    for i in 0..10 {
        let id = fixture.post(&format!("post {i}"));
        fixture.comment(id, "c");
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let posts = Arc::clone(fixture.posts());
            thread::spawn(move || {
                for _ in 0..5 {
                    posts.find_all(&[OrderBy::asc("id")]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let keys = fixture.posts().keys();
    let unique: HashSet<_> = keys.iter().collect();
    assert_eq!(keys.len(), 10);
    assert_eq!(unique.len(), 10);

    let all = fixture.posts().find_all(&[]).unwrap();
    for aggregate in &all {
        let cached = fixture.posts().get(aggregate.key_string()).unwrap();
        assert!(Arc::ptr_eq(aggregate, &cached));
    }
}

#[test]
fn memoized_results_only_name_cached_aggregates() {
    let fixture = Fixture::new();
    for title in ["a", "b", "c"] {
        fixture.post(title);
    }
    let criteria = Criteria::new().eq("post", "author", "ann");
    let first = fixture.posts().find_by_criteria(&criteria).unwrap();

    fixture.posts().remove(&first[1]);
    let second = fixture.posts().find_by_criteria(&criteria).unwrap();
    assert_eq!(second.len(), 3);
    for aggregate in &second {
        let cached = fixture.posts().get(aggregate.key_string()).unwrap();
        assert!(Arc::ptr_eq(aggregate, &cached));
    }
    assert!(!Arc::ptr_eq(&first[1], &second[1]));
}

#[test]
fn fingerprints_ignore_predicate_order() {
    let a = Criteria::new()
        .select_from("post")
        .eq("post", "author", "ann")
        .eq("post", "title", "x");
    let b = Criteria::new()
        .eq("post", "title", "x")
        .select_from("post")
        .eq("post", "author", "ann");
    assert_eq!(a.fingerprint(), b.fingerprint());

    let c = a.clone().eq("post", "title", "y");
    assert_ne!(a.fingerprint(), c.fingerprint());
    assert_ne!(a.fingerprint(), a.clone().limit(1).fingerprint());
}

#[test]
fn equal_fingerprints_share_one_memo_entry() {
    let fixture = Fixture::new();
    fixture.post("only");
    let a = Criteria::new()
        .eq("post", "author", "ann")
        .eq("post", "title", "only");
    let b = Criteria::new()
        .eq("post", "title", "only")
        .eq("post", "author", "ann");

    fixture.posts().find_by_criteria(&a).unwrap();
    let before = fixture.store.stats().queries;
    fixture.posts().find_by_criteria(&b).unwrap();
    assert_eq!(fixture.store.stats().queries, before);
}

fn rank(state: Option<AggregateState>) -> u8 {
    match state {
        Some(AggregateState::Dirty) => 0,
        Some(AggregateState::Loaded) => 1,
        Some(AggregateState::New | AggregateState::Unloaded) => 2,
        None => 3,
    }
}

#[test]
fn aging_only_moves_forward_without_access() {
    let fixture = Fixture::build(
        ContextConfig::default()
            .dirty_age(Duration::from_secs(5))
            .loaded_age(Duration::from_secs(10))
            .new_age(Duration::from_secs(20)),
        blueprint(),
    );
    let id = fixture.post("Ageing");
    let post = fixture.posts().find_by_id(id, None).unwrap().unwrap();
    post.set_root_value("title", "Pending").unwrap();
    let key = post.key_string().to_string();

    let mut ranks = vec![rank(Some(post.state()))];
    for _ in 0..60 {
        fixture.clock.advance(Duration::from_secs(1));
        fixture.context.gc();
        let state = fixture.posts().get(&key).map(|a| a.state());
        ranks.push(rank(state));
    }

    assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(ranks.first(), Some(&0));
    assert_eq!(ranks.last(), Some(&3));
}

#[test]
fn delimiter_text_in_a_value_does_not_hit_another_querys_memo() {
    let fixture = Fixture::new();
    fixture
        .store
        .insert_row(
            "post",
            [("title", Value::from("y")), ("author", Value::from("x"))],
        )
        .unwrap();
    let two = Criteria::new()
        .select_from("post")
        .eq("post", "author", "x")
        .eq("post", "title", "y");
    let one = Criteria::new()
        .select_from("post")
        .eq("post", "author", "x);post.title=>post:title:=:TEXT(y");

    assert_eq!(fixture.posts().find_by_criteria(&two).unwrap().len(), 1);
    assert!(fixture.posts().find_by_criteria(&one).unwrap().is_empty());
}
